//! The reference OrderProcessing workflow: create → process → ship.

use std::time::Duration;

use crate::definition::{SagaDefinition, StepDescriptor};

/// The workflow name.
pub const WORKFLOW: &str = "OrderProcessing";

/// Step name: create the order downstream.
pub const STEP_CREATE_ORDER: &str = "CreateOrder";

/// Step name: process (charge) the order.
pub const STEP_PROCESS_ORDER: &str = "ProcessOrder";

/// Step name: ship the order.
pub const STEP_SHIP_ORDER: &str = "ShipOrder";

/// `step_data` key for the create step's payload.
pub const KEY_ORDER_CREATED: &str = "order-created";

/// `step_data` key for the process step's payload.
pub const KEY_ORDER_PROCESSED: &str = "order-processed";

/// `step_data` key for the ship step's payload.
pub const KEY_ORDER_SHIPPED: &str = "order-shipped";

/// Builds the OrderProcessing definition.
///
/// The process step gets the longer payment-style timeout.
pub fn definition() -> SagaDefinition {
    SagaDefinition::new(
        WORKFLOW,
        vec![
            StepDescriptor {
                name: STEP_CREATE_ORDER,
                message_key: KEY_ORDER_CREATED,
                max_retries: 3,
                timeout: Duration::from_secs(5),
            },
            StepDescriptor {
                name: STEP_PROCESS_ORDER,
                message_key: KEY_ORDER_PROCESSED,
                max_retries: 3,
                timeout: Duration::from_secs(10),
            },
            StepDescriptor {
                name: STEP_SHIP_ORDER,
                message_key: KEY_ORDER_SHIPPED,
                max_retries: 3,
                timeout: Duration::from_secs(5),
            },
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_declares_three_steps_in_order() {
        let definition = definition();
        assert_eq!(definition.workflow, WORKFLOW);
        assert_eq!(definition.len(), 3);
        assert_eq!(definition.step(0).name, STEP_CREATE_ORDER);
        assert_eq!(definition.step(1).name, STEP_PROCESS_ORDER);
        assert_eq!(definition.step(2).name, STEP_SHIP_ORDER);
    }

    #[test]
    fn process_step_has_payment_timeout() {
        let definition = definition();
        assert_eq!(definition.step(1).timeout, Duration::from_secs(10));
        assert_eq!(definition.step(0).timeout, Duration::from_secs(5));
    }
}
