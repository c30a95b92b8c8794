//! Step executor: turns saga-emitted `Call<step>` commands into outbound
//! HTTP requests and publishes `<step>Succeeded` / `<step>Failed` back into
//! the dispatcher.
//!
//! The executor never retries locally; retry policy lives in the saga engine.
//! Timeouts and transport errors are classified as failures like any non-2xx
//! status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

use dispatcher::{DispatchError, Dispatcher, EventEnvelope, EventHandler};
use saga::{SagaDefinition, StepCommand, StepFailed, StepSucceeded};

/// Errors raised while wiring up step handlers.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A declared step has no configured endpoint.
    #[error("no endpoint configured for step '{0}'")]
    MissingEndpoint(String),
}

/// Handler for one step's `Call<step>` commands.
pub struct StepCallHandler {
    client: Client,
    dispatcher: Dispatcher,
    step_name: String,
    succeeded_event_type: String,
    failed_event_type: String,
    url: String,
    timeout: Duration,
}

impl StepCallHandler {
    /// Creates a handler that POSTs this step's payload to `url`.
    pub fn new(
        client: Client,
        dispatcher: Dispatcher,
        step_name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let step_name = step_name.into();
        Self {
            client,
            dispatcher,
            succeeded_event_type: format!("{step_name}Succeeded"),
            failed_event_type: format!("{step_name}Failed"),
            step_name,
            url: url.into(),
            timeout,
        }
    }

    /// Issues the HTTP call; `Ok` carries the response body, `Err` a
    /// description of the failure.
    async fn call(&self, payload: &serde_json::Value) -> Result<String, String> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }

        response.text().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl EventHandler for StepCallHandler {
    #[tracing::instrument(skip(self, event), fields(step = %self.step_name, correlation_id = %event.correlation_id))]
    async fn handle(&self, event: EventEnvelope) -> Result<(), DispatchError> {
        let command: StepCommand = event
            .decode()
            .map_err(|e| DispatchError::handler(&event.event_type, e))?;

        metrics::counter!("step_http_requests_total").increment(1);

        let outcome = match self.call(&command.payload).await {
            Ok(response) => {
                tracing::debug!("step call succeeded");
                EventEnvelope::new(
                    &self.succeeded_event_type,
                    command.correlation_id,
                    &StepSucceeded {
                        correlation_id: command.correlation_id,
                        step: self.step_name.clone(),
                        response,
                    },
                )
            }
            Err(error) => {
                metrics::counter!("step_http_failures_total").increment(1);
                tracing::warn!(%error, retry_count = command.retry_count, "step call failed");
                EventEnvelope::new(
                    &self.failed_event_type,
                    command.correlation_id,
                    &StepFailed {
                        correlation_id: command.correlation_id,
                        step: self.step_name.clone(),
                        error,
                        retry_count: command.retry_count,
                    },
                )
            }
        }
        .map_err(|e| DispatchError::handler(&event.event_type, e))?;

        // Detached: awaiting delivery of a same-correlation event here would
        // block this handler's own worker queue.
        self.dispatcher.publish_detached(outcome);
        Ok(())
    }
}

/// Subscribes one [`StepCallHandler`] per declared step.
///
/// `endpoints` maps step names to URLs; every step in the definition must
/// have one.
pub fn register_step_handlers(
    dispatcher: &Dispatcher,
    definition: &SagaDefinition,
    endpoints: &HashMap<String, String>,
    client: Client,
) -> Result<(), ExecutorError> {
    for step in definition.steps() {
        let url = endpoints
            .get(step.name)
            .ok_or_else(|| ExecutorError::MissingEndpoint(step.name.to_string()))?;

        let handler = StepCallHandler::new(
            client.clone(),
            dispatcher.clone(),
            step.name,
            url.clone(),
            step.timeout,
        );
        dispatcher.subscribe(step.command_event_type(), Arc::new(handler));
    }
    Ok(())
}
