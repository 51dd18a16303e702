//! Completion signal channel
//!
//! Stage workers publish a signal when a stage finishes or an attempt fails;
//! the orchestrator subscribes and advances the workflow. Workers and the
//! orchestrator may run in different processes, so the channel is a port:
//!
//! - [`LocalSignalChannel`] fans signals out inside one process only
//! - `infra_db::PostgresSignalChannel` crosses process boundaries
//!
//! Delivery is at-least-once; subscribers must tolerate duplicates.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use core_kernel::{ApplicationId, DomainPort, PortError};
use domain_application::Stage;

/// A message on the completion channel
///
/// Stage names travel as strings so that a receiver can reject names it
/// does not know instead of failing to decode the whole message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum StepSignal {
    #[serde(rename = "step:complete", rename_all = "camelCase")]
    Complete {
        application_id: ApplicationId,
        current_stage: String,
        data: Value,
    },
    #[serde(rename = "step:error", rename_all = "camelCase")]
    Error {
        application_id: ApplicationId,
        stage: String,
        error: String,
        attempt: u32,
        /// True when the failed attempt was the last one allowed
        exhausted: bool,
    },
}

impl StepSignal {
    pub fn complete(application_id: ApplicationId, stage: Stage, data: Value) -> Self {
        StepSignal::Complete {
            application_id,
            current_stage: stage.as_str().to_string(),
            data,
        }
    }

    pub fn error(
        application_id: ApplicationId,
        stage: Stage,
        error: impl Into<String>,
        attempt: u32,
        exhausted: bool,
    ) -> Self {
        StepSignal::Error {
            application_id,
            stage: stage.as_str().to_string(),
            error: error.into(),
            attempt,
            exhausted,
        }
    }

    pub fn application_id(&self) -> ApplicationId {
        match self {
            StepSignal::Complete { application_id, .. } | StepSignal::Error { application_id, .. } => {
                *application_id
            }
        }
    }

    /// Event name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            StepSignal::Complete { .. } => "step:complete",
            StepSignal::Error { .. } => "step:error",
        }
    }
}

/// Stream of received signals
pub type SignalStream = BoxStream<'static, Result<StepSignal, PortError>>;

/// Publish/subscribe transport for step signals
#[async_trait]
pub trait SignalChannel: DomainPort {
    /// Publishes a signal to every current subscriber
    async fn publish(&self, signal: &StepSignal) -> Result<(), PortError>;

    /// Subscribes to signals published from now on
    async fn subscribe(&self) -> Result<SignalStream, PortError>;
}

/// In-process broadcast channel
///
/// Instances do not share anything: a worker and an orchestrator holding
/// different `LocalSignalChannel`s never see each other's signals.
///
/// The buffer is bounded. A subscriber that falls more than `capacity`
/// signals behind loses the oldest ones; its stream then yields one error
/// naming how many were dropped and continues with the oldest retained
/// signal. Applications whose completion was dropped stay in flight until
/// the orchestrator resumes them.
#[derive(Debug, Clone)]
pub struct LocalSignalChannel {
    sender: broadcast::Sender<StepSignal>,
}

impl LocalSignalChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalSignalChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl DomainPort for LocalSignalChannel {}

#[async_trait]
impl SignalChannel for LocalSignalChannel {
    async fn publish(&self, signal: &StepSignal) -> Result<(), PortError> {
        if self.sender.send(signal.clone()).is_err() {
            warn!(
                application_id = %signal.application_id(),
                event = signal.name(),
                "No subscribers for step signal"
            );
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<SignalStream, PortError> {
        let receiver = self.sender.subscribe();
        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(signal) => return Some((Ok(signal), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Signal subscriber lagged behind");
                        let error = PortError::internal(format!(
                            "signal subscriber lagged, {} signals dropped",
                            skipped
                        ));
                        return Some((Err(error), receiver));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_wire_format() {
        let id = ApplicationId::new();
        let signal = StepSignal::complete(id, Stage::Dmv, json!({"points": 0}));
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["event"], "step:complete");
        assert_eq!(value["currentStage"], "dmv");
        assert_eq!(value["data"]["points"], 0);

        let back: StepSignal = serde_json::from_value(value).unwrap();
        assert_eq!(back, signal);
    }

    #[test]
    fn test_unknown_stage_still_decodes() {
        let id = ApplicationId::new();
        let value = json!({
            "event": "step:complete",
            "applicationId": id,
            "currentStage": "appraisal",
            "data": null
        });
        let signal: StepSignal = serde_json::from_value(value).unwrap();
        assert!(matches!(signal, StepSignal::Complete { ref current_stage, .. } if current_stage == "appraisal"));
    }

    #[tokio::test]
    async fn test_local_channel_fans_out() {
        let channel = LocalSignalChannel::default();
        let mut first = channel.subscribe().await.unwrap();
        let mut second = channel.subscribe().await.unwrap();

        let signal = StepSignal::error(ApplicationId::new(), Stage::Credit, "timeout", 3, false);
        channel.publish(&signal).await.unwrap();

        assert_eq!(first.next().await.unwrap().unwrap(), signal);
        assert_eq!(second.next().await.unwrap().unwrap(), signal);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_sees_an_error() {
        let channel = LocalSignalChannel::new(2);
        let mut stream = channel.subscribe().await.unwrap();
        let id = ApplicationId::new();
        let signals: Vec<_> = domain_application::STAGE_ORDER
            .iter()
            .map(|stage| StepSignal::complete(id, *stage, Value::Null))
            .collect();
        for signal in &signals {
            channel.publish(signal).await.unwrap();
        }

        let lagged = stream.next().await.unwrap().unwrap_err();
        assert!(lagged.to_string().contains("3 signals dropped"));
        assert_eq!(stream.next().await.unwrap().unwrap(), signals[3]);
        assert_eq!(stream.next().await.unwrap().unwrap(), signals[4]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let channel = LocalSignalChannel::default();
        let signal = StepSignal::complete(ApplicationId::new(), Stage::Policy, Value::Null);
        assert!(channel.publish(&signal).await.is_ok());
        assert_eq!(channel.subscriber_count(), 0);
    }
}
