//! Fire-and-forget Kubernetes event publication. Event failures are logged
//! and never fail a reconcile.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::debug;

pub const REPORTER: &str = "nats-accounts-operator";

#[derive(Clone)]
pub struct EventRecorder {
    recorder: Recorder,
}

impl EventRecorder {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn normal(&self, reference: &ObjectReference, reason: &str, note: String) {
        self.publish(EventType::Normal, reference, reason, note).await;
    }

    pub async fn warning(&self, reference: &ObjectReference, reason: &str, note: String) {
        self.publish(EventType::Warning, reference, reason, note).await;
    }

    async fn publish(
        &self,
        type_: EventType,
        reference: &ObjectReference,
        reason: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, reference).await {
            debug!(error = ?err, reason, "failed to publish event");
        }
    }
}
