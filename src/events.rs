//! Kubernetes Event recording
//!
//! Stages can attach an event to their transition; it is published on the
//! mutated resource with the `kwok_controller` source component.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate. A failed event must never break a dispatch cycle.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::crd::StageEvent;

/// Component name surfaced on recorded events
pub const EVENT_SOURCE_COMPONENT: &str = "kwok_controller";

/// Trait for publishing Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a stage event on the given resource
    async fn publish(&self, resource_ref: &ObjectReference, event: &StageEvent);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `kwok_controller` with the given
    /// process identity as the instance.
    pub fn new(client: Client, instance: String) -> Self {
        let reporter = Reporter {
            controller: EVENT_SOURCE_COMPONENT.to_string(),
            instance: Some(instance),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, resource_ref: &ObjectReference, event: &StageEvent) {
        let type_ = match event.type_.as_deref() {
            Some("Warning") => EventType::Warning,
            _ => EventType::Normal,
        };
        let event = Event {
            type_,
            reason: event.reason.clone(),
            note: event.message.clone(),
            action: "PlayStage".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason = %event.reason,
                error = %e,
                "failed to publish event"
            );
        }
    }
}

/// No-op implementation for tests
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _resource_ref: &ObjectReference, _event: &StageEvent) {}
}
