//! Kubernetes event emission
//!
//! Events are best-effort: a failed publish is logged and never changes the
//! outcome of the operation that emitted it.

use crate::domain::ports::{EventRecorder, EventRecorderRef};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::{Client, Resource};
use std::sync::Arc;
use tracing::{debug, warn};

/// Severity of an emitted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl From<EventType> for KubeEventType {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        }
    }
}

// =============================================================================
// Recorders
// =============================================================================

/// Publishes events through the events.k8s.io API
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: &str, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance,
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(
        &self,
        target: &ObjectReference,
        event_type: EventType,
        reason: &str,
        note: &str,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), target.clone());
        let event = Event {
            type_: event_type.into(),
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(
                "Failed to publish event {} for {:?}/{:?}: {}",
                reason, target.kind, target.name, e
            );
        }
    }
}

/// Drops every event; used when event recording is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait]
impl EventRecorder for NoopRecorder {
    async fn record(&self, _: &ObjectReference, _: EventType, reason: &str, _: &str) {
        debug!("Event recording disabled, dropping {}", reason);
    }
}

// =============================================================================
// Event Sink
// =============================================================================

/// A recorder bound to the object events are reported against.
///
/// Without a target every event is dropped, matching requests that carry no
/// claim to report on.
#[derive(Clone)]
pub struct EventSink {
    recorder: EventRecorderRef,
    target: Option<ObjectReference>,
}

impl EventSink {
    pub fn new(recorder: EventRecorderRef, target: Option<ObjectReference>) -> Self {
        Self { recorder, target }
    }

    /// A sink that reports nowhere
    pub fn detached() -> Self {
        Self {
            recorder: Arc::new(NoopRecorder),
            target: None,
        }
    }

    pub fn target(&self) -> Option<&ObjectReference> {
        self.target.as_ref()
    }

    pub async fn normal(&self, reason: &str, note: impl AsRef<str>) {
        self.emit(EventType::Normal, reason, note.as_ref()).await;
    }

    pub async fn warning(&self, reason: &str, note: impl AsRef<str>) {
        self.emit(EventType::Warning, reason, note.as_ref()).await;
    }

    async fn emit(&self, event_type: EventType, reason: &str, note: &str) {
        if let Some(target) = &self.target {
            self.recorder.record(target, event_type, reason, note).await;
        }
    }
}

// =============================================================================
// Object references
// =============================================================================

/// Reference to a typed cluster object
pub fn object_ref<K>(obj: &K) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    obj.object_ref(&())
}

/// Reference to a Node by name, for events with no better target
pub fn node_ref(node_name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Node".to_string()),
        name: Some(node_name.to_string()),
        ..Default::default()
    }
}
