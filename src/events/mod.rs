//! Kubernetes event emission against cluster declarations.
//!
//! Events are observability-only and never fail reconciliation.
//!
//! # Example
//! ```rust,ignore
//! use multikube::events::{ClusterEventReason, EmitEvent, EventData, EventRecorder};
//!
//! let recorder = EventRecorder::new(client, "default", "cluster-controller");
//!
//! recorder
//!     .emit(
//!         &cluster,
//!         EventData::warning(ClusterEventReason::ConnectFailed, "Failed connect cluster."),
//!     )
//!     .await;
//! ```

pub mod types;

mod recorder;

pub use recorder::EventRecorder;
pub use types::ClusterEventReason;
pub use types::EventData;
pub use types::EventType;
pub use types::Reason;

use async_trait::async_trait;
use kube::Resource;

use crate::error::Result;
use crate::TryResource;

/// Records Kubernetes events against an object.
#[async_trait]
pub trait EmitEvent<R>: Send + Sync
where
    R: Reason,
{
    /// Emits the event and reports failures to the caller.
    ///
    /// Prefer `emit()` inside reconciliation, which logs errors instead of returning them.
    async fn try_emit<K>(&self, object: &K, event: EventData<R>) -> Result<()>
    where
        K: Resource<DynamicType = ()> + TryResource + Clone + Send + Sync;

    /// Emits the event; failures are only logged.
    async fn emit<K>(&self, object: &K, event: EventData<R>)
    where
        K: Resource<DynamicType = ()> + TryResource + Clone + Send + Sync,
    {
        let reason = event.reason.to_owned();
        if let Err(error) = self.try_emit(object, event).await {
            tracing::warn!(
                error = %error,
                reason = %reason,
                "Unable to record cluster event"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crd::Cluster;
    use crate::crd::ClusterSpec;
    use crate::error::Error;
    use crate::events::types::EventType;
    use std::sync::Arc;
    use std::sync::Mutex;

    /// Records events in memory, or fails every emission.
    #[derive(Clone)]
    pub(crate) struct MockEventRecorder<R: Reason> {
        events: Arc<Mutex<Vec<(String, EventType, R, String)>>>,
        fails: bool,
    }

    impl<R: Reason> Default for MockEventRecorder<R> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<R: Reason> MockEventRecorder<R> {
        pub(crate) fn new() -> Self {
            Self {
                events: Arc::new(Mutex::new(Vec::new())),
                fails: false,
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fails: true,
                ..Self::new()
            }
        }

        pub(crate) fn events(&self) -> Vec<(String, EventType, R, String)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<R: Reason> EmitEvent<R> for MockEventRecorder<R> {
        async fn try_emit<K>(&self, object: &K, event: EventData<R>) -> Result<()>
        where
            K: Resource<DynamicType = ()> + TryResource + Clone + Send + Sync,
        {
            if self.fails {
                return Err(Error::EmitEventFailed("event sink unavailable".to_string()));
            }

            self.events.lock().unwrap().push((
                object.try_name()?.to_owned(),
                event.type_,
                event.reason,
                event.message,
            ));

            Ok(())
        }
    }

    fn cluster() -> Cluster {
        Cluster::new("c1", ClusterSpec::default())
    }

    #[test]
    fn test_warning_event_creation() {
        // Given: A reason and message
        let reason = ClusterEventReason::ConnectFailed;

        // When: Creating a warning event
        let event = EventData::warning(reason, "Failed connect cluster.");

        // Then: The event has Warning type
        assert_eq!(event.type_, EventType::Warning);
        assert_eq!(event.reason, ClusterEventReason::ConnectFailed);
        assert_eq!(event.message, "Failed connect cluster.");
        assert_eq!(event.action, None);
    }

    #[test]
    fn test_reason_renders_camel_case() {
        assert_eq!(ClusterEventReason::ConnectFailed.to_string(), "ConnectFailed");
        assert_eq!(ClusterEventReason::BuildFailed.as_ref(), "BuildFailed");
        assert_eq!(ClusterEventReason::Connected.to_string(), "Connected");
    }

    #[tokio::test]
    async fn test_try_emit_failure_returns_error() {
        // Given: A failing event recorder
        let recorder = MockEventRecorder::failing();

        // When: Calling try_emit
        let result = recorder
            .try_emit(&cluster(), EventData::warning(ClusterEventReason::BuildFailed, "boom"))
            .await;

        // Then: The result is an error
        assert!(result.unwrap_err().to_string().contains("event sink unavailable"));
    }

    #[tokio::test]
    async fn test_emit_failure_swallows_error_and_continues() {
        // Given: A failing event recorder
        let recorder = MockEventRecorder::failing();

        // When: Calling emit (should not panic or propagate error)
        recorder
            .emit(&cluster(), EventData::warning(ClusterEventReason::ConnectFailed, "x"))
            .await;

        // Then: No events were recorded
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_recorded_in_order() {
        let recorder = MockEventRecorder::new();

        recorder
            .emit(&cluster(), EventData::warning(ClusterEventReason::BuildFailed, "first"))
            .await;
        recorder
            .emit(&cluster(), EventData::normal(ClusterEventReason::Connected, "second"))
            .await;

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "c1");
        assert_eq!(events[0].2, ClusterEventReason::BuildFailed);
        assert_eq!(events[1].1, EventType::Normal);
    }
}
