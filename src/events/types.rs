use std::fmt::Debug;
use std::fmt::Display;
use strum::AsRefStr;
use strum::Display as StrumDisplay;

/// Type of Kubernetes event
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, AsRefStr)]
pub enum EventType {
    /// Informational, e.g. a cluster became reachable again
    Normal,
    /// Something an operator should look at, e.g. a cluster that cannot be reached
    Warning,
}

/// Marker for enums usable as event reasons. Reasons are CamelCase by Kubernetes convention.
pub trait Reason: Debug + Display + AsRef<str> + Clone + Send + Sync + 'static {}

/// Reasons recorded against cluster declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, AsRefStr)]
pub enum ClusterEventReason {
    /// The cluster answered its health check after not being ready
    Connected,
    /// The cluster's health endpoint did not answer
    ConnectFailed,
    /// Connection or watch caches for the cluster could not be established
    BuildFailed,
}

impl Reason for ClusterEventReason {}

/// Data structure representing a Kubernetes event, generic over the reason type
#[derive(Debug)]
pub struct EventData<R: Reason> {
    pub type_: EventType,
    pub reason: R,
    pub message: String,
    pub action: Option<String>,
}

impl<R: Reason> EventData<R> {
    pub fn normal(reason: R, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            message: message.into(),
            action: None,
        }
    }

    pub fn warning(reason: R, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            message: message.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}
