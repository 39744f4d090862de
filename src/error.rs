use std::error::Error as StdError;
use std::time::Duration;

use kube::config::KubeconfigError;
use kube::runtime::finalizer::Error as FError;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate that has no more specific home
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },
    /// The credential blob of a cluster declaration could not be turned into a client config
    #[error("Invalid cluster credentials: {0}")]
    ConnectionConfig(#[from] KubeconfigError),
    /// No kubeconfig was available and the in-cluster environment is incomplete
    #[error("Unable to configure in-cluster connection: {0}")]
    InCluster(#[from] kube::config::InClusterError),
    /// A client could be configured but the cluster could not be reached
    #[error("Failed to connect to cluster: {0}")]
    Connection(#[source] kube::Error),
    #[error("Watch caches did not complete initial sync: {0}")]
    CacheSync(String),
    #[error("Cluster health probe failed: {0}")]
    Probe(String),
    #[error("Failed to write cluster status: {0}")]
    StatusWrite(#[source] kube::Error),
    #[error("Cluster resources for '{0}' do not exist")]
    ClusterNotFound(String),
    #[error("Invalid label selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("Unnamed k8s object")]
    UnnamedObject,
    #[error("Finalizer error: {0}")]
    Finalizer(#[from] FinalizerError),
    #[error("Failed to emit event: {0}")]
    EmitEventFailed(String),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Escape hatch for callers wiring the control plane into their own binaries
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Errors that terminate a single interactive session.
#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Failed to decode terminal message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("Remote process did not provide {0}")]
    MissingStream(&'static str),
}

#[derive(ThisError, Debug)]
pub enum FinalizerError {
    #[error("{0}")]
    ApplyFailed(String),
    #[error("{0}")]
    CleanupFailed(String),
    #[error(transparent)]
    AddRemove(#[from] kube::Error),
    #[error("Object has no name")]
    UnnamedObject,
    #[error("Invalid finalizer")]
    InvalidFinalizer,
}

impl Error {
    pub(crate) fn from<K: StdError + 'static>(e: FError<K>) -> Self {
        match e {
            FError::ApplyFailed(e) => {
                Error::Finalizer(FinalizerError::ApplyFailed(format!("Failed to apply object: {e}")))
            }
            FError::CleanupFailed(e) => {
                Error::Finalizer(FinalizerError::CleanupFailed(format!("Failed to clean up object: {e}")))
            }
            FError::AddFinalizer(e) | FError::RemoveFinalizer(e) => Error::Finalizer(FinalizerError::from(e)),
            FError::UnnamedObject => Error::Finalizer(FinalizerError::UnnamedObject),
            FError::InvalidFinalizer => Error::Finalizer(FinalizerError::InvalidFinalizer),
        }
    }

    /// Whether the error came from a conflicting write, i.e. a stale resource version.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(response),
            }
            | Error::StatusWrite(kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }
}
