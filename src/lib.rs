//! `multikube` keeps live connections to a dynamic fleet of Kubernetes clusters.
//!
//! An "admin" cluster holds one `Cluster` custom resource per managed cluster, each carrying a
//! kubeconfig document. The control plane watches those declarations and, per cluster, keeps a
//! live client and a set of watch caches (nodes, pods, services, config maps, namespaces,
//! stateful sets, deployments and daemon sets) in a shared [registry::Registry]. Health,
//! server version, provider and node count are reported back onto each declaration's status.
//! Pod logs and interactive shells of any managed cluster are reachable through the
//! [logs] and [bridge] modules.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use kube::Api;
//! use multikube::bootstrap::{ensure_admin_declaration, AdminConnection};
//! use multikube::config::Settings;
//! use multikube::controller::{ClusterController, ControlPlaneContext};
//! use multikube::events::EventRecorder;
//! use multikube::k8s::K8sRepository;
//! use multikube::registry::Registry;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(None)?;
//!
//!     // Connect to the admin cluster and make sure it is declared as a managed cluster too.
//!     let admin = AdminConnection::load(settings.admin.kubeconfig.as_deref()).await?;
//!     admin.probe(settings.controller.probe_timeout()).await?;
//!     let repository = Arc::new(K8sRepository::new(admin.client()));
//!     if let Some(kubeconfig) = admin.kubeconfig() {
//!         ensure_admin_declaration(repository.as_ref(), &settings.admin, kubeconfig).await?;
//!     }
//!
//!     // Wire the controller and run it until the shutdown token fires.
//!     let shutdown = CancellationToken::new();
//!     let registry = Registry::new();
//!     let recorder = Arc::new(EventRecorder::new(
//!         admin.client(),
//!         settings.controller.event_namespace.clone(),
//!         settings.controller.component.clone(),
//!     ));
//!     let context = ControlPlaneContext::new(registry.clone(), repository.clone(), recorder, shutdown.clone());
//!     let controller = Arc::new(ClusterController::new(Arc::new(context), settings.controller.clone()));
//!
//!     controller.run(repository.api().clone()).await;
//!     Ok(())
//! }
//! ```
//!
//! While the controller runs, the registry serves the read side:
//!
//! ```rust,ignore
//! let record = registry.get("c1").await.ok_or(Error::ClusterNotFound("c1".into()))?;
//! let workers = record.caches.nodes.list(&selector::parse("node-role.kubernetes.io/worker")?);
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [error::Result]. Failed reconciliations are requeued by the
//! controller with exponential backoff up to a bounded number of attempts; the
//! declaration's status conditions are the durable, user-visible error surface. Exec and log
//! sessions fail with [error::BridgeError] or I/O errors and are never retried.

pub mod bootstrap;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod k8s;
pub mod lifecycle;
pub mod logs;
pub mod record;
pub mod registry;
pub mod selector;

use kube::Resource;

use crate::error::Error;
use crate::error::Result;

/// The TryResource trait is used to try to extract the name of a resource's metadata and
/// encapsulates the error handling.
pub trait TryResource {
    fn try_name(&self) -> Result<&str>;
}

impl<R> TryResource for R
where
    R: Resource,
{
    fn try_name(&self) -> Result<&str> {
        self.meta().name.as_deref().ok_or(Error::UnnamedObject)
    }
}
