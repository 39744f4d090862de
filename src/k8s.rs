//! Access to cluster declarations on the admin cluster.
//!
//! The controller and the admin bootstrap only talk to the admin API through [ClusterStore],
//! so both can be exercised against an in-memory implementation in tests.

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryFuture;
use kube::api::DeleteParams;
use kube::api::ObjectMeta;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::runtime::controller::Action;
use kube::runtime::finalizer;
use kube::runtime::finalizer::Event;
use kube::Api;
use kube::Client;
use serde::Serialize;

use crate::crd::Cluster;
use crate::crd::ClusterStatus;
use crate::error::Error;
use crate::error::Result;
use crate::TryResource;

/// Reads and writes cluster declarations.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Returns the declaration named `name`, or `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<Cluster>>;

    async fn create(&self, cluster: &Cluster) -> Result<Cluster>;

    /// Replaces the declaration; `cluster` must carry the resource version it was read at.
    async fn replace(&self, cluster: &Cluster) -> Result<Cluster>;

    /// Deletes the declaration. Deleting a missing declaration is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Writes `status` onto the declaration.
    ///
    /// The write is conditional on the resource version of `object`, so a concurrent
    /// modification fails the write instead of being overwritten. Updating the status does
    /// not change the declaration's generation.
    async fn update_status(&self, object: &Cluster, status: ClusterStatus) -> Result<()>;

    /// Runs `reconcile` under the finalizer `finalizer_name`.
    ///
    /// A live declaration first gets the finalizer and is then passed on as [Event::Apply].
    /// A declaration marked for deletion is passed on as [Event::Cleanup] and the finalizer
    /// is removed once cleanup succeeded, which lets the deletion complete.
    async fn finalize<ReconcileFut>(
        &self,
        finalizer_name: &str,
        object: Arc<Cluster>,
        reconcile: impl FnOnce(Event<Cluster>) -> ReconcileFut + Send,
    ) -> Result<Action>
    where
        ReconcileFut: TryFuture<Ok = Action> + Send,
        ReconcileFut::Error: StdError + Send + 'static;
}

/// [ClusterStore] backed by the admin cluster's API server.
#[derive(Clone)]
pub struct K8sRepository {
    api: Api<Cluster>,
}

impl K8sRepository {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }

    pub fn api(&self) -> &Api<Cluster> {
        &self.api
    }
}

/// Merge patch body for the status subresource, guarded by the read resource version.
#[derive(Debug, Serialize)]
struct StatusPatch<'a> {
    metadata: ObjectMeta,
    status: &'a ClusterStatus,
}

#[async_trait]
impl ClusterStore for K8sRepository {
    async fn get(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, cluster: &Cluster) -> Result<Cluster> {
        Ok(self.api.create(&PostParams::default(), cluster).await?)
    }

    async fn replace(&self, cluster: &Cluster) -> Result<Cluster> {
        Ok(self
            .api
            .replace(cluster.try_name()?, &PostParams::default(), cluster)
            .await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn update_status(&self, object: &Cluster, status: ClusterStatus) -> Result<()> {
        let patch = StatusPatch {
            metadata: ObjectMeta {
                resource_version: object.metadata.resource_version.clone(),
                ..Default::default()
            },
            status: &status,
        };

        self.api
            .patch_status(object.try_name()?, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::StatusWrite)?;

        Ok(())
    }

    async fn finalize<ReconcileFut>(
        &self,
        finalizer_name: &str,
        object: Arc<Cluster>,
        reconcile: impl FnOnce(Event<Cluster>) -> ReconcileFut + Send,
    ) -> Result<Action>
    where
        ReconcileFut: TryFuture<Ok = Action> + Send,
        ReconcileFut::Error: StdError + Send + 'static,
    {
        finalizer(&self.api, finalizer_name, object, reconcile)
            .await
            .map_err(Error::from)
    }
}
