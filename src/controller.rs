//! Reconciliation of cluster declarations against the [Registry].
//!
//! The controller runtime of `kube` watches the admin cluster's `Cluster` objects and hands
//! every declaration it sees to [ClusterController::reconcile]. A pass makes sure the registry
//! holds a record built from the declaration's current credentials, checks the cluster's
//! health and writes the observed state back onto the declaration's status. Declarations
//! carry a finalizer, so a deletion is only completed once the cluster's record is torn down.

use std::collections::HashMap;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::controller::Error as KubeControllerError;
use kube::runtime::finalizer::Event;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::runtime::Config;
use kube::runtime::Controller;
use kube::Api;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::crd::Cluster;
use crate::crd::ClusterCondition;
use crate::crd::ClusterConditionType;
use crate::crd::ClusterStatus;
use crate::crd::ConditionStatus;
use crate::crd::Provider;
use crate::error::Error;
use crate::error::Result;
use crate::events::ClusterEventReason;
use crate::events::EmitEvent;
use crate::events::EventData;
use crate::events::EventRecorder;
use crate::k8s::ClusterStore;
use crate::k8s::K8sRepository;
use crate::record::probe_health;
use crate::record::ClusterResourceRecord;
use crate::registry::Registry;
use crate::selector::Selector;
use crate::TryResource;

pub const CLUSTER_FINALIZER: &str = "cluster.shiny.io/finalizer";

pub const PROBE_FAILED_REASON: &str = "ProbeFailed";
pub const BUILD_FAILED_REASON: &str = "BuildFailed";
pub const NOT_AVAILABLE_MESSAGE: &str = "Cluster is not available now";
pub const CONNECT_FAILED_EVENT: &str = "Failed connect cluster.";
pub const CONNECTED_EVENT: &str = "Cluster is available now.";

const PROBE_ACTION: &str = "Probe";
const BUILD_ACTION: &str = "Build";

type ReconciliationResult = StdResult<(ObjectRef<Cluster>, Action), KubeControllerError<Error, watcher::Error>>;

/// Everything a [ClusterController] needs from its surroundings.
///
/// `build_record` and `probe` default to the real connection routines and are the seams
/// tests replace to simulate reachable and unreachable clusters.
#[async_trait]
pub trait ClusterContext: Send + Sync + 'static {
    type Store: ClusterStore + 'static;
    type Recorder: EmitEvent<ClusterEventReason> + 'static;

    fn registry(&self) -> &Registry;

    fn k8s_repository(&self) -> Arc<Self::Store>;

    fn event_recorder(&self) -> Arc<Self::Recorder>;

    /// Process-wide shutdown signal. Record terminations are derived from it.
    fn shutdown(&self) -> &CancellationToken;

    async fn build_record(&self, name: &str, kubeconfig: &str) -> Result<ClusterResourceRecord> {
        self.registry().build(name, kubeconfig, self.shutdown()).await
    }

    async fn probe(&self, record: &ClusterResourceRecord, timeout: Duration) -> Result<()> {
        probe_health(&record.client(), timeout).await
    }
}

/// [ClusterContext] talking to the real admin cluster.
pub struct ControlPlaneContext {
    registry: Registry,
    repository: Arc<K8sRepository>,
    recorder: Arc<EventRecorder>,
    shutdown: CancellationToken,
}

impl ControlPlaneContext {
    pub fn new(
        registry: Registry,
        repository: Arc<K8sRepository>,
        recorder: Arc<EventRecorder>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            repository,
            recorder,
            shutdown,
        }
    }
}

#[async_trait]
impl ClusterContext for ControlPlaneContext {
    type Store = K8sRepository;
    type Recorder = EventRecorder;

    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn k8s_repository(&self) -> Arc<K8sRepository> {
        Arc::clone(&self.repository)
    }

    fn event_recorder(&self) -> Arc<EventRecorder> {
        Arc::clone(&self.recorder)
    }

    fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}

pub struct ClusterController<C: ClusterContext> {
    context: Arc<C>,
    config: ControllerConfig,
    /// Consecutive failed passes per declaration.
    failures: Mutex<HashMap<String, u32>>,
    /// Declarations that used up their attempts, with the generation they failed at.
    exhausted: Mutex<HashMap<String, Option<i64>>>,
}

impl<C: ClusterContext> ClusterController<C> {
    pub fn new(context: Arc<C>, config: ControllerConfig) -> Self {
        Self {
            context,
            config,
            failures: Mutex::new(HashMap::new()),
            exhausted: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the controller until `shutdown` fires and every pass in flight has finished.
    /// All registry records are released on return.
    pub async fn run(self: Arc<Self>, api: Api<Cluster>) {
        let shutdown = self.context.shutdown().clone();
        let concurrency = u16::try_from(self.config.workers).unwrap_or(u16::MAX);

        let controller = Controller::new(api, watcher::Config::default())
            .with_config(Config::default().concurrency(concurrency))
            .graceful_shutdown_on(shutdown.clone().cancelled_owned());
        let store = controller.store();

        log::info!(workers = self.config.workers; "Starting cluster controller");
        let reconciliations = controller
            .run(Self::reconcile, Self::error_policy, Arc::clone(&self))
            .for_each(Self::handle_reconciliation_result);

        tokio::select! {
            _ = reconciliations => {}
            _ = Self::unsynced_at_shutdown(store, shutdown) => {
                log::warn!("Cluster declarations never synced, stopping without reconciling");
            }
        }

        log::info!("Shutting down cluster controller");
        self.context.registry().shutdown().await;
    }

    /// Resolves once shutdown was requested while the declaration store never became ready.
    /// The runtime waits for readiness before draining, so it would not return by itself.
    async fn unsynced_at_shutdown(store: Store<Cluster>, shutdown: CancellationToken) {
        shutdown.cancelled().await;
        if matches!(store.wait_until_ready().now_or_never(), Some(Ok(()))) {
            futures::future::pending::<()>().await;
        }
    }

    /// One reconciliation pass for a declaration, guarded by [CLUSTER_FINALIZER].
    pub async fn reconcile(cluster: Arc<Cluster>, controller: Arc<Self>) -> Result<Action> {
        controller
            .context
            .k8s_repository()
            .finalize(CLUSTER_FINALIZER, cluster, |event| async {
                match event {
                    Event::Apply(cluster) => controller.apply(cluster).await,
                    Event::Cleanup(cluster) => controller.cleanup(cluster).await,
                }
            })
            .await
    }

    /// Retries a failed pass with exponential backoff. After `max_attempts` failed passes the
    /// declaration is left alone until its spec changes.
    pub fn error_policy(cluster: Arc<Cluster>, error: &Error, controller: Arc<Self>) -> Action {
        let name = cluster.metadata.name.clone().unwrap_or_default();
        let attempts = {
            let mut failures = controller.failures.lock();
            let attempts = failures.entry(name.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };

        if attempts < controller.config.max_attempts {
            let delay = controller.config.retry_delay(attempts);
            log::info!(cluster = name.as_str(), attempt = attempts; "Error syncing cluster, retrying in {delay:?}: {error}");
            return Action::requeue(delay);
        }

        controller.failures.lock().remove(&name);
        controller
            .exhausted
            .lock()
            .insert(name.clone(), cluster.metadata.generation);
        log::error!(cluster = name.as_str(), attempts = attempts; "Giving up on cluster until its declaration changes: {error:?}");
        Action::await_change()
    }

    async fn handle_reconciliation_result(result: ReconciliationResult) {
        match result {
            Ok((cluster, action)) => {
                log::debug!(cluster = cluster.name.as_str(); "Reconciliation successful, next: {action:?}");
            }
            Err(KubeControllerError::ReconcilerFailed(error, cluster)) => {
                log::warn!(cluster = cluster.name.as_str(); "Reconciliation failed: {error}");
            }
            Err(KubeControllerError::ObjectNotFound(cluster)) => {
                log::debug!(cluster = cluster.name.as_str(); "Cluster declaration no longer exists");
            }
            Err(error) => {
                log::error!("Cluster controller error: {error:?}");
            }
        }
    }

    /// Builds or reuses the cluster's record, checks its health and records the result.
    pub async fn apply(&self, cluster: Arc<Cluster>) -> Result<Action> {
        let name = cluster.try_name()?;
        if self.is_exhausted(&cluster) {
            log::debug!(cluster = name; "Skipping cluster that used up its attempts");
            return Ok(Action::await_change());
        }

        let record = match self.ensure_record(name, &cluster.spec.credential_blob).await {
            Ok(record) => record,
            Err(error) => {
                self.report_build_failure(&cluster, &error).await;
                return Err(error);
            }
        };

        let current = cluster.status.clone().unwrap_or_default();
        let mut status = current.clone();
        let now = Utc::now();
        match self.context.probe(&record, self.config.probe_timeout()).await {
            Ok(()) => {
                if !is_ready(&current) {
                    self.context
                        .event_recorder()
                        .emit(
                            &*cluster,
                            EventData::normal(ClusterEventReason::Connected, CONNECTED_EVENT).with_action(PROBE_ACTION),
                        )
                        .await;
                }
                status.set_condition(ClusterCondition::ready(now));
            }
            Err(error) => {
                log::warn!(cluster = name; "Failed connect cluster: {error}");
                self.context
                    .event_recorder()
                    .emit(
                        &*cluster,
                        EventData::warning(ClusterEventReason::ConnectFailed, CONNECT_FAILED_EVENT)
                            .with_action(PROBE_ACTION),
                    )
                    .await;
                status.set_condition(ClusterCondition::not_ready(now, PROBE_FAILED_REASON, NOT_AVAILABLE_MESSAGE));
            }
        }

        status.kubernetes_version = record.server_version().to_owned();
        status.provider = Provider::label(record.server_version());
        status.node_count = u32::try_from(record.caches.nodes.list(&Selector::default()).len()).unwrap_or(u32::MAX);

        if status.same_observation(&current) {
            log::debug!(cluster = name; "Cluster status unchanged");
        } else {
            self.context.k8s_repository().update_status(&cluster, status).await?;
            log::debug!(cluster = name; "Cluster status updated");
        }

        self.failures.lock().remove(name);
        Ok(Action::requeue(self.config.resync_interval()))
    }

    /// Tears down the record of a deleted declaration. Missing records are fine.
    pub async fn cleanup(&self, cluster: Arc<Cluster>) -> Result<Action> {
        let name = cluster.try_name()?;
        if self.context.registry().remove(name).await.is_none() {
            log::debug!(cluster = name; "Deleted cluster had no resources");
        }

        self.failures.lock().remove(name);
        self.exhausted.lock().remove(name);
        Ok(Action::await_change())
    }

    fn is_exhausted(&self, cluster: &Cluster) -> bool {
        let mut exhausted = self.exhausted.lock();
        let Some(name) = cluster.metadata.name.as_deref() else {
            return false;
        };

        let changed = match exhausted.get(name) {
            Some(generation) => *generation != cluster.metadata.generation,
            None => return false,
        };
        if changed {
            exhausted.remove(name);
        }

        !changed
    }

    /// Returns a record built from `kubeconfig`, rebuilding under the registry's write lock
    /// when the credentials changed.
    async fn ensure_record(&self, name: &str, kubeconfig: &str) -> Result<Arc<ClusterResourceRecord>> {
        self.context
            .registry()
            .ensure(name, kubeconfig, || self.context.build_record(name, kubeconfig))
            .await
    }

    /// Records a build failure on the declaration. Version, node count and provider keep
    /// their last observed values.
    async fn report_build_failure(&self, cluster: &Cluster, error: &Error) {
        let name = cluster.metadata.name.as_deref().unwrap_or_default();
        log::warn!(cluster = name; "Unable to build cluster resources: {error}");

        self.context
            .event_recorder()
            .emit(
                cluster,
                EventData::warning(ClusterEventReason::BuildFailed, error.to_string()).with_action(BUILD_ACTION),
            )
            .await;

        let current: ClusterStatus = cluster.status.clone().unwrap_or_default();
        let mut status = current.clone();
        status.set_condition(ClusterCondition::not_ready(
            Utc::now(),
            BUILD_FAILED_REASON,
            format!("{NOT_AVAILABLE_MESSAGE}: {error}"),
        ));
        if status.same_observation(&current) {
            return;
        }
        if let Err(status_error) = self.context.k8s_repository().update_status(cluster, status).await {
            log::warn!(cluster = name; "Unable to record build failure in status: {status_error}");
        }
    }
}

fn is_ready(status: &ClusterStatus) -> bool {
    status
        .condition(ClusterConditionType::Ready)
        .is_some_and(|ready| ready.status == ConditionStatus::True)
}
