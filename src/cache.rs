//! Watch-based caches that mirror the objects of one managed cluster.
//!
//! Every tracked kind gets its own reflector that runs until the owning record's
//! [Termination] is signalled. Queries are served synchronously from the local store.

use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use kube::Resource;
use kube::ResourceExt;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::error::Result;
use crate::lifecycle::Termination;
use crate::selector::Selector;
use crate::selector::SelectorExt;

/// Read side of a reflector for one object kind.
///
/// Cloning is cheap, clones share the same underlying store.
pub struct WatchCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    store: Store<K>,
}

impl<K> Clone for WatchCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<K> WatchCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new(store: Store<K>) -> Self {
        Self { store }
    }

    /// A cache that never receives data. Queries return nothing.
    pub fn detached() -> Self {
        let (store, _writer) = reflector::store();
        Self { store }
    }

    /// Lists every cached object whose labels satisfy `selector`.
    pub fn list(&self, selector: &Selector) -> Vec<Arc<K>> {
        self.store
            .state()
            .into_iter()
            .filter(|object| selector.matches(object.labels()))
            .collect()
    }

    /// Same as [WatchCache::list] but restricted to one namespace.
    pub fn list_namespaced(&self, namespace: &str, selector: &Selector) -> Vec<Arc<K>> {
        self.store
            .state()
            .into_iter()
            .filter(|object| object.meta().namespace.as_deref() == Some(namespace))
            .filter(|object| selector.matches(object.labels()))
            .collect()
    }

    /// Looks up a single object. `namespace` is `None` for cluster-scoped kinds.
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        let key = match namespace {
            Some(namespace) => ObjectRef::new(name).within(namespace),
            None => ObjectRef::new(name),
        };
        self.store.get(&key)
    }

    pub fn len(&self) -> usize {
        self.store.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once the initial listing has been applied to the store.
    pub async fn wait_synced(&self) -> Result<()> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|_| {
                let dyntype = Default::default();
                let kind = K::kind(&dyntype);
                Error::CacheSync(format!("{kind} reflector stopped before initial sync"))
            })
    }
}

/// The set of kinds mirrored for every managed cluster.
#[derive(Clone)]
pub struct ClusterCaches {
    pub nodes: WatchCache<Node>,
    pub pods: WatchCache<Pod>,
    pub services: WatchCache<Service>,
    pub config_maps: WatchCache<ConfigMap>,
    pub namespaces: WatchCache<Namespace>,
    pub stateful_sets: WatchCache<StatefulSet>,
    pub deployments: WatchCache<Deployment>,
    pub daemon_sets: WatchCache<DaemonSet>,
}

impl ClusterCaches {
    /// Starts one reflector per tracked kind. The reflectors stop when `termination` is signalled.
    pub fn start(client: &Client, termination: &Termination) -> Self {
        Self {
            nodes: spawn_reflector(client, termination),
            pods: spawn_reflector(client, termination),
            services: spawn_reflector(client, termination),
            config_maps: spawn_reflector(client, termination),
            namespaces: spawn_reflector(client, termination),
            stateful_sets: spawn_reflector(client, termination),
            deployments: spawn_reflector(client, termination),
            daemon_sets: spawn_reflector(client, termination),
        }
    }

    /// Caches without reflectors behind them.
    pub fn detached() -> Self {
        Self {
            nodes: WatchCache::detached(),
            pods: WatchCache::detached(),
            services: WatchCache::detached(),
            config_maps: WatchCache::detached(),
            namespaces: WatchCache::detached(),
            stateful_sets: WatchCache::detached(),
            deployments: WatchCache::detached(),
            daemon_sets: WatchCache::detached(),
        }
    }

    /// Blocks until every cache has completed its initial listing.
    ///
    /// There is no timeout; the wait ends early with [Error::CacheSync] only when
    /// `termination` is signalled.
    pub async fn wait_synced(&self, termination: &Termination) -> Result<()> {
        let synced = async {
            futures::try_join!(
                self.nodes.wait_synced(),
                self.pods.wait_synced(),
                self.services.wait_synced(),
                self.config_maps.wait_synced(),
                self.namespaces.wait_synced(),
                self.stateful_sets.wait_synced(),
                self.deployments.wait_synced(),
                self.daemon_sets.wait_synced(),
            )
        };

        tokio::select! {
            result = synced => result.map(|_| ()),
            _ = termination.signaled() => Err(Error::CacheSync("cancelled before initial sync".to_owned())),
        }
    }
}

fn spawn_reflector<K>(client: &Client, termination: &Termination) -> WatchCache<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Send + Sync,
{
    let kind = K::kind(&Default::default()).to_string();
    let api: Api<K> = Api::all(client.clone());
    let (store, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
    let termination = termination.clone();

    tokio::spawn(async move {
        let mut stream = pin!(stream);
        loop {
            tokio::select! {
                _ = termination.signaled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        if let watcher::Event::Apply(object) | watcher::Event::Delete(object) = &event {
                            log::trace!(kind = kind.as_str(), object = object.name_any().as_str(); "Cache updated");
                        }
                    }
                    Some(Err(error)) => {
                        log::warn!(kind = kind.as_str(); "Watch failed, retrying with backoff: {error}");
                    }
                    None => {
                        log::warn!(kind = kind.as_str(); "Watch stream ended");
                        break;
                    }
                },
            }
        }
        log::debug!(kind = kind.as_str(); "Reflector stopped");
    });

    WatchCache::new(store)
}
