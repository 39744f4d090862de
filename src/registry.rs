//! Shared mapping from cluster name to its live [ClusterResourceRecord].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use kube::Client;
use kube::Config;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::error::Result;
use crate::record::ClusterResourceRecord;

/// Lock-guarded map of live cluster records.
///
/// Reads serve user-facing queries and may run concurrently. Builds and teardowns hold the
/// write lock, so a reader waits for a rebuild in progress instead of seeing the cluster
/// disappear. Every record leaving the map through [Registry::put], [Registry::remove],
/// [Registry::ensure] or [Registry::shutdown] has its termination signalled.
#[derive(Clone, Default)]
pub struct Registry {
    records: Arc<RwLock<HashMap<String, Arc<ClusterResourceRecord>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ClusterResourceRecord>> {
        self.records.read().await.get(name).cloned()
    }

    /// Inserts `record` under `name`. A record it displaces is torn down.
    pub async fn put(&self, name: &str, record: ClusterResourceRecord) -> Arc<ClusterResourceRecord> {
        let record = Arc::new(record);
        let displaced = self.records.write().await.insert(name.to_owned(), Arc::clone(&record));

        if let Some(displaced) = displaced {
            displaced.teardown();
            log::warn!(cluster = name; "Replaced a live record that was not removed first");
        }

        record
    }

    /// Removes the record for `name` and signals its termination.
    pub async fn remove(&self, name: &str) -> Option<Arc<ClusterResourceRecord>> {
        let removed = self.records.write().await.remove(name);

        if let Some(record) = &removed {
            record.teardown();
            log::info!(cluster = name; "Cluster resources torn down");
        }

        removed
    }

    /// Returns the record for `name` if it was built from `kubeconfig`, building it otherwise.
    ///
    /// The write lock is held from the credential check until the new record is in place.
    /// A record built from other credentials is removed and signalled before `build` runs,
    /// so two live records for one name never exist. When `build` fails the name stays
    /// vacant.
    pub async fn ensure<F, Fut>(&self, name: &str, kubeconfig: &str, build: F) -> Result<Arc<ClusterResourceRecord>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<ClusterResourceRecord>> + Send,
    {
        if let Some(existing) = self.get(name).await {
            if existing.built_from(kubeconfig) {
                return Ok(existing);
            }
        }

        let mut records = self.records.write().await;
        if let Some(existing) = records.get(name) {
            if existing.built_from(kubeconfig) {
                return Ok(Arc::clone(existing));
            }
            log::info!(cluster = name; "Cluster credentials changed, rebuilding resources");
            if let Some(stale) = records.remove(name) {
                stale.teardown();
            }
        }

        let record = Arc::new(build().await?);
        records.insert(name.to_owned(), Arc::clone(&record));
        Ok(record)
    }

    /// Builds a record for `name` without touching the map. See [ClusterResourceRecord::build].
    pub async fn build(&self, name: &str, kubeconfig: &str, shutdown: &CancellationToken) -> Result<ClusterResourceRecord> {
        ClusterResourceRecord::build(name, kubeconfig, shutdown).await
    }

    /// Live connection of a managed cluster.
    pub async fn client(&self, name: &str) -> Result<Client> {
        self.get(name)
            .await
            .map(|record| record.client())
            .ok_or_else(|| Error::ClusterNotFound(name.to_owned()))
    }

    /// Connection configuration of a managed cluster.
    pub async fn config(&self, name: &str) -> Result<Config> {
        self.get(name)
            .await
            .map(|record| record.config().clone())
            .ok_or_else(|| Error::ClusterNotFound(name.to_owned()))
    }

    /// Names of all managed clusters, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tears down and forgets every record.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.records.write().await.drain().collect();

        for (name, record) in drained {
            record.teardown();
            log::debug!(cluster = name.as_str(); "Cluster resources released on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ClusterCaches;
    use crate::record::tests::record;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_and_get() {
        // Given: An empty registry
        let registry = Registry::new();

        // When: Putting a record
        registry
            .put("c1", record("blob", "v1.30.0", ClusterCaches::detached()))
            .await;

        // Then: It can be read back
        let found = registry.get("c1").await.unwrap();
        assert_eq!(found.server_version(), "v1.30.0");
        assert!(registry.get("c2").await.is_none());
        assert_eq!(registry.names().await, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_signals_termination() {
        let registry = Registry::new();
        let stored = registry
            .put("c1", record("blob", "v1.30.0", ClusterCaches::detached()))
            .await;

        let removed = registry.remove("c1").await.unwrap();

        assert!(Arc::ptr_eq(&stored, &removed));
        assert!(stored.termination().is_signaled());
        assert!(registry.get("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let registry = Registry::new();

        assert!(registry.remove("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_put_tears_down_displaced_record() {
        // Given: A record for c1
        let registry = Registry::new();
        let old = registry
            .put("c1", record("blob-a", "v1.29.0", ClusterCaches::detached()))
            .await;

        // When: Another record is put under the same name
        let new = registry
            .put("c1", record("blob-b", "v1.30.0", ClusterCaches::detached()))
            .await;

        // Then: Only the new one is live
        assert!(old.termination().is_signaled());
        assert!(!new.termination().is_signaled());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_ensure_reuses_record_with_same_credentials() {
        let registry = Registry::new();
        let first = registry
            .ensure("c1", "blob", || async { Ok(record("blob", "v1.30.0", ClusterCaches::detached())) })
            .await
            .unwrap();

        let second = registry
            .ensure("c1", "blob", || async { Err(Error::ClusterNotFound("c1".to_owned())) })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_ensure_tears_down_stale_record_before_building() {
        // Given: c1 built from blob-a
        let registry = Registry::new();
        let old = registry
            .put("c1", record("blob-a", "v1.29.0", ClusterCaches::detached()))
            .await;

        // When: Ensuring a record for blob-b
        let stale = Arc::clone(&old);
        let new = registry
            .ensure("c1", "blob-b", || async move {
                // Then: The old record is already signalled when the build starts
                assert!(stale.termination().is_signaled());
                Ok(record("blob-b", "v1.30.0", ClusterCaches::detached()))
            })
            .await
            .unwrap();

        assert!(new.built_from("blob-b"));
        assert!(Arc::ptr_eq(&registry.get("c1").await.unwrap(), &new));
    }

    #[tokio::test]
    async fn test_ensure_failure_leaves_name_vacant() {
        let registry = Registry::new();
        let old = registry
            .put("c1", record("blob-a", "v1.29.0", ClusterCaches::detached()))
            .await;

        let result = registry
            .ensure("c1", "blob-b", || async { Err(Error::CacheSync("cancelled".to_owned())) })
            .await;

        assert!(matches!(result, Err(Error::CacheSync(_))));
        assert!(old.termination().is_signaled());
        assert!(registry.get("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_readers_wait_for_rebuild_in_progress() {
        // Given: A rebuild of c1 that is still connecting
        let registry = Registry::new();
        registry
            .put("c1", record("blob-a", "v1.29.0", ClusterCaches::detached()))
            .await;
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let rebuilding = registry.clone();
        let rebuild = tokio::spawn(async move {
            rebuilding
                .ensure("c1", "blob-b", || async move {
                    released.await.unwrap();
                    Ok(record("blob-b", "v1.30.0", ClusterCaches::detached()))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // When: A reader looks c1 up meanwhile
        let reader = registry.clone();
        let read = tokio::spawn(async move { reader.get("c1").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!read.is_finished());
        release.send(()).unwrap();

        // Then: It sees the rebuilt record, never a missing cluster
        rebuild.await.unwrap().unwrap();
        let seen = read.await.unwrap().unwrap();
        assert!(seen.built_from("blob-b"));
    }

    #[tokio::test]
    async fn test_client_of_unknown_cluster() {
        let registry = Registry::new();

        assert!(matches!(registry.client("c1").await, Err(Error::ClusterNotFound(name)) if name == "c1"));
        assert!(matches!(registry.config("c1").await, Err(Error::ClusterNotFound(_))));
    }

    #[tokio::test]
    async fn test_config_of_known_cluster() {
        let registry = Registry::new();
        registry
            .put("c1", record("blob", "v1.30.0", ClusterCaches::detached()))
            .await;

        let config = registry.config("c1").await.unwrap();

        assert_eq!(config.cluster_url.to_string(), "http://127.0.0.1:9/");
        assert!(registry.client("c1").await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let registry = Registry::new();
        let a = registry
            .put("a", record("blob", "v1", ClusterCaches::detached()))
            .await;
        let b = registry
            .put("b", record("blob", "v1", ClusterCaches::detached()))
            .await;

        registry.shutdown().await;

        assert!(a.termination().is_signaled());
        assert!(b.termination().is_signaled());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_build_propagates_config_error() {
        let registry = Registry::new();

        let result = registry
            .build("c1", "clusters: not-a-list", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::ConnectionConfig(_))));
        assert!(registry.get("c1").await.is_none());
    }
}
