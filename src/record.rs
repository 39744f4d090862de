//! Live resources for one managed cluster.

use std::time::Duration;

use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tokio_util::sync::CancellationToken;

use crate::cache::ClusterCaches;
use crate::error::Error;
use crate::error::Result;
use crate::lifecycle::Termination;

/// Path of the parameterless liveness endpoint every API server serves.
pub const HEALTH_PATH: &str = "/healthz";

/// A live connection to a managed cluster together with its watch caches.
///
/// The credential blob is the one the connection and caches were built from; a
/// declaration carrying any other blob needs a new record.
pub struct ClusterResourceRecord {
    kubeconfig: String,
    server_version: String,
    config: Config,
    client: Client,
    pub caches: ClusterCaches,
    termination: Termination,
}

impl ClusterResourceRecord {
    /// Connects to the cluster described by `kubeconfig`, starts its watch caches and
    /// waits for their initial sync.
    ///
    /// The record's termination is a child of `shutdown`, so process shutdown stops its
    /// reflectors and aborts a pending sync.
    pub async fn build(name: &str, kubeconfig: &str, shutdown: &CancellationToken) -> Result<Self> {
        let config = connection_config(kubeconfig).await.inspect_err(|error| {
            log::error!(cluster = name; "Unable to create client config from kubeconfig: {error}");
        })?;

        let client = Client::try_from(config.clone()).map_err(Error::Connection)?;
        let server_version = client
            .apiserver_version()
            .await
            .map_err(|error| {
                log::error!(cluster = name; "Failed to get server version: {error}");
                Error::Connection(error)
            })?
            .git_version;

        let termination = Termination::child_of(shutdown);
        let caches = ClusterCaches::start(&client, &termination);
        if let Err(error) = caches.wait_synced(&termination).await {
            termination.signal();
            return Err(error);
        }

        log::info!(cluster = name, version = server_version.as_str(); "Cluster resources ready");

        Ok(Self::from_parts(kubeconfig, server_version, config, client, caches, termination))
    }

    /// Assembles a record from already established parts.
    pub fn from_parts(
        kubeconfig: impl Into<String>,
        server_version: impl Into<String>,
        config: Config,
        client: Client,
        caches: ClusterCaches,
        termination: Termination,
    ) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            server_version: server_version.into(),
            config,
            client,
            caches,
            termination,
        }
    }

    pub fn kubeconfig(&self) -> &str {
        &self.kubeconfig
    }

    /// Whether this record was built from exactly `kubeconfig`.
    pub fn built_from(&self, kubeconfig: &str) -> bool {
        self.kubeconfig == kubeconfig
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Live API connection, used for log streaming and exec.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Connection configuration the client was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    /// Stops the record's reflectors. Returns `true` if this call closed the signal.
    pub fn teardown(&self) -> bool {
        self.termination.signal()
    }

    pub fn node_count(&self) -> usize {
        self.caches.nodes.len()
    }
}

/// Parses a kubeconfig document into a client configuration using its current context.
pub async fn connection_config(kubeconfig: &str) -> Result<Config> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig)?;
    Ok(Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
}

/// Round trip against [HEALTH_PATH], bounded by `timeout`.
pub async fn probe_health(client: &Client, timeout: Duration) -> Result<()> {
    let request = http::Request::get(HEALTH_PATH)
        .body(Vec::new())
        .map_err(|error| Error::Probe(error.to_string()))?;

    match tokio::time::timeout(timeout, client.request_text(request)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(error)) => Err(Error::Probe(error.to_string())),
        Err(_) => Err(Error::Probe(format!("no response within {timeout:?}"))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: test
clusters:
- name: test
  cluster:
    server: https://10.0.0.1:6443
contexts:
- name: test
  context:
    cluster: test
    user: test
users:
- name: test
  user:
    token: secret-token
"#;

    /// A record pointing at an address nobody listens on, with the given caches.
    pub(crate) fn record(kubeconfig: &str, version: &str, caches: ClusterCaches) -> ClusterResourceRecord {
        let config = Config::new("http://127.0.0.1:9".parse().unwrap());
        let client = Client::try_from(config.clone()).unwrap();
        ClusterResourceRecord::from_parts(kubeconfig, version, config, client, caches, Termination::new())
    }

    #[tokio::test]
    async fn test_connection_config_uses_current_context() {
        let config = connection_config(KUBECONFIG).await.unwrap();

        assert_eq!(config.cluster_url.to_string(), "https://10.0.0.1:6443/");
    }

    #[tokio::test]
    async fn test_connection_config_rejects_garbage() {
        let result = connection_config("clusters: not-a-list").await;

        assert!(matches!(result, Err(Error::ConnectionConfig(_))));
    }

    #[tokio::test]
    async fn test_build_fails_with_connection_config_error() {
        // Given: A blob that is not a kubeconfig
        let shutdown = CancellationToken::new();

        // When: Building a record from it
        let result = ClusterResourceRecord::build("broken", "clusters: not-a-list", &shutdown).await;

        // Then: The build fails before any connection is attempted
        assert!(matches!(result, Err(Error::ConnectionConfig(_))));
    }

    #[tokio::test]
    async fn test_record_tracks_its_credentials() {
        let record = record("blob-a", "v1.30.0", ClusterCaches::detached());

        assert!(record.built_from("blob-a"));
        assert!(!record.built_from("blob-b"));
        assert_eq!(record.server_version(), "v1.30.0");
        assert_eq!(record.node_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_happens_once() {
        let record = record("blob-a", "v1.30.0", ClusterCaches::detached());

        assert!(record.teardown());
        assert!(!record.teardown());
        assert!(record.termination().is_signaled());
    }

    #[tokio::test]
    async fn test_health_check_fails_for_unreachable_cluster() {
        let record = record("blob-a", "v1.30.0", ClusterCaches::detached());

        let result = probe_health(&record.client(), Duration::from_secs(2)).await;

        assert!(matches!(result, Err(Error::Probe(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_times_out_on_silent_cluster() {
        // Given: An endpoint that accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });
        let client = Client::try_from(Config::new(format!("http://{address}").parse().unwrap())).unwrap();

        // When: Checking its health
        let result = probe_health(&client, Duration::from_secs(10)).await;

        // Then: The check gives up after the timeout
        match result {
            Err(Error::Probe(message)) => assert_eq!(message, "no response within 10s"),
            other => panic!("Expected a timeout, got {other:?}"),
        }
    }
}
