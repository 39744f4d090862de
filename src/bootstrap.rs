//! One-time setup of the admin cluster before the controller starts.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use kube::Client;
use kube::Config;

use crate::config::AdminConfig;
use crate::crd::Cluster;
use crate::crd::ClusterSpec;
use crate::error::Error;
use crate::error::Result;
use crate::k8s::ClusterStore;
use crate::record::connection_config;
use crate::record::probe_health;

/// Connection to the admin cluster together with the kubeconfig it came from.
pub struct AdminConnection {
    kubeconfig: Option<String>,
    config: Config,
    client: Client,
}

impl AdminConnection {
    /// Connects using the kubeconfig at `path`, `$HOME/.kube/config`, or the in-cluster
    /// environment, in that order.
    ///
    /// In-cluster connections have no kubeconfig document to declare.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(home_kubeconfig);

        let (kubeconfig, config) = match path {
            Some(path) => {
                let kubeconfig = tokio::fs::read_to_string(&path).await.inspect_err(|error| {
                    log::error!(path:? = path; "Unable to read admin kubeconfig: {error}");
                })?;
                let config = connection_config(&kubeconfig).await?;
                (Some(kubeconfig), config)
            }
            None => {
                log::info!("No admin kubeconfig found, using in-cluster configuration");
                (None, Config::incluster()?)
            }
        };

        let client = Client::try_from(config.clone()).map_err(Error::Connection)?;
        Ok(Self {
            kubeconfig,
            config,
            client,
        })
    }

    pub fn kubeconfig(&self) -> Option<&str> {
        self.kubeconfig.as_deref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Fails unless the admin API answers its health endpoint within `timeout`.
    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        probe_health(&self.client, timeout).await
    }
}

fn home_kubeconfig() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var_os("HOME")?).join(".kube").join("config");
    path.is_file().then_some(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminDeclaration {
    Created,
    Updated,
    Unchanged,
}

/// Makes sure a declaration named `admin.name` describes the admin cluster with `kubeconfig`.
///
/// A declaration left over under `admin.default_name` from a run with a different admin name
/// is removed.
pub async fn ensure_admin_declaration<S>(store: &S, admin: &AdminConfig, kubeconfig: &str) -> Result<AdminDeclaration>
where
    S: ClusterStore + ?Sized,
{
    let outcome = match store.get(&admin.name).await? {
        None => {
            let cluster = Cluster::new(
                &admin.name,
                ClusterSpec {
                    credential_blob: kubeconfig.to_owned(),
                },
            );
            store.create(&cluster).await?;
            log::info!(cluster = admin.name.as_str(); "Admin cluster declared");
            AdminDeclaration::Created
        }
        Some(mut cluster) if cluster.spec.credential_blob != kubeconfig => {
            cluster.spec.credential_blob = kubeconfig.to_owned();
            store.replace(&cluster).await?;
            log::info!(cluster = admin.name.as_str(); "Admin cluster credentials updated");
            AdminDeclaration::Updated
        }
        Some(_) => AdminDeclaration::Unchanged,
    };

    if admin.name != admin.default_name && store.get(&admin.default_name).await?.is_some() {
        store.delete(&admin.default_name).await?;
        log::info!(cluster = admin.default_name.as_str(); "Removed stale admin cluster declaration");
    }

    Ok(outcome)
}
