//! Process settings.
//!
//! Settings come from an optional configuration file overlaid with environment variables
//! prefixed with `MULTIKUBE`. Nested keys use double underscores, e.g.
//! `MULTIKUBE_CONTROLLER__WORKERS=4` sets `controller.workers`.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

const ENV_PREFIX: &str = "MULTIKUBE";
const ENV_PREFIX_SEPARATOR: &str = "_";
const ENV_SEPARATOR: &str = "__";

pub const DEFAULT_ADMIN_CLUSTER_NAME: &str = "admin-cluster";

/// Default interactive shell: bash when present, otherwise sh.
pub const DEFAULT_SHELL: [&str; 3] = ["sh", "-c", "[ -x /bin/bash ] && exec /bin/bash || exec /bin/sh"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub controller: ControllerConfig,
    pub admin: AdminConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Concurrent reconciliation workers.
    pub workers: usize,
    /// Total attempts for a failing item before it is dropped.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_secs: u64,
    pub probe_timeout_secs: u64,
    /// Interval after which a healthy cluster is checked again.
    pub resync_interval_secs: u64,
    /// Reporting component of emitted events.
    pub component: String,
    /// Namespace for events about cluster-scoped declarations.
    pub event_namespace: String,
}

impl ControllerConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Delay before retry number `attempt`, doubling from the base delay up to the max delay.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_base_delay()
            .checked_mul(factor)
            .map_or(self.retry_max_delay(), |delay| delay.min(self.retry_max_delay()))
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 15,
            retry_base_delay_ms: 5,
            retry_max_delay_secs: 1000,
            probe_timeout_secs: 10,
            resync_interval_secs: 60,
            component: "cluster-controller".to_owned(),
            event_namespace: "default".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Name of the declaration describing the admin cluster itself.
    pub name: String,
    /// Name used by earlier runs; a declaration with this name is removed when `name` differs.
    pub default_name: String,
    /// Admin kubeconfig. Falls back to `$HOME/.kube/config`, then in-cluster configuration.
    pub kubeconfig: Option<PathBuf>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_ADMIN_CLUSTER_NAME.to_owned(),
            default_name: DEFAULT_ADMIN_CLUSTER_NAME.to_owned(),
            kubeconfig: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Upper bound for writing one frame to the client.
    pub write_deadline_secs: u64,
    pub shell: Vec<String>,
}

impl BridgeConfig {
    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            write_deadline_secs: 10,
            shell: DEFAULT_SHELL.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder.add_source(environment).build()?;
        Ok(settings.try_deserialize()?)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
