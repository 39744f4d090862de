//! The `Cluster` custom resource that declares one managed cluster on the admin cluster.

use chrono::DateTime;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use strum::AsRefStr;
use strum::Display;

/// Declares a managed cluster by its kubeconfig.
///
/// The status block is written by the cluster controller only.
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[kube(
    group = "cluster.shiny.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".status.nodeCount"}"#,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".status.provider"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Opaque kubeconfig document used to reach the cluster.
    #[serde(default)]
    pub credential_blob: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,
    #[serde(default)]
    pub node_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
}

impl ClusterStatus {
    /// Replaces any condition of the same type and appends the new one.
    ///
    /// Conditions of other types keep their relative order. The transition time of the
    /// replaced condition survives when the status value did not change.
    pub fn set_condition(&mut self, mut condition: ClusterCondition) {
        if let Some(previous) = self.conditions.iter().find(|c| c.type_ == condition.type_) {
            if previous.status == condition.status && previous.last_transition_time.is_some() {
                condition.last_transition_time = previous.last_transition_time.clone();
            }
        }

        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }

    pub fn condition(&self, type_: ClusterConditionType) -> Option<&ClusterCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether `other` reports the same state, disregarding condition update times.
    pub fn same_observation(&self, other: &ClusterStatus) -> bool {
        let without_update_time = |status: &ClusterStatus| ClusterStatus {
            conditions: status
                .conditions
                .iter()
                .map(|c| ClusterCondition {
                    last_update_time: None,
                    ..c.clone()
                })
                .collect(),
            ..status.clone()
        };

        without_update_time(self) == without_update_time(other)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, JsonSchema, Display, AsRefStr)]
pub enum ClusterConditionType {
    Ready,
    NotReady,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, JsonSchema, Display, AsRefStr)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of cluster condition.
    #[serde(rename = "type")]
    pub type_: ClusterConditionType,
    /// Status of the condition, one of True, False, Unknown.
    pub status: ConditionStatus,
    /// The last time this condition was updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_update_time: Option<Time>,
    /// Last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<Time>,
    /// The reason for the condition's last transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// A human readable message indicating details about the transition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ClusterCondition {
    pub fn ready(now: DateTime<Utc>) -> Self {
        Self {
            type_: ClusterConditionType::Ready,
            status: ConditionStatus::True,
            last_update_time: Some(Time(now)),
            last_transition_time: Some(Time(now)),
            reason: ClusterConditionType::Ready.to_string(),
            message: "Cluster is available now".to_owned(),
        }
    }

    pub fn not_ready(now: DateTime<Utc>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: ClusterConditionType::NotReady,
            status: ConditionStatus::False,
            last_update_time: Some(Time(now)),
            last_transition_time: Some(Time(now)),
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Hosting provider inferred from the server's git version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum Provider {
    Tencent,
    #[strum(serialize = "AWS")]
    Aws,
}

impl Provider {
    /// `tke` takes precedence over `eks` when both appear.
    pub fn infer(version: &str) -> Option<Provider> {
        if version.contains("tke") {
            Some(Provider::Tencent)
        } else if version.contains("eks") {
            Some(Provider::Aws)
        } else {
            None
        }
    }

    /// The label written to `status.provider`, empty when no provider is recognised.
    pub fn label(version: &str) -> String {
        Provider::infer(version).map(|p| p.to_string()).unwrap_or_default()
    }
}
