use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Cluster;

/// One object the rendered manifest says should exist on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestTarget {
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ManifestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", ns, self.kind, self.name, self.version),
            None => write!(f, "{} {}/{}", self.kind, self.name, self.version),
        }
    }
}

/// Result of fetching one object.
///
/// `Forbidden` is distinct from an error: RBAC may legitimately hide kinds
/// from the deploy credential, and the tracker degrades those to `Unknown`
/// instead of failing the node.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Found(Value),
    Missing,
    Forbidden,
}

/// Resolution of `(group, kind)` to a servable apiVersion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestMapping {
    pub api_version: String,
    pub kind: String,
    pub namespaced: bool,
}

/// A Warning-type event scoped to a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningEvent {
    pub reason: String,
    pub message: String,
    /// Kind of the object the event targets.
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub last_seen: DateTime<Utc>,
}

/// Server-side dry-run verdict for a proposed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DryRunVerdict {
    Accepted,
    /// The server rejected the patch because the named field is immutable.
    ImmutableField(String),
    /// Rejected for some other reason (included verbatim).
    Rejected(String),
}

/// Read-side contract against a cluster.
///
/// Construction of real clients (kubeconfig loading, auth, discovery) is
/// the embedding binary's concern; the orchestrator only consumes this
/// surface. Implementations must tolerate concurrent readers.
pub trait KubeApi: Send + Sync {
    /// Fetch one object as an untyped tree.
    fn get_object(&self, cluster: &Cluster, target: &ManifestTarget) -> Result<FetchOutcome>;

    /// Resolve `(group, kind)` against server discovery.
    fn rest_mapping(&self, cluster: &Cluster, group: &str, kind: &str)
    -> Result<Option<RestMapping>>;

    /// Workloads labeled `app.kubernetes.io/instance=<release>` in a
    /// namespace, plus their dependents (Pods, PodDisruptionBudgets,
    /// HorizontalPodAutoscalers).
    fn list_instance_workloads(
        &self,
        cluster: &Cluster,
        namespace: &str,
        release: &str,
    ) -> Result<Vec<Value>>;

    /// Warning events in a namespace seen at or after `since`.
    fn list_warning_events(
        &self,
        cluster: &Cluster,
        namespace: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WarningEvent>>;

    /// Server-side apply dry-run of a proposed object.
    fn dry_run_apply(&self, cluster: &Cluster, object: &Value) -> Result<DryRunVerdict>;
}

/// Pull a named string out of an untyped object, walking dotted segments.
pub fn value_path<'a>(value: &'a Value, dotted_path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in dotted_path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// `status.conditions[type == wanted].status`, if present.
pub fn condition_status<'a>(object: &'a Value, wanted: &str) -> Option<&'a str> {
    let conditions = value_path(object, "status.conditions")?.as_array()?;
    conditions
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(wanted))
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
}
