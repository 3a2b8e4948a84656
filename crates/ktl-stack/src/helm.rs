use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::runtime::CancelToken;
use crate::types::{Cluster, ErrorClass, ReleaseNode, RunError};

/// Everything a driver needs to address one release on one cluster.
#[derive(Debug, Clone)]
pub struct HelmRequest {
    pub cluster: Cluster,
    pub release: String,
    pub namespace: String,
    pub chart: String,
    pub chart_version: Option<String>,
    pub values: Vec<PathBuf>,
    pub set: BTreeMap<String, String>,
}

impl HelmRequest {
    pub fn from_node(node: &ReleaseNode) -> Self {
        Self {
            cluster: node.cluster.clone(),
            release: node.release.clone(),
            namespace: node.namespace.clone(),
            chart: node.chart.clone(),
            chart_version: node
                .resolved_chart_version
                .clone()
                .or_else(|| node.chart_version.clone()),
            values: node.values.clone(),
            set: node.set.clone(),
        }
    }
}

/// Result of rendering a release without touching the cluster.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub manifest: String,
    pub notes: String,
    /// Version resolution landed on when the request did not pin one.
    pub chart_version: Option<String>,
}

/// Result of an install or upgrade.
#[derive(Debug, Clone)]
pub struct Applied {
    /// Manifest as the server accepted it.
    pub manifest: String,
    /// Driver log lines, already truncated to a tail by the driver.
    pub log_tail: Vec<String>,
}

/// Apply-phase settings forwarded to the driver.
#[derive(Debug, Clone)]
pub struct ApplySettings {
    pub atomic: bool,
    pub wait: bool,
    pub timeout: Duration,
}

/// Content identity of a chart, for effective-input hashing.
///
/// The digest must cover the chart metadata plus every raw chart file in
/// sorted path order, each under a domain-separating prefix, so that two
/// charts differing in any file hash differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartFingerprint {
    pub resolved_version: Option<String>,
    pub digest: String,
}

/// Semantic contract of a Helm-equivalent backend.
///
/// The orchestrator never links a Helm library directly; anything that can
/// render a chart to manifests and reconcile a named release satisfies
/// this trait. Implementations must be safe to call from multiple worker
/// threads.
pub trait HelmDriver: Send + Sync {
    /// Render the release to its manifest without applying.
    fn render(&self, request: &HelmRequest) -> Result<Rendered>;

    /// Manifest of the currently deployed release revision, if any.
    fn deployed_manifest(&self, request: &HelmRequest) -> Result<Option<String>>;

    /// Install the release, or upgrade it if it already exists.
    fn install_or_upgrade(
        &self,
        request: &HelmRequest,
        settings: &ApplySettings,
        cancel: &CancelToken,
    ) -> Result<Applied>;

    /// Remove the release.
    fn uninstall(&self, request: &HelmRequest, timeout: Duration, cancel: &CancelToken)
    -> Result<()>;

    /// Content fingerprint of a chart reference.
    fn chart_fingerprint(&self, chart: &str, version: Option<&str>) -> Result<ChartFingerprint>;
}

/// Classify a helm driver failure message into an error class.
///
/// Rate-limit signatures get their own class so the scheduler can retry on
/// a widened schedule instead of failing the node.
pub fn classify_helm_failure(message: &str) -> ErrorClass {
    if is_rate_limited(message) {
        ErrorClass::HelmRateLimit
    } else {
        ErrorClass::HelmError
    }
}

/// Classify a kube API failure message into an error class.
pub fn classify_kube_failure(message: &str) -> ErrorClass {
    if is_rate_limited(message) {
        ErrorClass::KubeRateLimit
    } else {
        ErrorClass::Internal
    }
}

fn is_rate_limited(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429")
        || lower.contains("too many requests")
        || lower.contains("rate limit")
        || lower.contains("throttl")
        || lower.contains("client-side throttling")
}

/// Transient transport failures worth retrying under the node's own
/// backoff, even though they keep their non-rate-limit class.
pub fn is_network_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("i/o timeout")
        || lower.contains("tls handshake")
        || lower.contains("no such host")
        || lower.contains("temporarily unavailable")
        || lower.contains("unexpected eof")
}

/// Build a classified [`RunError`] from a helm failure.
pub fn helm_error(message: impl Into<String>) -> RunError {
    let message = message.into();
    RunError::new(classify_helm_failure(&message), message)
}
