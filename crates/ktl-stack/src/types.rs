use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use ktl_retry::RetryPolicy;

/// Deserialize a Duration from either a humantime string (`"30s"`) or a
/// millisecond count.
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds so it roundtrips with
/// `deserialize_duration`.
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Stable identity of a node in the execution DAG: `cluster/release`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(cluster: &str, release: &str) -> Self {
        Self(format!("{cluster}/{release}"))
    }

    /// Synthetic id that stack-scoped hook failures are recorded against.
    pub fn stack() -> Self {
        Self("stack".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A target cluster. Identity is `name`; the binding is immutable for the
/// duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    /// Kubeconfig context to use against this cluster.
    pub context: String,
    pub kubeconfig: PathBuf,
    /// Default namespace for releases that do not pin one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// When a hook runs relative to its node (or the whole stack).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookWhen {
    PreApply,
    PostApply,
    PreDelete,
    PostDelete,
}

/// Hook executor flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookType {
    Kubectl,
    Script,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubectlHook {
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptHook {
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

/// An auxiliary command run around apply/delete. Release-level hooks run
/// around each node; stack-level hooks run around the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    #[serde(rename = "type")]
    pub hook_type: HookType,
    pub when: HookWhen,
    /// Run at most once per stack, surviving resumes.
    #[serde(default)]
    pub run_once: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubectl: Option<KubectlHook>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptHook>,
    /// One-line label used in events and console output.
    pub summary: String,
}

/// Apply-phase knobs for one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOptions {
    #[serde(default)]
    pub atomic: bool,
    #[serde(default = "default_true")]
    pub wait: bool,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
}

fn default_true() -> bool {
    true
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            atomic: false,
            wait: true,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Delete-phase knobs for one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
        }
    }
}

/// A required status condition on objects of a given kind, checked by the
/// verify stage after a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRequirement {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    /// `status.conditions[].type` to look for, e.g. `Available`.
    pub condition_type: String,
    /// Required `status` value, e.g. `True`.
    pub require_status: String,
    /// Tolerate the object (or its REST mapping) being absent.
    #[serde(default)]
    pub allow_missing: bool,
}

/// Post-apply verification policy for one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySpec {
    #[serde(default)]
    pub enabled: bool,
    /// Fail the node when Warning events target its objects.
    #[serde(default)]
    pub fail_on_warnings: bool,
    /// Demote verify failures to warnings in the log.
    #[serde(default)]
    pub warn_only: bool,
    /// How far back to scan for Warning events.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_events_window"
    )]
    pub events_window: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_verify_timeout"
    )]
    pub timeout: Duration,
    #[serde(default)]
    pub require_conditions: Vec<ConditionRequirement>,
    /// Warning reasons to tolerate (e.g. flaky image-pull backoffs).
    #[serde(default)]
    pub allow_warning_reasons: Vec<String>,
    /// Warning reasons that always fail, even when allowed by prefix.
    #[serde(default)]
    pub deny_warning_reasons: Vec<String>,
}

fn default_events_window() -> Duration {
    Duration::from_secs(300)
}

fn default_verify_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for VerifySpec {
    fn default() -> Self {
        Self {
            enabled: false,
            fail_on_warnings: false,
            warn_only: false,
            events_window: default_events_window(),
            timeout: default_verify_timeout(),
            require_conditions: Vec::new(),
            allow_warning_reasons: Vec::new(),
            deny_warning_reasons: Vec::new(),
        }
    }
}

/// Name of the parallelism bucket used when a release does not pick one.
pub const DEFAULT_PARALLELISM: &str = "default";

/// Bucket whose capacity is pinned to one, serializing its members.
pub const SERIAL_PARALLELISM: &str = "serial";

/// One release resolved against one cluster: a vertex of the execution
/// DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseNode {
    pub id: NodeId,
    pub release: String,
    pub cluster: Cluster,
    pub namespace: String,
    pub chart: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,
    /// Version sealed at compile time when resolution returned one, so a
    /// later run cannot silently drift to a newer chart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_chart_version: Option<String>,
    #[serde(default)]
    pub values: Vec<PathBuf>,
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    /// Dependencies, as node ids within the same cluster.
    #[serde(default)]
    pub needs: Vec<NodeId>,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
    #[serde(default)]
    pub apply: ApplyOptions,
    #[serde(default)]
    pub delete: DeleteOptions,
    /// Depth layer from the topological sort; used for tie-breaking and
    /// display.
    pub execution_group: u32,
    pub parallelism: String,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub verify: VerifySpec,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Error classification attached to every runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    RenderError,
    HelmError,
    HelmRateLimit,
    KubeRateLimit,
    WaitTimeout,
    HookFailed,
    VerifyFailed,
    Drift,
    Cycle,
    Config,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RenderError => "RENDER_ERROR",
            ErrorClass::HelmError => "HELM_ERROR",
            ErrorClass::HelmRateLimit => "HELM_RATE_LIMIT",
            ErrorClass::KubeRateLimit => "KUBE_RATE_LIMIT",
            ErrorClass::WaitTimeout => "WAIT_TIMEOUT",
            ErrorClass::HookFailed => "HOOK_FAILED",
            ErrorClass::VerifyFailed => "VERIFY_FAILED",
            ErrorClass::Drift => "DRIFT",
            ErrorClass::Cycle => "CYCLE",
            ErrorClass::Config => "CONFIG",
            ErrorClass::Internal => "INTERNAL",
        }
    }

    /// Rate-limit classes retry on a widened schedule bounded by the
    /// run-global retry budget.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ErrorClass::HelmRateLimit | ErrorClass::KubeRateLimit)
    }

    /// Whether the scheduler may retry this class at all.
    pub fn is_retryable(&self) -> bool {
        self.is_rate_limit()
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified runtime failure with a stable short digest.
///
/// The digest deduplicates failures in the console rail and correlates
/// retried attempts of the same root cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub class: ErrorClass,
    pub digest: String,
    pub message: String,
}

impl RunError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        let message = message.into();
        let digest = error_digest(class, &message);
        Self {
            class,
            digest,
            message,
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.class, self.digest, self.message)
    }
}

/// Short stable hash of `(class, root cause)`.
pub fn error_digest(class: ErrorClass, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(class.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(message.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}

/// Lifecycle state of one node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Planned,
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Blocked,
    Skipped,
}

impl NodeState {
    /// States the scheduler will never move a node out of.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Blocked | NodeState::Skipped
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Planned => "planned",
            NodeState::Queued => "queued",
            NodeState::Running => "running",
            NodeState::Retrying => "retrying",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::Blocked => "blocked",
            NodeState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Persisted per-node status, mutated only by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: NodeId,
    pub status: NodeState,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
    pub effective_input_hash: String,
}

impl NodeStatus {
    pub fn planned(id: NodeId, effective_input_hash: String) -> Self {
        Self {
            id,
            status: NodeState::Planned,
            attempt: 0,
            started_at: None,
            ended_at: None,
            last_error: None,
            effective_input_hash,
        }
    }
}

/// Phase of the per-node deploy pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Render,
    Diff,
    Apply,
    Wait,
    PostHooks,
    Verify,
    Destroy,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Render => "render",
            Phase::Diff => "diff",
            Phase::Apply => "apply",
            Phase::Wait => "wait",
            Phase::PostHooks => "post-hooks",
            Phase::Verify => "verify",
            Phase::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event types, exhaustive. Serialized names are the wire contract of
/// `events.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEventKind {
    RunStarted,
    RunConcurrency,
    NodeMeta,
    NodeQueued,
    NodeRunning,
    BudgetWait,
    PhaseStarted,
    PhaseCompleted,
    HookStarted,
    HookSucceeded,
    HookFailed,
    HookSkipped,
    RetryScheduled,
    NodeSucceeded,
    NodeBlocked,
    NodeFailed,
    NodeLog,
    HelmLog,
    StackHooksStarted,
    StackHooksCompleted,
    RunFinalizing,
    RunFinalized,
    RunCompleted,
}

/// One entry of the totally-ordered run event stream.
///
/// `seq` is assigned by the event bus at publish time and is unique and
/// monotonically increasing within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: RunEventKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<RunError>,
}

impl RunEvent {
    /// A draft event; `seq` and `ts` are stamped by the bus on publish.
    pub fn new(kind: RunEventKind) -> Self {
        Self {
            seq: 0,
            ts: DateTime::<Utc>::MIN_UTC,
            kind,
            run_id: None,
            node_id: None,
            attempt: None,
            message: None,
            fields: BTreeMap::new(),
            error: None,
        }
    }

    pub fn node(mut self, id: &NodeId) -> Self {
        self.node_id = Some(id.clone());
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn error(mut self, error: RunError) -> Self {
        self.error = Some(error);
        self
    }
}

/// What the orchestrator is asked to do with the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCommand {
    Apply,
    Delete,
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunCommand::Apply => f.write_str("apply"),
            RunCommand::Delete => f.write_str("delete"),
        }
    }
}

/// Runtime knobs for one orchestrator run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub command: RunCommand,
    /// Global cap on concurrently running nodes.
    pub concurrency: usize,
    /// Cancel the whole run on the first terminal node failure.
    pub fail_fast: bool,
    pub auto_approve: bool,
    /// Stop every node after its diff phase.
    pub plan_only: bool,
    /// Refuse to install a release that is not already deployed.
    pub upgrade_only: bool,
    /// Confirm immutable-field suspicion with a server-side dry-run.
    pub server_side_confirm: bool,
    pub resume: bool,
    /// With `resume`: recompile instead of loading the stored plan.
    pub replan: bool,
    /// With `resume`: restrict the plan to previously failed nodes.
    pub rerun_failed: bool,
    /// With `resume`: proceed even when effective inputs drifted.
    pub allow_drift: bool,
    pub run_id: Option<String>,
    pub run_root: Option<PathBuf>,
    /// Tail length for captured hook and helm output.
    pub output_lines: usize,
    /// Run-global allowance for rate-limit retry waiting.
    pub rate_limit_budget: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            command: RunCommand::Apply,
            concurrency: 4,
            fail_fast: false,
            auto_approve: false,
            plan_only: false,
            upgrade_only: false,
            server_side_confirm: false,
            resume: false,
            replan: false,
            rerun_failed: false,
            allow_drift: false,
            run_id: None,
            run_root: None,
            output_lines: 40,
            rate_limit_budget: Duration::from_secs(600),
        }
    }
}

/// Final disposition of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Canceled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}
