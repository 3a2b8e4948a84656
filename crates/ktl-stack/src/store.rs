use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::git::GitIdentity;
use crate::inputs::EffectiveInput;
use crate::plan::{CURRENT_PLAN_VERSION, StackPlan};
use crate::types::{NodeId, NodeState, NodeStatus, RunCommand, RunError, RunStatus};

/// Current status artifact schema version.
pub const CURRENT_STATUS_VERSION: &str = "ktl.stack.status.v1";

/// Current run summary artifact schema version.
pub const CURRENT_SUMMARY_VERSION: &str = "ktl.stack.summary.v1";

/// Oldest schema generation this build still reads.
pub const MINIMUM_SUPPORTED_SCHEMA: u32 = 1;

pub const PLAN_FILE: &str = "plan.json";
pub const STATUS_FILE: &str = "status.json";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";
pub const HOOKS_DIR: &str = "hooks";

/// `status.json` payload: the node status map plus its schema tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusArtifact {
    pub status_version: String,
    #[serde(rename = "statusByID")]
    pub status_by_id: BTreeMap<NodeId, NodeStatus>,
}

/// Per-node receipt inside the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReceipt {
    pub id: NodeId,
    pub status: NodeState,
    pub attempt: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
}

/// `summary.json`: the audit receipt written at finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub summary_version: String,
    pub run_id: String,
    pub command: RunCommand,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan_hash: String,
    pub ktl_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_git: Option<GitIdentity>,
    pub nodes: Vec<NodeReceipt>,
}

/// One node whose current effective input no longer matches the stored
/// one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftEntry {
    pub node_id: NodeId,
    pub reason: String,
}

/// Handle on one run directory:
/// `<stack_root>/.ktl/stack/runs/<run_id>/`.
#[derive(Debug, Clone)]
pub struct RunStore {
    run_root: PathBuf,
}

impl RunStore {
    /// Where runs live under a stack root.
    pub fn runs_root(stack_root: &Path) -> PathBuf {
        stack_root.join(".ktl").join("stack").join("runs")
    }

    /// Create the directory tree for a new run.
    pub fn create(stack_root: &Path, run_id: &str) -> Result<Self> {
        let run_root = Self::runs_root(stack_root).join(run_id);
        fs::create_dir_all(run_root.join(HOOKS_DIR))
            .with_context(|| format!("failed to create run dir {}", run_root.display()))?;
        Ok(Self { run_root })
    }

    /// Open an existing run directory without touching it.
    pub fn open(run_root: &Path) -> Self {
        Self {
            run_root: run_root.to_path_buf(),
        }
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn run_id(&self) -> String {
        self.run_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn events_path(&self) -> PathBuf {
        self.run_root.join(EVENTS_FILE)
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.run_root.join(HOOKS_DIR)
    }

    /// Marker recording that a `run_once` hook completed within this run;
    /// resuming the run skips hooks whose marker exists.
    pub fn hook_marker(&self, hook_key: &str) -> PathBuf {
        self.hooks_dir().join(format!("{hook_key}.done"))
    }

    pub fn write_plan(&self, plan: &StackPlan) -> Result<()> {
        atomic_write_json(&self.run_root.join(PLAN_FILE), plan)
    }

    pub fn load_plan(&self) -> Result<StackPlan> {
        let path = self.run_root.join(PLAN_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        let plan: StackPlan = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse plan JSON {}", path.display()))?;
        validate_schema_version(&plan.plan_version, CURRENT_PLAN_VERSION)?;
        Ok(plan)
    }

    pub fn write_status(&self, status_by_id: &BTreeMap<NodeId, NodeStatus>) -> Result<()> {
        let artifact = StatusArtifact {
            status_version: CURRENT_STATUS_VERSION.to_string(),
            status_by_id: status_by_id.clone(),
        };
        atomic_write_json(&self.run_root.join(STATUS_FILE), &artifact)
    }

    pub fn load_status(&self) -> Result<BTreeMap<NodeId, NodeStatus>> {
        let path = self.run_root.join(STATUS_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read status {}", path.display()))?;
        let artifact: StatusArtifact = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse status JSON {}", path.display()))?;
        validate_schema_version(&artifact.status_version, CURRENT_STATUS_VERSION)?;
        Ok(artifact.status_by_id)
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        atomic_write_json(&self.run_root.join(SUMMARY_FILE), summary)
    }

    pub fn load_summary(&self) -> Result<Option<RunSummary>> {
        let path = self.run_root.join(SUMMARY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read summary {}", path.display()))?;
        let summary: RunSummary = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse summary JSON {}", path.display()))?;
        validate_schema_version(&summary.summary_version, CURRENT_SUMMARY_VERSION)?;
        Ok(Some(summary))
    }

    /// Append-mode writer for the durable event log.
    pub fn open_events_writer(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())
            .with_context(|| {
                format!("failed to open events file {}", self.events_path().display())
            })
    }

    /// Highest `seq` already present in the event log; 0 when there is
    /// none. A resumed run continues the sequence from here.
    pub fn last_event_seq(&self) -> Result<u64> {
        let path = self.events_path();
        if !path.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read events file {}", path.display()))?;
        let mut last = 0;
        for line in content.lines() {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                if let Some(seq) = value.get("seq").and_then(serde_json::Value::as_u64) {
                    last = last.max(seq);
                }
            }
        }
        Ok(last)
    }
}

/// A run loaded back from disk.
#[derive(Debug, Clone)]
pub struct LoadedRun {
    pub run_root: PathBuf,
    pub plan: StackPlan,
    pub status_by_id: BTreeMap<NodeId, NodeStatus>,
}

/// Load a run directory: plan plus node statuses.
pub fn load_run(run_root: &Path) -> Result<LoadedRun> {
    let store = RunStore::open(run_root);
    let plan = store.load_plan()?;
    let status_by_id = store.load_status()?;
    Ok(LoadedRun {
        run_root: run_root.to_path_buf(),
        plan,
        status_by_id,
    })
}

/// Newest run directory under a stack root, by modification time.
pub fn load_most_recent_run(stack_root: &Path) -> Result<Option<PathBuf>> {
    let runs_root = RunStore::runs_root(stack_root);
    if !runs_root.exists() {
        return Ok(None);
    }

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(&runs_root)
        .with_context(|| format!("failed to list runs in {}", runs_root.display()))?
    {
        let entry = entry.context("failed to read runs dir entry")?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        let is_newer = match &newest {
            None => true,
            Some((current, _)) => modified > *current,
        };
        if is_newer {
            newest = Some((modified, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Nodes whose current effective-input hash differs from the one frozen
/// in the stored plan, with human-readable reasons.
pub fn drift_report(
    plan: &StackPlan,
    current_inputs: &BTreeMap<NodeId, EffectiveInput>,
) -> Vec<DriftEntry> {
    let mut entries = Vec::new();
    for (node_id, stored) in &plan.effective_inputs {
        let Some(current) = current_inputs.get(node_id) else {
            entries.push(DriftEntry {
                node_id: node_id.clone(),
                reason: "node missing from current inputs".to_string(),
            });
            continue;
        };
        if stored.hash() != current.hash() {
            let reasons = stored.diff_reasons(current);
            let reason = if reasons.is_empty() {
                "effective input changed".to_string()
            } else {
                reasons.join("; ")
            };
            entries.push(DriftEntry {
                node_id: node_id.clone(),
                reason,
            });
        }
    }
    entries
}

/// Subset plan containing only nodes whose recorded status is in
/// `allowed` (e.g. `[failed]` to rerun failures).
pub fn filter_by_node_status(
    plan: &StackPlan,
    status_by_id: &BTreeMap<NodeId, NodeStatus>,
    allowed: &[NodeState],
) -> StackPlan {
    let keep = status_by_id
        .iter()
        .filter(|(_, status)| allowed.contains(&status.status))
        .map(|(id, _)| id.clone())
        .collect();
    plan.restrict_to_nodes(&keep)
}

/// Write JSON via a temp file and rename so readers never see a torn
/// artifact.
pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create dir {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json.as_bytes())
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;
    Ok(())
}

/// Validate a `ktl.stack.<artifact>.v<N>` schema tag against the floor.
pub fn validate_schema_version(version: &str, current: &str) -> Result<()> {
    let number = parse_schema_version(version)
        .with_context(|| format!("invalid schema version: {version}"))?;
    let current_number =
        parse_schema_version(current).with_context(|| format!("invalid schema tag: {current}"))?;

    if number < MINIMUM_SUPPORTED_SCHEMA {
        bail!(
            "schema version {version} is too old; minimum supported generation is v{MINIMUM_SUPPORTED_SCHEMA}"
        );
    }
    if number > current_number {
        bail!("schema version {version} is newer than this build understands ({current})");
    }
    Ok(())
}

fn parse_schema_version(version: &str) -> Result<u32> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 4 || parts[0] != "ktl" || parts[1] != "stack" || !parts[3].starts_with('v') {
        bail!("expected ktl.stack.<artifact>.v<N>, got {version}");
    }
    parts[3][1..]
        .parse::<u32>()
        .with_context(|| format!("invalid generation number in {version}"))
}
