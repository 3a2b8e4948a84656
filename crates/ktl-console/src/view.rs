use std::collections::{BTreeMap, VecDeque};

use ktl_stack::types::{NodeId, RunEvent, RunEventKind};

/// How many helm log lines the view retains.
const HELM_LOG_KEEP: usize = 8;

/// How many failures the rail shows.
const FAILURE_RAIL_KEEP: usize = 5;

/// Display state of one node row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRow {
    pub status: String,
    pub attempt: u32,
    pub phase: String,
    pub note: String,
    pub critical: bool,
    pub group: u64,
}

/// One deduplicated failure in the rail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRow {
    pub digest: String,
    pub class: String,
    pub message: String,
    pub count: usize,
}

/// Event-sourced state behind the console: everything the frame builder
/// needs, nothing else. The view never calls back into the scheduler.
#[derive(Debug, Default)]
pub struct RunView {
    pub run_id: String,
    pub command: String,
    pub stack: String,
    pub concurrency: u64,
    pub nodes: BTreeMap<NodeId, NodeRow>,
    pub failures: Vec<FailureRow>,
    pub hooks: Vec<String>,
    pub details: VecDeque<String>,
    pub helm_logs: VecDeque<String>,
    pub completed: Option<String>,
}

impl RunView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the view.
    pub fn apply(&mut self, event: &RunEvent) {
        let field_str = |key: &str| {
            event
                .fields
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        match event.kind {
            RunEventKind::RunStarted => {
                self.run_id = event.run_id.clone().unwrap_or_default();
                self.command = field_str("command");
                self.stack = field_str("stack");
            }
            RunEventKind::RunConcurrency => {
                self.concurrency = event
                    .fields
                    .get("to")
                    .and_then(|v| v.as_u64())
                    .unwrap_or_default();
            }
            RunEventKind::NodeMeta => {
                if let Some(id) = &event.node_id {
                    let row = self.nodes.entry(id.clone()).or_default();
                    row.status = "planned".to_string();
                    row.critical = event
                        .fields
                        .get("critical")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    row.group = event
                        .fields
                        .get("group")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                }
            }
            RunEventKind::NodeQueued => self.set_status(event, "queued"),
            RunEventKind::NodeRunning => {
                if let Some(id) = &event.node_id {
                    let row = self.nodes.entry(id.clone()).or_default();
                    row.status = "running".to_string();
                    row.attempt = event.attempt.unwrap_or(row.attempt);
                    row.phase.clear();
                    row.note.clear();
                }
            }
            RunEventKind::BudgetWait => {
                if let Some(id) = &event.node_id {
                    let reason = field_str("reason");
                    let row = self.nodes.entry(id.clone()).or_default();
                    row.note = format!("waiting ({reason})");
                }
            }
            RunEventKind::PhaseStarted => {
                if let Some(id) = &event.node_id {
                    let phase = field_str("phase");
                    let row = self.nodes.entry(id.clone()).or_default();
                    row.phase = phase;
                }
            }
            RunEventKind::PhaseCompleted => {
                if let Some(id) = &event.node_id {
                    let status = field_str("status");
                    if status == "failed" {
                        let phase = field_str("phase");
                        let row = self.nodes.entry(id.clone()).or_default();
                        row.note = format!("{phase} failed");
                    }
                }
            }
            RunEventKind::HookStarted => {
                self.hooks
                    .push(format!("▸ {}", event.message.as_deref().unwrap_or("hook")));
            }
            RunEventKind::HookSucceeded => {
                self.replace_hook_marker(event, "✓");
            }
            RunEventKind::HookFailed => {
                self.replace_hook_marker(event, "✗");
                self.record_failure(event);
            }
            RunEventKind::HookSkipped => {
                self.hooks.push(format!(
                    "- {} (skipped)",
                    event.message.as_deref().unwrap_or("hook")
                ));
            }
            RunEventKind::RetryScheduled => {
                if let Some(id) = &event.node_id {
                    let delay_ms = event
                        .fields
                        .get("delayMs")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    let row = self.nodes.entry(id.clone()).or_default();
                    row.status = "retrying".to_string();
                    row.note = format!("retry in {}ms", delay_ms);
                }
            }
            RunEventKind::NodeSucceeded => self.set_status(event, "succeeded"),
            RunEventKind::NodeBlocked => self.set_status(event, "blocked"),
            RunEventKind::NodeFailed => {
                self.set_status(event, "failed");
                if let (Some(id), Some(error)) = (&event.node_id, &event.error) {
                    let row = self.nodes.entry(id.clone()).or_default();
                    row.note = error.message.clone();
                }
                self.record_failure(event);
            }
            RunEventKind::NodeLog => {
                if let Some(message) = &event.message {
                    let level = field_str("level");
                    if level == "warn" || level == "error" {
                        self.push_detail(format!(
                            "{}: {message}",
                            event
                                .node_id
                                .as_ref()
                                .map(NodeId::as_str)
                                .unwrap_or("run")
                        ));
                    }
                }
            }
            RunEventKind::HelmLog => {
                if let Some(message) = &event.message {
                    let prefix = event
                        .node_id
                        .as_ref()
                        .map(|id| format!("{id}: "))
                        .unwrap_or_default();
                    self.helm_logs.push_back(format!("{prefix}{message}"));
                    while self.helm_logs.len() > HELM_LOG_KEEP {
                        self.helm_logs.pop_front();
                    }
                }
            }
            RunEventKind::StackHooksStarted => self.hooks.push("stack hooks:".to_string()),
            RunEventKind::StackHooksCompleted
            | RunEventKind::RunFinalizing
            | RunEventKind::RunFinalized => {}
            RunEventKind::RunCompleted => {
                self.completed = Some(
                    event
                        .fields
                        .get("status")
                        .and_then(|v| v.as_str())
                        .unwrap_or("done")
                        .to_string(),
                );
            }
        }
    }

    fn set_status(&mut self, event: &RunEvent, status: &str) {
        if let Some(id) = &event.node_id {
            let row = self.nodes.entry(id.clone()).or_default();
            row.status = status.to_string();
            if let Some(attempt) = event.attempt {
                row.attempt = attempt;
            }
        }
    }

    fn replace_hook_marker(&mut self, event: &RunEvent, marker: &str) {
        let summary = event.message.as_deref().unwrap_or("hook");
        if let Some(entry) = self
            .hooks
            .iter_mut()
            .rev()
            .find(|h| h.ends_with(summary) && h.starts_with('▸'))
        {
            *entry = format!("{marker} {summary}");
        } else {
            self.hooks.push(format!("{marker} {summary}"));
        }
    }

    /// Deduplicate failures by digest; repeats bump a counter instead of
    /// adding rows.
    fn record_failure(&mut self, event: &RunEvent) {
        let Some(error) = &event.error else {
            return;
        };
        if let Some(existing) = self.failures.iter_mut().find(|f| f.digest == error.digest) {
            existing.count += 1;
            return;
        }
        self.failures.push(FailureRow {
            digest: error.digest.clone(),
            class: error.class.to_string(),
            message: error.message.clone(),
            count: 1,
        });
        while self.failures.len() > FAILURE_RAIL_KEEP {
            self.failures.remove(0);
        }
    }

    fn push_detail(&mut self, line: String) {
        self.details.push_back(line);
        while self.details.len() > 6 {
            self.details.pop_front();
        }
    }
}
