use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ktl_manifest::{
    ManifestObject, NormalizeOptions, PlanSummary, ServerDryRun, risky_counts,
    summarize_with_probe,
};

use crate::bus::NodeSink;
use crate::helm::{ApplySettings, HelmRequest, classify_helm_failure};
use crate::hooks::run_hook_set;
use crate::kube::DryRunVerdict;
use crate::plan::StackPlan;
use crate::runtime::{CancelToken, RuntimeContext};
use crate::store::RunStore;
use crate::tracker::{ResourceTracker, WaitOutcome};
use crate::types::{
    Cluster, ErrorClass, HookWhen, NodeId, Phase, ReleaseNode, RunError, RunEvent, RunEventKind,
};
use crate::verify::{VerifyOutcome, run_verify};

/// Tagged result of a pipeline attempt. Control flow through phases is
/// explicit: no panics, no sentinel errors.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeeded,
    Retryable { error: RunError },
    Terminal { error: RunError },
}

impl Outcome {
    /// Route an error by its class: rate-limit classes are retryable,
    /// everything else terminates the node.
    pub fn from_error(error: RunError) -> Self {
        if error.class.is_retryable() {
            Outcome::Retryable { error }
        } else {
            Outcome::Terminal { error }
        }
    }

    pub fn error(&self) -> Option<&RunError> {
        match self {
            Outcome::Succeeded => None,
            Outcome::Retryable { error } | Outcome::Terminal { error } => Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// What one pipeline attempt produced.
#[derive(Debug)]
pub struct NodeRunResult {
    pub outcome: Outcome,
    /// Diff summary, present whenever the diff phase completed.
    pub summary: Option<PlanSummary>,
}

/// Pipeline knobs shared across nodes of one run.
#[derive(Clone)]
pub struct PipelineSettings {
    pub plan_only: bool,
    pub upgrade_only: bool,
    pub server_side_confirm: bool,
    pub output_lines: usize,
    pub normalize: NormalizeOptions,
    pub stack_root: PathBuf,
    /// Run store for hook output capture and run-once markers; absent in
    /// preview contexts.
    pub store: Option<RunStore>,
}

/// Per-node diff rollup for pre-apply review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDiff {
    pub add: usize,
    pub change: usize,
    pub replace: usize,
    pub destroy: usize,
    /// Changes touching security- or cluster-impact-sensitive kinds.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub risky: BTreeMap<String, usize>,
}

/// Stack-wide diff summary keyed by node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackDiffSummary {
    pub plan_hash: String,
    pub nodes: BTreeMap<NodeId, NodeDiff>,
}

/// Adapter exposing the server dry-run as an immutable-field probe to the
/// differ.
struct KubeDryRunProbe<'a> {
    ctx: &'a RuntimeContext,
    cluster: &'a Cluster,
}

impl ServerDryRun for KubeDryRunProbe<'_> {
    fn immutable_rejection(&self, proposed: &ManifestObject) -> Option<String> {
        match self.ctx.kube.dry_run_apply(self.cluster, &proposed.raw) {
            Ok(DryRunVerdict::ImmutableField(field)) => Some(field),
            // Partially reachable or rejecting servers do not upgrade the
            // classification; local detection already ran.
            _ => None,
        }
    }
}

fn phase_started(sink: &NodeSink, phase: Phase) {
    sink.publish(RunEvent::new(RunEventKind::PhaseStarted).field("phase", phase.as_str()));
}

fn phase_completed(sink: &NodeSink, phase: Phase, status: &str) {
    sink.publish(
        RunEvent::new(RunEventKind::PhaseCompleted)
            .field("phase", phase.as_str())
            .field("status", status),
    );
}

fn log(sink: &NodeSink, level: &str, message: impl Into<String>) {
    sink.publish(
        RunEvent::new(RunEventKind::NodeLog)
            .message(message)
            .field("level", level),
    );
}

fn fail_phase(sink: &NodeSink, phase: Phase, error: RunError) -> Outcome {
    phase_completed(sink, phase, "failed");
    Outcome::from_error(error)
}

fn fail_phase_with(sink: &NodeSink, phase: Phase, outcome: Outcome) -> Outcome {
    phase_completed(sink, phase, "failed");
    outcome
}

/// Classify a failed helm call. Rate limits and transient network faults
/// are retryable; anything else terminates the node.
fn helm_outcome(message: String) -> Outcome {
    let error = RunError::new(classify_helm_failure(&message), message);
    if error.class.is_rate_limit() || crate::helm::is_network_failure(&error.message) {
        Outcome::Retryable { error }
    } else {
        Outcome::Terminal { error }
    }
}

fn cancelled_error() -> RunError {
    RunError::new(ErrorClass::Internal, "run canceled")
}

fn marker_prefix(node: &ReleaseNode) -> String {
    node.id.as_str().replace('/', "-")
}

/// Execute the apply pipeline for one node:
/// render → diff → upgrade/install → wait → post-hooks → verify.
pub fn run_apply(
    ctx: &RuntimeContext,
    node: &ReleaseNode,
    settings: &PipelineSettings,
    sink: &NodeSink,
    cancel: &CancelToken,
) -> NodeRunResult {
    let request = HelmRequest::from_node(node);

    // render
    phase_started(sink, Phase::Render);
    let rendered = match ctx.helm.render(&request) {
        Ok(rendered) => rendered,
        Err(err) => {
            let error = RunError::new(ErrorClass::RenderError, format!("{err:#}"));
            return NodeRunResult {
                outcome: fail_phase(sink, Phase::Render, error),
                summary: None,
            };
        }
    };
    if !rendered.notes.is_empty() {
        log(sink, "debug", format!("chart notes: {}", rendered.notes));
    }
    phase_completed(sink, Phase::Render, "succeeded");

    // diff
    phase_started(sink, Phase::Diff);
    let previous = match ctx.helm.deployed_manifest(&request) {
        Ok(previous) => previous,
        Err(err) => {
            let message = format!("failed to read deployed release: {err:#}");
            return NodeRunResult {
                outcome: fail_phase_with(sink, Phase::Diff, helm_outcome(message)),
                summary: None,
            };
        }
    };

    let probe = KubeDryRunProbe {
        ctx,
        cluster: &node.cluster,
    };
    let summary = match summarize_with_probe(
        previous.as_deref().unwrap_or(""),
        &rendered.manifest,
        &settings.normalize,
        settings.server_side_confirm.then_some(&probe as &dyn ServerDryRun),
    ) {
        Ok(summary) => summary,
        Err(err) => {
            let error = RunError::new(
                ErrorClass::RenderError,
                format!("failed to diff manifests: {err:#}"),
            );
            return NodeRunResult {
                outcome: fail_phase(sink, Phase::Diff, error),
                summary: None,
            };
        }
    };
    sink.publish(
        RunEvent::new(RunEventKind::NodeLog)
            .message("diff computed")
            .field("level", "info")
            .field("add", summary.add as u64)
            .field("change", summary.change as u64)
            .field("replace", summary.replace as u64)
            .field("destroy", summary.destroy as u64)
            .field(
                "hookChanges",
                (summary.hooks.add
                    + summary.hooks.change
                    + summary.hooks.replace
                    + summary.hooks.destroy) as u64,
            ),
    );
    phase_completed(sink, Phase::Diff, "succeeded");

    if settings.plan_only {
        return NodeRunResult {
            outcome: Outcome::Succeeded,
            summary: Some(summary),
        };
    }

    if cancel.is_cancelled() {
        return NodeRunResult {
            outcome: Outcome::Terminal {
                error: cancelled_error(),
            },
            summary: Some(summary),
        };
    }

    // pre-apply hooks run between review and mutation.
    if let Err(error) = emit_hooks(node, HookWhen::PreApply, settings, sink, cancel) {
        return NodeRunResult {
            outcome: Outcome::Terminal { error },
            summary: Some(summary),
        };
    }

    // upgrade/install
    phase_started(sink, Phase::Apply);
    if settings.upgrade_only && previous.is_none() {
        let error = RunError::new(
            ErrorClass::HelmError,
            format!(
                "release {} has no deployed revision; disable upgrade-only to install it",
                node.release
            ),
        );
        return NodeRunResult {
            outcome: fail_phase(sink, Phase::Apply, error),
            summary: Some(summary),
        };
    }
    let apply_settings = ApplySettings {
        atomic: node.apply.atomic,
        wait: node.apply.wait,
        timeout: node.apply.timeout,
    };
    let applied = match ctx.helm.install_or_upgrade(&request, &apply_settings, cancel) {
        Ok(applied) => applied,
        Err(err) => {
            return NodeRunResult {
                outcome: fail_phase_with(sink, Phase::Apply, helm_outcome(format!("{err:#}"))),
                summary: Some(summary),
            };
        }
    };
    for line in applied.log_tail.iter().rev().take(settings.output_lines).rev() {
        sink.publish(RunEvent::new(RunEventKind::HelmLog).message(line.clone()));
    }
    phase_completed(sink, Phase::Apply, "succeeded");

    // wait
    let targets = match crate::tracker::extract_targets(&applied.manifest, &node.namespace) {
        Ok(targets) => targets,
        Err(err) => {
            let error = RunError::new(
                ErrorClass::Internal,
                format!("failed to parse applied manifest: {err:#}"),
            );
            return NodeRunResult {
                outcome: Outcome::Terminal { error },
                summary: Some(summary),
            };
        }
    };
    let tracker = ResourceTracker::new(
        Arc::clone(&ctx.kube),
        Arc::clone(&ctx.clock),
        node.cluster.clone(),
        node.release.clone(),
        &node.namespace,
        targets,
    );

    let mut readiness_reached_at = ctx.clock.now();
    if node.apply.wait {
        phase_started(sink, Phase::Wait);
        let outcome = tracker.wait_until_ready(node.apply.timeout, cancel, |statuses, health| {
            sink.publish(
                RunEvent::new(RunEventKind::NodeLog)
                    .message("resources")
                    .field("level", "debug")
                    .field(
                        "resources",
                        serde_json::to_value(statuses).unwrap_or_default(),
                    )
                    .field("health", serde_json::to_value(health).unwrap_or_default()),
            );
        });
        match outcome {
            WaitOutcome::Ready { at } => {
                readiness_reached_at = at;
                phase_completed(sink, Phase::Wait, "succeeded");
            }
            WaitOutcome::TimedOut { pending } => {
                let sample: Vec<String> = pending
                    .iter()
                    .take(5)
                    .map(|p| format!("{}/{} ({})", p.kind, p.name, p.reason))
                    .collect();
                let error = RunError::new(
                    ErrorClass::WaitTimeout,
                    format!(
                        "{} resource(s) not ready after {}: {}",
                        pending.len(),
                        humantime::format_duration(node.apply.timeout),
                        sample.join(", ")
                    ),
                );
                return NodeRunResult {
                    outcome: fail_phase(sink, Phase::Wait, error),
                    summary: Some(summary),
                };
            }
            WaitOutcome::Cancelled => {
                return NodeRunResult {
                    outcome: fail_phase(sink, Phase::Wait, cancelled_error()),
                    summary: Some(summary),
                };
            }
        }
    }

    // post-hooks
    let has_post_hooks = node.hooks.iter().any(|h| h.when == HookWhen::PostApply);
    phase_started(sink, Phase::PostHooks);
    if has_post_hooks {
        if let Err(error) = emit_hooks(node, HookWhen::PostApply, settings, sink, cancel) {
            return NodeRunResult {
                outcome: fail_phase(sink, Phase::PostHooks, error),
                summary: Some(summary),
            };
        }
        phase_completed(sink, Phase::PostHooks, "succeeded");
    } else {
        phase_completed(sink, Phase::PostHooks, "skipped");
    }

    // verify
    phase_started(sink, Phase::Verify);
    if !node.verify.enabled {
        phase_completed(sink, Phase::Verify, "skipped");
        return NodeRunResult {
            outcome: Outcome::Succeeded,
            summary: Some(summary),
        };
    }

    if !node.apply.wait {
        // Readiness is a verify precondition; without a wait phase it is
        // established here under the verify timeout.
        match tracker.wait_until_ready(node.verify.timeout, cancel, |_, _| {}) {
            WaitOutcome::Ready { at } => readiness_reached_at = at,
            WaitOutcome::TimedOut { pending } => {
                let error = RunError::new(
                    ErrorClass::VerifyFailed,
                    format!("{} resource(s) not ready before verify", pending.len()),
                );
                return NodeRunResult {
                    outcome: fail_phase(sink, Phase::Verify, error),
                    summary: Some(summary),
                };
            }
            WaitOutcome::Cancelled => {
                return NodeRunResult {
                    outcome: fail_phase(sink, Phase::Verify, cancelled_error()),
                    summary: Some(summary),
                };
            }
        }
    }

    let namespaces = tracker.namespaces().clone();
    match run_verify(
        ctx,
        node,
        tracker.targets(),
        &namespaces,
        readiness_reached_at,
        cancel,
    ) {
        VerifyOutcome::Passed => {
            phase_completed(sink, Phase::Verify, "succeeded");
            NodeRunResult {
                outcome: Outcome::Succeeded,
                summary: Some(summary),
            }
        }
        VerifyOutcome::Warned(findings) => {
            for finding in findings {
                log(sink, "warn", finding);
            }
            phase_completed(sink, Phase::Verify, "succeeded");
            NodeRunResult {
                outcome: Outcome::Succeeded,
                summary: Some(summary),
            }
        }
        VerifyOutcome::Failed(error) => NodeRunResult {
            outcome: fail_phase(sink, Phase::Verify, error),
            summary: Some(summary),
        },
    }
}

/// Execute the delete pipeline for one node: the single destroy phase,
/// bracketed by pre/post delete hooks.
pub fn run_delete(
    ctx: &RuntimeContext,
    node: &ReleaseNode,
    settings: &PipelineSettings,
    sink: &NodeSink,
    cancel: &CancelToken,
) -> NodeRunResult {
    phase_started(sink, Phase::Destroy);

    if let Err(error) = emit_hooks(node, HookWhen::PreDelete, settings, sink, cancel) {
        return NodeRunResult {
            outcome: fail_phase(sink, Phase::Destroy, error),
            summary: None,
        };
    }

    let request = HelmRequest::from_node(node);
    if let Err(err) = ctx.helm.uninstall(&request, node.delete.timeout, cancel) {
        return NodeRunResult {
            outcome: fail_phase_with(sink, Phase::Destroy, helm_outcome(format!("{err:#}"))),
            summary: None,
        };
    }

    if let Err(error) = emit_hooks(node, HookWhen::PostDelete, settings, sink, cancel) {
        return NodeRunResult {
            outcome: fail_phase(sink, Phase::Destroy, error),
            summary: None,
        };
    }

    phase_completed(sink, Phase::Destroy, "succeeded");
    NodeRunResult {
        outcome: Outcome::Succeeded,
        summary: None,
    }
}

fn emit_hooks(
    node: &ReleaseNode,
    when: HookWhen,
    settings: &PipelineSettings,
    sink: &NodeSink,
    cancel: &CancelToken,
) -> Result<(), RunError> {
    let timeout = match when {
        HookWhen::PreApply | HookWhen::PostApply => node.apply.timeout,
        HookWhen::PreDelete | HookWhen::PostDelete => node.delete.timeout,
    };
    run_hook_set(
        &node.hooks,
        when,
        Some(&node.cluster),
        Some(&node.namespace),
        &settings.stack_root,
        timeout,
        settings.output_lines,
        settings.store.as_ref(),
        &marker_prefix(node),
        cancel,
        &mut |event| {
            sink.publish(event);
        },
    )
}

/// Render and diff every node of a plan without mutating anything:
/// the pre-apply review surface.
pub fn build_stack_diff_summary(
    ctx: &RuntimeContext,
    plan: &StackPlan,
    defaults: &NormalizeOptions,
    plan_hash: &str,
) -> Result<StackDiffSummary> {
    let mut nodes = BTreeMap::new();
    for node in &plan.nodes {
        let request = HelmRequest::from_node(node);
        let rendered = ctx
            .helm
            .render(&request)
            .with_context(|| format!("failed to render {}", node.id))?;
        let previous = ctx
            .helm
            .deployed_manifest(&request)
            .with_context(|| format!("failed to read deployed release for {}", node.id))?;
        let summary = summarize_with_probe(
            previous.as_deref().unwrap_or(""),
            &rendered.manifest,
            defaults,
            None,
        )
        .with_context(|| format!("failed to diff {}", node.id))?;

        nodes.insert(
            node.id.clone(),
            NodeDiff {
                add: summary.add,
                change: summary.change,
                replace: summary.replace,
                destroy: summary.destroy,
                risky: risky_counts(&summary),
            },
        );
    }

    Ok(StackDiffSummary {
        plan_hash: plan_hash.to_string(),
        nodes,
    })
}
