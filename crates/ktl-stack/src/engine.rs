use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use rand::RngExt;

use ktl_manifest::NormalizeOptions;
use ktl_retry::RetryBudget;

use crate::bus::{DEFAULT_QUEUE_CAPACITY, EventBus, NodeSink, Observer};
use crate::git::{GitIdentity, identity_for_root};
use crate::hooks::run_hook_set;
use crate::inputs::{compute_effective_inputs, seal_plan};
use crate::lock::RunLock;
use crate::pipeline::{Outcome, PipelineSettings, run_apply, run_delete};
use crate::plan::StackPlan;
use crate::runtime::{CancelToken, RuntimeContext};
use crate::store::{
    CURRENT_SUMMARY_VERSION, NodeReceipt, RunStore, RunSummary, drift_report,
    filter_by_node_status, load_most_recent_run, load_run,
};
use crate::types::{
    HookWhen, NodeId, NodeState, NodeStatus, ReleaseNode, RunCommand, RunError, RunEvent,
    RunEventKind, RunOptions, RunStatus, SERIAL_PARALLELISM,
};

/// What a finished run looks like to the caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub run_root: PathBuf,
    pub status: RunStatus,
    pub nodes: BTreeMap<NodeId, NodeStatus>,
}

struct WorkerResult {
    node_id: NodeId,
    outcome: Outcome,
}

/// Execute a plan under the given options, streaming events to the
/// durable log and the provided observers.
///
/// This is the single entry point CLI wrappers call. The scheduler thread
/// owns all node state; per-node pipelines run on worker threads and
/// report back over a channel.
pub fn run(
    ctx: &RuntimeContext,
    plan: StackPlan,
    opts: &RunOptions,
    observers: Vec<Box<dyn Observer>>,
) -> Result<RunReport> {
    let stack_git = identity_for_root(&plan.stack_root);
    let (plan, store, mut statuses, prior_statuses) =
        resolve_run(ctx, plan, opts, stack_git.as_ref())?;
    let run_id = store.run_id();

    let _lock = RunLock::acquire(&plan.stack_root, &run_id, Duration::from_secs(24 * 3600))?;

    let seq_base = store.last_event_seq()?;
    let events_writer = store.open_events_writer()?;
    let (bus, dispatcher) = EventBus::start(
        Some(Box::new(events_writer)),
        observers,
        DEFAULT_QUEUE_CAPACITY,
        ctx.clock.clone(),
        seq_base,
    );

    let started_at = ctx.clock.now();
    let cancel = CancelToken::new();

    let emit = |event: RunEvent| bus.publish(event.run(&run_id));

    emit(
        RunEvent::new(RunEventKind::RunStarted)
            .message(format!("{} {}", opts.command, plan.stack_name))
            .field("command", opts.command.to_string())
            .field("stack", plan.stack_name.clone())
            .field("planHash", plan.plan_hash.clone())
            .field("nodes", plan.nodes.len() as u64),
    );
    emit(RunEvent::new(RunEventKind::RunConcurrency).field("to", opts.concurrency as u64));

    for id in &plan.order {
        if let Some(node) = plan.node(id) {
            emit(
                RunEvent::new(RunEventKind::NodeMeta)
                    .node(id)
                    .field("cluster", node.cluster.name.clone())
                    .field("release", node.release.clone())
                    .field("group", node.execution_group as u64)
                    .field("parallelism", node.parallelism.clone())
                    .field("critical", node.critical)
                    .field(
                        "needs",
                        serde_json::to_value(&node.needs).unwrap_or_default(),
                    ),
            );
        }
    }

    let settings = PipelineSettings {
        plan_only: opts.plan_only,
        upgrade_only: opts.upgrade_only,
        server_side_confirm: opts.server_side_confirm,
        output_lines: opts.output_lines,
        normalize: NormalizeOptions::default(),
        stack_root: plan.stack_root.clone(),
        store: Some(store.clone()),
    };

    // Stack-level pre hooks; a failure aborts before any node runs.
    // Plan-only runs mutate nothing, hooks included.
    let pre_hook_error = if opts.plan_only {
        None
    } else {
        run_stack_hooks(
            &plan,
            pre_hook_when(opts.command),
            &store,
            opts,
            &cancel,
            &emit,
        )
    };

    let final_status = if let Some(error) = &pre_hook_error {
        ctx.error(&format!("stack pre hooks failed: {}", error.message));
        RunStatus::Failed
    } else {
        schedule_nodes(
            ctx, &plan, opts, &settings, &bus, &run_id, &store, &mut statuses, &cancel, &emit,
        )?
    };

    // Stack-level post hooks run whenever the DAG was attempted and the
    // run was not canceled mid-flight.
    if !opts.plan_only && pre_hook_error.is_none() && final_status != RunStatus::Canceled {
        let _ = run_stack_hooks(
            &plan,
            post_hook_when(opts.command),
            &store,
            opts,
            &cancel,
            &emit,
        );
    }

    emit(RunEvent::new(RunEventKind::RunFinalizing));

    let finished_at = ctx.clock.now();
    let mut all_statuses = prior_statuses;
    all_statuses.extend(statuses.clone());
    store.write_status(&all_statuses)?;

    let summary = RunSummary {
        summary_version: CURRENT_SUMMARY_VERSION.to_string(),
        run_id: run_id.clone(),
        command: opts.command,
        status: final_status,
        started_at,
        finished_at,
        plan_hash: plan.plan_hash.clone(),
        ktl_version: ctx.ktl_version.clone(),
        stack_git,
        nodes: statuses
            .values()
            .map(|status| NodeReceipt {
                id: status.id.clone(),
                status: status.status,
                attempt: status.attempt,
                duration_ms: match (status.started_at, status.ended_at) {
                    (Some(start), Some(end)) => {
                        end.signed_duration_since(start).num_milliseconds().max(0) as u64
                    }
                    _ => 0,
                },
                last_error: status.last_error.clone(),
            })
            .collect(),
    };
    store.write_summary(&summary)?;

    emit(RunEvent::new(RunEventKind::RunFinalized));
    emit(
        RunEvent::new(RunEventKind::RunCompleted)
            .message(final_status.to_string())
            .field("status", final_status.to_string()),
    );

    let write_error = bus.take_write_error();
    dispatcher.finish();
    if let Some(error) = write_error {
        bail!("event log write failed: {error}");
    }

    Ok(RunReport {
        run_id,
        run_root: store.run_root().to_path_buf(),
        status: final_status,
        nodes: all_statuses,
    })
}

impl RunEvent {
    fn run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }
}

fn pre_hook_when(command: RunCommand) -> HookWhen {
    match command {
        RunCommand::Apply => HookWhen::PreApply,
        RunCommand::Delete => HookWhen::PreDelete,
    }
}

fn post_hook_when(command: RunCommand) -> HookWhen {
    match command {
        RunCommand::Apply => HookWhen::PostApply,
        RunCommand::Delete => HookWhen::PostDelete,
    }
}

/// Run stack-level hooks for one phase. Failures are recorded against the
/// synthetic `stack` node id and returned.
fn run_stack_hooks(
    plan: &StackPlan,
    when: HookWhen,
    store: &RunStore,
    opts: &RunOptions,
    cancel: &CancelToken,
    emit: &impl Fn(RunEvent) -> RunEvent,
) -> Option<RunError> {
    if !plan.stack_hooks.iter().any(|h| h.when == when) {
        return None;
    }

    let stack_id = NodeId::stack();
    emit(RunEvent::new(RunEventKind::StackHooksStarted).node(&stack_id));
    let result = run_hook_set(
        &plan.stack_hooks,
        when,
        None,
        None,
        &plan.stack_root,
        Duration::from_secs(600),
        opts.output_lines,
        Some(store),
        "stack",
        cancel,
        &mut |event| {
            emit(event.node(&stack_id));
        },
    );
    emit(
        RunEvent::new(RunEventKind::StackHooksCompleted)
            .node(&stack_id)
            .field(
                "status",
                if result.is_ok() { "succeeded" } else { "failed" },
            ),
    );
    result.err()
}

/// Resolve which plan to execute and where its run store lives, honoring
/// resume semantics.
fn resolve_run(
    ctx: &RuntimeContext,
    mut plan: StackPlan,
    opts: &RunOptions,
    stack_git: Option<&GitIdentity>,
) -> Result<(
    StackPlan,
    RunStore,
    BTreeMap<NodeId, NodeStatus>,
    BTreeMap<NodeId, NodeStatus>,
)> {
    if opts.resume && !opts.replan {
        let run_root = match &opts.run_root {
            Some(root) => root.clone(),
            None => load_most_recent_run(&plan.stack_root)?
                .context("no previous run found to resume")?,
        };
        let loaded = load_run(&run_root)?;

        if !opts.allow_drift {
            let current = compute_effective_inputs(ctx, &loaded.plan, stack_git)?;
            let drift = drift_report(&loaded.plan, &current);
            if !drift.is_empty() {
                let mut lines: Vec<String> = drift
                    .iter()
                    .map(|entry| format!("  {}: {}", entry.node_id, entry.reason))
                    .collect();
                lines.sort();
                bail!(
                    "effective inputs drifted since run {}:\n{}\nre-run with --allow-drift to \
                     proceed anyway, or --replan to recompile",
                    RunStore::open(&run_root).run_id(),
                    lines.join("\n")
                );
            }
        }

        // A resumed run continues where the last one stopped: succeeded
        // nodes stay done, everything else re-executes. `rerun_failed`
        // narrows that to failed nodes only.
        let selected = if opts.rerun_failed {
            filter_by_node_status(&loaded.plan, &loaded.status_by_id, &[NodeState::Failed])
        } else if loaded.status_by_id.is_empty() {
            loaded.plan
        } else {
            filter_by_node_status(
                &loaded.plan,
                &loaded.status_by_id,
                &[
                    NodeState::Planned,
                    NodeState::Queued,
                    NodeState::Running,
                    NodeState::Retrying,
                    NodeState::Failed,
                    NodeState::Blocked,
                    NodeState::Skipped,
                ],
            )
        };

        let mut statuses = BTreeMap::new();
        for node in &selected.nodes {
            let hash = selected
                .effective_inputs
                .get(&node.id)
                .map(|input| input.hash())
                .unwrap_or_default();
            statuses.insert(node.id.clone(), NodeStatus::planned(node.id.clone(), hash));
        }

        let store = RunStore::open(&run_root);
        return Ok((selected, store, statuses, loaded.status_by_id));
    }

    if plan.effective_inputs.is_empty() {
        seal_plan(ctx, &mut plan, stack_git)?;
    }

    let run_id = opts.run_id.clone().unwrap_or_else(|| generate_run_id(ctx));
    let store = RunStore::create(&plan.stack_root, &run_id)?;
    store.write_plan(&plan)?;

    let mut statuses = BTreeMap::new();
    for node in &plan.nodes {
        let hash = plan
            .effective_inputs
            .get(&node.id)
            .map(|input| input.hash())
            .unwrap_or_default();
        statuses.insert(node.id.clone(), NodeStatus::planned(node.id.clone(), hash));
    }
    store.write_status(&statuses)?;

    Ok((plan, store, statuses, BTreeMap::new()))
}

fn generate_run_id(ctx: &RuntimeContext) -> String {
    let stamp = ctx.clock.now().format("%Y%m%d-%H%M%S");
    let salt: u16 = rand::rng().random();
    format!("run-{stamp}-{salt:04x}")
}

fn bucket_capacity(bucket: &str, concurrency: usize) -> usize {
    if bucket == SERIAL_PARALLELISM {
        1
    } else {
        concurrency
    }
}

/// Admission order among ready nodes: critical first, then lower
/// execution group, then id.
fn tie_break(node: &ReleaseNode) -> (bool, u32, NodeId) {
    (!node.critical, node.execution_group, node.id.clone())
}

#[allow(clippy::too_many_arguments)]
fn schedule_nodes(
    ctx: &RuntimeContext,
    plan: &StackPlan,
    opts: &RunOptions,
    settings: &PipelineSettings,
    bus: &EventBus,
    run_id: &str,
    store: &RunStore,
    statuses: &mut BTreeMap<NodeId, NodeStatus>,
    cancel: &CancelToken,
    emit: &impl Fn(RunEvent) -> RunEvent,
) -> Result<RunStatus> {
    let by_id = plan.by_id();
    let dependents = plan.dependents_of();

    // Scheduling dependencies: forward edges for apply, reversed for
    // delete (a release goes away only after everything needing it did).
    let deps_of: BTreeMap<NodeId, Vec<NodeId>> = match opts.command {
        RunCommand::Apply => plan
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.needs.clone()))
            .collect(),
        RunCommand::Delete => plan
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    dependents.get(&n.id).cloned().unwrap_or_default(),
                )
            })
            .collect(),
    };
    let blocks_of: BTreeMap<NodeId, Vec<NodeId>> = match opts.command {
        RunCommand::Apply => dependents,
        RunCommand::Delete => plan
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.needs.clone()))
            .collect(),
    };

    let (results_tx, results_rx) = mpsc::channel::<WorkerResult>();
    let mut in_flight: BTreeSet<NodeId> = BTreeSet::new();
    let mut bucket_load: BTreeMap<String, usize> = BTreeMap::new();
    let mut retry_due: BTreeMap<NodeId, Instant> = BTreeMap::new();
    let mut budget_waiting: BTreeSet<NodeId> = BTreeSet::new();
    let mut rate_budget = RetryBudget::new(opts.rate_limit_budget);

    let persist = |statuses: &BTreeMap<NodeId, NodeStatus>| -> Result<()> {
        store.write_status(statuses)
    };

    loop {
        if let Some(error) = bus.take_write_error() {
            cancel.cancel();
            bail!("event log write failed: {error}");
        }

        // A canceled run stops once in-flight workers drain; queued and
        // retrying nodes are abandoned.
        if cancel.is_cancelled() && in_flight.is_empty() {
            break;
        }

        // Promote retries whose backoff elapsed.
        let now = Instant::now();
        let due: Vec<NodeId> = retry_due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            retry_due.remove(&id);
            if let Some(status) = statuses.get_mut(&id) {
                status.status = NodeState::Queued;
            }
            emit(RunEvent::new(RunEventKind::NodeQueued).node(&id));
        }

        // Mark newly ready nodes queued.
        if !cancel.is_cancelled() {
            for id in &plan.order {
                let Some(status) = statuses.get(id) else {
                    continue;
                };
                if status.status != NodeState::Planned {
                    continue;
                }
                let ready = deps_of
                    .get(id)
                    .map(|deps| {
                        deps.iter().all(|dep| {
                            statuses
                                .get(dep)
                                .map(|s| s.status == NodeState::Succeeded)
                                .unwrap_or(true)
                        })
                    })
                    .unwrap_or(true);
                if ready {
                    statuses
                        .get_mut(id)
                        .expect("status present")
                        .status = NodeState::Queued;
                    emit(RunEvent::new(RunEventKind::NodeQueued).node(id));
                }
            }
        }

        // Admit queued nodes under capacity constraints.
        if !cancel.is_cancelled() {
            let mut queued: Vec<&ReleaseNode> = statuses
                .values()
                .filter(|s| s.status == NodeState::Queued && !retry_due.contains_key(&s.id))
                .filter_map(|s| by_id.get(&s.id).copied())
                .collect();
            queued.sort_by_key(|n| tie_break(n));

            for node in queued {
                if in_flight.len() >= opts.concurrency {
                    if budget_waiting.insert(node.id.clone()) {
                        emit(
                            RunEvent::new(RunEventKind::BudgetWait)
                                .node(&node.id)
                                .field("reason", "concurrency")
                                .field("inFlight", in_flight.len() as u64)
                                .field("limit", opts.concurrency as u64),
                        );
                    }
                    continue;
                }

                let capacity = bucket_capacity(&node.parallelism, opts.concurrency);
                let load = bucket_load.get(&node.parallelism).copied().unwrap_or(0);
                if load >= capacity {
                    if budget_waiting.insert(node.id.clone()) {
                        emit(
                            RunEvent::new(RunEventKind::BudgetWait)
                                .node(&node.id)
                                .field("reason", "parallelism")
                                .field("bucket", node.parallelism.clone())
                                .field("limit", capacity as u64),
                        );
                    }
                    continue;
                }

                // For delete, critical releases are taken down last: they
                // hold back until every non-critical node is finished.
                if opts.command == RunCommand::Delete && node.critical {
                    let non_critical_pending = statuses.values().any(|s| {
                        !s.status.is_terminal()
                            && by_id
                                .get(&s.id)
                                .map(|n| !n.critical)
                                .unwrap_or(false)
                    });
                    if non_critical_pending {
                        if budget_waiting.insert(node.id.clone()) {
                            emit(
                                RunEvent::new(RunEventKind::BudgetWait)
                                    .node(&node.id)
                                    .field("reason", "critical-holdback"),
                            );
                        }
                        continue;
                    }
                }

                budget_waiting.remove(&node.id);
                in_flight.insert(node.id.clone());
                *bucket_load.entry(node.parallelism.clone()).or_insert(0) += 1;

                let status = statuses.get_mut(&node.id).expect("status present");
                status.status = NodeState::Running;
                status.attempt += 1;
                status.started_at.get_or_insert_with(|| ctx.clock.now());
                let attempt = status.attempt;
                emit(
                    RunEvent::new(RunEventKind::NodeRunning)
                        .node(&node.id)
                        .attempt(attempt),
                );
                persist(statuses)?;

                spawn_worker(
                    ctx,
                    node,
                    opts.command,
                    settings,
                    NodeSink::new(bus.clone(), run_id.to_string(), node.id.clone(), attempt),
                    cancel.clone(),
                    results_tx.clone(),
                );
            }
        }

        let pending_work = in_flight.len()
            + retry_due.len()
            + statuses
                .values()
                .filter(|s| matches!(s.status, NodeState::Queued))
                .count();
        if pending_work == 0 {
            let waiting_on_deps = !cancel.is_cancelled()
                && statuses
                    .values()
                    .any(|s| s.status == NodeState::Planned);
            if !waiting_on_deps {
                break;
            }
            // Planned nodes remain but nothing is running: their deps can
            // no longer complete. Failure propagation should have blocked
            // them; treat any straggler the same way.
            for status in statuses.values_mut() {
                if status.status == NodeState::Planned {
                    status.status = NodeState::Blocked;
                    emit(RunEvent::new(RunEventKind::NodeBlocked).node(&status.id));
                }
            }
            persist(statuses)?;
            break;
        }

        let timeout = retry_due
            .values()
            .min()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(50))
            .min(Duration::from_millis(200))
            .max(Duration::from_millis(10));

        match results_rx.recv_timeout(timeout) {
            Ok(result) => {
                let node = by_id.get(&result.node_id).copied();
                in_flight.remove(&result.node_id);
                if let Some(node) = node {
                    if let Some(load) = bucket_load.get_mut(&node.parallelism) {
                        *load = load.saturating_sub(1);
                    }
                }

                handle_result(
                    ctx,
                    result,
                    node,
                    opts,
                    statuses,
                    &blocks_of,
                    &mut retry_due,
                    &mut rate_budget,
                    cancel,
                    emit,
                )?;
                persist(statuses)?;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    // A canceled run leaves untouched nodes skipped, not failed.
    if cancel.is_cancelled() {
        for status in statuses.values_mut() {
            if !status.status.is_terminal() {
                status.status = NodeState::Skipped;
            }
        }
        persist(statuses)?;
        return Ok(RunStatus::Canceled);
    }

    let any_failed = statuses
        .values()
        .any(|s| matches!(s.status, NodeState::Failed | NodeState::Blocked));
    Ok(if any_failed {
        RunStatus::Failed
    } else {
        RunStatus::Succeeded
    })
}

fn spawn_worker(
    ctx: &RuntimeContext,
    node: &ReleaseNode,
    command: RunCommand,
    settings: &PipelineSettings,
    sink: NodeSink,
    cancel: CancelToken,
    results_tx: mpsc::Sender<WorkerResult>,
) {
    let ctx = ctx.clone();
    let node = node.clone();
    let settings = settings.clone();
    std::thread::spawn(move || {
        let result = match command {
            RunCommand::Apply => run_apply(&ctx, &node, &settings, &sink, &cancel),
            RunCommand::Delete => run_delete(&ctx, &node, &settings, &sink, &cancel),
        };
        let _ = results_tx.send(WorkerResult {
            node_id: node.id.clone(),
            outcome: result.outcome,
        });
    });
}

#[allow(clippy::too_many_arguments)]
fn handle_result(
    ctx: &RuntimeContext,
    result: WorkerResult,
    node: Option<&ReleaseNode>,
    opts: &RunOptions,
    statuses: &mut BTreeMap<NodeId, NodeStatus>,
    blocks_of: &BTreeMap<NodeId, Vec<NodeId>>,
    retry_due: &mut BTreeMap<NodeId, Instant>,
    rate_budget: &mut RetryBudget,
    cancel: &CancelToken,
    emit: &impl Fn(RunEvent) -> RunEvent,
) -> Result<()> {
    let node_id = result.node_id.clone();
    let attempt = statuses.get(&node_id).map(|s| s.attempt).unwrap_or(0);

    match result.outcome {
        Outcome::Succeeded => {
            if let Some(status) = statuses.get_mut(&node_id) {
                status.status = NodeState::Succeeded;
                status.ended_at = Some(ctx.clock.now());
                status.last_error = None;
            }
            emit(
                RunEvent::new(RunEventKind::NodeSucceeded)
                    .node(&node_id)
                    .attempt(attempt),
            );
        }
        Outcome::Retryable { error } => {
            let policy = node.map(|n| n.retry.clone()).unwrap_or_default();
            let delay = if error.class.is_rate_limit() {
                policy.backoff.widened().delay_for_attempt(attempt)
            } else {
                policy.backoff.delay_for_attempt(attempt)
            };

            let mut can_retry = policy.attempts_remaining(attempt) && !cancel.is_cancelled();
            if can_retry && error.class.is_rate_limit() && !rate_budget.try_consume(delay) {
                ctx.warn(&format!(
                    "{node_id}: rate-limit retry budget exhausted; failing terminally"
                ));
                can_retry = false;
            }

            if can_retry {
                if let Some(status) = statuses.get_mut(&node_id) {
                    status.status = NodeState::Retrying;
                    status.last_error = Some(error.clone());
                }
                emit(
                    RunEvent::new(RunEventKind::RetryScheduled)
                        .node(&node_id)
                        .attempt(attempt)
                        .message(error.message.clone())
                        .field("delayMs", delay.as_millis() as u64)
                        .error(error),
                );
                retry_due.insert(node_id, Instant::now() + delay);
            } else {
                fail_node(ctx, &node_id, attempt, error, opts, statuses, blocks_of, cancel, emit);
            }
        }
        Outcome::Terminal { error } => {
            fail_node(ctx, &node_id, attempt, error, opts, statuses, blocks_of, cancel, emit);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn fail_node(
    ctx: &RuntimeContext,
    node_id: &NodeId,
    attempt: u32,
    error: RunError,
    opts: &RunOptions,
    statuses: &mut BTreeMap<NodeId, NodeStatus>,
    blocks_of: &BTreeMap<NodeId, Vec<NodeId>>,
    cancel: &CancelToken,
    emit: &impl Fn(RunEvent) -> RunEvent,
) {
    if let Some(status) = statuses.get_mut(node_id) {
        status.status = NodeState::Failed;
        status.ended_at = Some(ctx.clock.now());
        status.last_error = Some(error.clone());
    }
    emit(
        RunEvent::new(RunEventKind::NodeFailed)
            .node(node_id)
            .attempt(attempt)
            .message(error.message.clone())
            .error(error),
    );

    // Every transitive descendant that has not finished can no longer run.
    let mut frontier: Vec<NodeId> = blocks_of.get(node_id).cloned().unwrap_or_default();
    let mut seen: BTreeSet<NodeId> = BTreeSet::new();
    while let Some(id) = frontier.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(status) = statuses.get_mut(&id) {
            if matches!(status.status, NodeState::Planned | NodeState::Queued) {
                status.status = NodeState::Blocked;
                emit(RunEvent::new(RunEventKind::NodeBlocked).node(&id));
            }
        }
        frontier.extend(blocks_of.get(&id).cloned().unwrap_or_default());
    }

    if opts.fail_fast {
        cancel.cancel();
    }
}
