//! End-to-end scheduler scenarios against scripted drivers: ordering,
//! concurrency bounds, failure propagation, resume, and drift.

mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tempfile::tempdir;

use common::{ScriptedHelm, context, read_events, seq_of, stack_config};
use ktl_stack::engine;
use ktl_stack::plan::compile;
use ktl_stack::types::{
    ErrorClass, NodeId, NodeState, RunEventKind, RunOptions, RunStatus,
};

fn apply_options() -> RunOptions {
    RunOptions {
        concurrency: 4,
        ..RunOptions::default()
    }
}

#[test]
fn dependency_order_is_respected_and_run_succeeds() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::default());
    let ctx = context(helm.clone());

    let config = stack_config(td.path(), &[("a", &[]), ("b", &["a"])]);
    let plan = compile(&config, None, Utc::now()).expect("compile");

    let report = engine::run(&ctx, plan, &apply_options(), Vec::new()).expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(
        report.nodes[&NodeId::from("eu/a")].status,
        NodeState::Succeeded
    );
    assert_eq!(
        report.nodes[&NodeId::from("eu/b")].status,
        NodeState::Succeeded
    );

    let events = read_events(&report.run_root);

    // Seq is strictly increasing across the log.
    for window in events.windows(2) {
        assert!(window[0].seq < window[1].seq);
    }

    // NodeSucceeded(a) strictly precedes NodeRunning(b).
    let a_succeeded = seq_of(&events, |e| {
        e.kind == RunEventKind::NodeSucceeded && e.node_id == Some(NodeId::from("eu/a"))
    })
    .expect("a succeeded");
    let b_running = seq_of(&events, |e| {
        e.kind == RunEventKind::NodeRunning && e.node_id == Some(NodeId::from("eu/b"))
    })
    .expect("b running");
    assert!(a_succeeded < b_running);

    // NodeSucceeded appears exactly once per node.
    for id in ["eu/a", "eu/b"] {
        let count = events
            .iter()
            .filter(|e| {
                e.kind == RunEventKind::NodeSucceeded && e.node_id == Some(NodeId::from(id))
            })
            .count();
        assert_eq!(count, 1, "{id}");
    }

    let completed = events
        .iter()
        .find(|e| e.kind == RunEventKind::RunCompleted)
        .expect("run completed");
    assert_eq!(
        completed.fields["status"].as_str(),
        Some("succeeded")
    );
}

#[test]
fn global_concurrency_cap_bounds_in_flight_nodes() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::with_install_delay(Duration::from_millis(40)));
    let ctx = context(helm.clone());

    let releases: Vec<(&str, &[&str])> = vec![
        ("r0", &[]),
        ("r1", &[]),
        ("r2", &[]),
        ("r3", &[]),
        ("r4", &[]),
        ("r5", &[]),
    ];
    let config = stack_config(td.path(), &releases);
    let plan = compile(&config, None, Utc::now()).expect("compile");

    let opts = RunOptions {
        concurrency: 2,
        ..RunOptions::default()
    };
    let report = engine::run(&ctx, plan, &opts, Vec::new()).expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(helm.max_concurrent.load(Ordering::SeqCst) <= 2);
}

#[test]
fn serial_parallelism_bucket_runs_one_at_a_time() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::with_install_delay(Duration::from_millis(30)));
    let ctx = context(helm.clone());

    let mut config = stack_config(td.path(), &[("s0", &[]), ("s1", &[]), ("s2", &[])]);
    for release in &mut config.releases {
        release.parallelism = Some("serial".to_string());
    }
    let plan = compile(&config, None, Utc::now()).expect("compile");

    let report = engine::run(&ctx, plan, &apply_options(), Vec::new()).expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(helm.max_concurrent.load(Ordering::SeqCst), 1);

    let events = read_events(&report.run_root);
    assert!(
        events
            .iter()
            .any(|e| e.kind == RunEventKind::BudgetWait
                && e.fields.get("reason").and_then(|v| v.as_str()) == Some("parallelism"))
    );
}

#[test]
fn terminal_failure_blocks_descendants() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::default());
    helm.fail_next_installs("b", &["chart not found: b-9.9.9"]);
    let ctx = context(helm.clone());

    let config = stack_config(td.path(), &[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
    let plan = compile(&config, None, Utc::now()).expect("compile");

    let report = engine::run(&ctx, plan, &apply_options(), Vec::new()).expect("run");
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(
        report.nodes[&NodeId::from("eu/a")].status,
        NodeState::Succeeded
    );
    let b = &report.nodes[&NodeId::from("eu/b")];
    assert_eq!(b.status, NodeState::Failed);
    let error = b.last_error.as_ref().expect("error recorded");
    assert_eq!(error.class, ErrorClass::HelmError);
    assert!(!error.digest.is_empty());
    assert_eq!(
        report.nodes[&NodeId::from("eu/c")].status,
        NodeState::Blocked
    );

    let events = read_events(&report.run_root);
    assert!(
        events
            .iter()
            .any(|e| e.kind == RunEventKind::NodeBlocked
                && e.node_id == Some(NodeId::from("eu/c")))
    );
    // c never started.
    assert!(!helm.installed_releases().contains(&"c".to_string()));
}

#[test]
fn resume_with_rerun_failed_reexecutes_only_the_failure() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::default());
    helm.fail_next_installs("b", &["chart not found: b-9.9.9"]);
    let ctx = context(helm.clone());

    let config = stack_config(td.path(), &[("a", &[]), ("b", &["a"])]);
    let plan = compile(&config, None, Utc::now()).expect("compile");

    let report = engine::run(&ctx, plan, &apply_options(), Vec::new()).expect("first run");
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(
        report.nodes[&NodeId::from("eu/a")].status,
        NodeState::Succeeded
    );
    assert_eq!(report.nodes[&NodeId::from("eu/b")].status, NodeState::Failed);

    // The failure is consumed; the retryed install will succeed now.
    helm.clear_install_log();
    let plan = compile(&config, None, Utc::now()).expect("recompile");
    let opts = RunOptions {
        resume: true,
        rerun_failed: true,
        ..apply_options()
    };
    let resumed = engine::run(&ctx, plan, &opts, Vec::new()).expect("resume");

    assert_eq!(resumed.status, RunStatus::Succeeded);
    assert_eq!(helm.installed_releases(), vec!["b".to_string()]);
    assert_eq!(
        resumed.nodes[&NodeId::from("eu/b")].status,
        NodeState::Succeeded
    );
    // a's earlier result is carried through in the merged status map.
    assert_eq!(
        resumed.nodes[&NodeId::from("eu/a")].status,
        NodeState::Succeeded
    );
}

#[test]
fn resume_refuses_drifted_values_unless_allowed() {
    let td = tempdir().expect("tempdir");
    let values_dir = td.path().join("values");
    fs::create_dir_all(&values_dir).expect("mkdir");
    fs::write(values_dir.join("app.yaml"), "replicas: 1\n").expect("write values");

    let helm = Arc::new(ScriptedHelm::default());
    let ctx = context(helm.clone());

    let mut config = stack_config(td.path(), &[("app", &[])]);
    config.releases[0].values = vec!["values/app.yaml".into()];
    let plan = compile(&config, None, Utc::now()).expect("compile");

    let report = engine::run(&ctx, plan, &apply_options(), Vec::new()).expect("first run");
    assert_eq!(report.status, RunStatus::Succeeded);

    // Edit the values file the release references.
    fs::write(values_dir.join("app.yaml"), "replicas: 5\n").expect("edit values");

    let plan = compile(&config, None, Utc::now()).expect("recompile");
    let opts = RunOptions {
        resume: true,
        ..apply_options()
    };
    let err = engine::run(&ctx, plan, &opts, Vec::new()).expect_err("drift must abort");
    let message = format!("{err:#}");
    assert!(message.contains("eu/app"));
    assert!(message.contains("values file changed: values/app.yaml"));

    // Explicitly allowing drift proceeds.
    let plan = compile(&config, None, Utc::now()).expect("recompile again");
    let opts = RunOptions {
        resume: true,
        allow_drift: true,
        ..apply_options()
    };
    let resumed = engine::run(&ctx, plan, &opts, Vec::new()).expect("allow-drift resume");
    assert_eq!(resumed.status, RunStatus::Succeeded);
}

#[test]
fn rate_limited_installs_retry_with_backoff_until_success() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::default());
    helm.fail_next_installs(
        "app",
        &["429 too many requests", "429 too many requests"],
    );
    let ctx = context(helm.clone());

    let mut config = stack_config(td.path(), &[("app", &[])]);
    config.releases[0].retry.max_attempts = 3;
    let plan = compile(&config, None, Utc::now()).expect("compile");

    let report = engine::run(&ctx, plan, &apply_options(), Vec::new()).expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    let app = &report.nodes[&NodeId::from("eu/app")];
    assert_eq!(app.status, NodeState::Succeeded);
    assert_eq!(app.attempt, 3);

    let events = read_events(&report.run_root);
    let retries: Vec<_> = events
        .iter()
        .filter(|e| e.kind == RunEventKind::RetryScheduled)
        .collect();
    assert_eq!(retries.len(), 2);
    for retry in retries {
        let error = retry.error.as_ref().expect("classified error");
        assert_eq!(error.class, ErrorClass::HelmRateLimit);
        assert!(retry.fields.contains_key("delayMs"));
    }
}

#[test]
fn retries_exhaust_into_terminal_failure() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::default());
    helm.fail_next_installs(
        "app",
        &[
            "429 too many requests",
            "429 too many requests",
            "429 too many requests",
        ],
    );
    let ctx = context(helm.clone());

    let mut config = stack_config(td.path(), &[("app", &[])]);
    config.releases[0].retry.max_attempts = 2;
    let plan = compile(&config, None, Utc::now()).expect("compile");

    let report = engine::run(&ctx, plan, &apply_options(), Vec::new()).expect("run");
    assert_eq!(report.status, RunStatus::Failed);
    let app = &report.nodes[&NodeId::from("eu/app")];
    assert_eq!(app.status, NodeState::Failed);
    assert_eq!(app.attempt, 2);
    assert_eq!(
        app.last_error.as_ref().expect("error").class,
        ErrorClass::HelmRateLimit
    );
}

#[test]
fn fail_fast_cancels_independent_branches() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::with_install_delay(Duration::from_millis(20)));
    helm.fail_next_installs("bad", &["chart not found"]);
    let ctx = context(helm.clone());

    // One failing release and a long tail of independent ones; with
    // fail-fast and concurrency 1 the tail is abandoned.
    let releases: Vec<(&str, &[&str])> = vec![
        ("bad", &[]),
        ("t0", &["bad"]),
        ("x0", &[]),
        ("x1", &[]),
        ("x2", &[]),
        ("x3", &[]),
    ];
    let config = stack_config(td.path(), &releases);
    let plan = compile(&config, None, Utc::now()).expect("compile");

    let opts = RunOptions {
        concurrency: 1,
        fail_fast: true,
        ..RunOptions::default()
    };
    let report = engine::run(&ctx, plan, &opts, Vec::new()).expect("run");
    assert_eq!(report.status, RunStatus::Canceled);

    // The dependent is blocked; at least some of the independent tail
    // never ran and was left skipped.
    assert_eq!(
        report.nodes[&NodeId::from("eu/t0")].status,
        NodeState::Blocked
    );
    let skipped = report
        .nodes
        .values()
        .filter(|s| s.status == NodeState::Skipped)
        .count();
    assert!(skipped > 0, "expected skipped nodes, got {:?}", report.nodes);
}

#[test]
fn plan_only_runs_no_installs() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::default());
    let ctx = context(helm.clone());

    let config = stack_config(td.path(), &[("a", &[]), ("b", &["a"])]);
    let plan = compile(&config, None, Utc::now()).expect("compile");

    let opts = RunOptions {
        plan_only: true,
        ..apply_options()
    };
    let report = engine::run(&ctx, plan, &opts, Vec::new()).expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(helm.installed_releases().is_empty());

    let events = read_events(&report.run_root);
    let phases: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == RunEventKind::PhaseStarted)
        .filter_map(|e| e.fields.get("phase").and_then(|v| v.as_str()))
        .collect();
    assert!(phases.contains(&"diff"));
    assert!(!phases.contains(&"apply"));
}

#[test]
fn delete_runs_in_reverse_dependency_order() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::default());
    let ctx = context(helm.clone());

    let config = stack_config(td.path(), &[("db", &[]), ("api", &["db"])]);
    let plan = compile(&config, None, Utc::now()).expect("compile");
    let report = engine::run(&ctx, plan, &apply_options(), Vec::new()).expect("apply");
    assert_eq!(report.status, RunStatus::Succeeded);

    helm.clear_install_log();
    let plan = compile(&config, None, Utc::now()).expect("recompile");
    let opts = RunOptions {
        command: ktl_stack::types::RunCommand::Delete,
        ..apply_options()
    };
    let report = engine::run(&ctx, plan, &opts, Vec::new()).expect("delete");
    assert_eq!(report.status, RunStatus::Succeeded);

    let log = helm.installed_releases();
    let api_pos = log
        .iter()
        .position(|e| e == "uninstall:api")
        .expect("api uninstalled");
    let db_pos = log
        .iter()
        .position(|e| e == "uninstall:db")
        .expect("db uninstalled");
    assert!(api_pos < db_pos, "dependent deletes before its dependency");
}

#[test]
fn run_summary_receipt_is_written() {
    let td = tempdir().expect("tempdir");
    let helm = Arc::new(ScriptedHelm::default());
    let ctx = context(helm.clone());

    let config = stack_config(td.path(), &[("app", &[])]);
    let plan = compile(&config, None, Utc::now()).expect("compile");
    let report = engine::run(&ctx, plan, &apply_options(), Vec::new()).expect("run");

    let store = ktl_stack::store::RunStore::open(&report.run_root);
    let summary = store.load_summary().expect("load").expect("present");
    assert_eq!(summary.run_id, report.run_id);
    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.nodes.len(), 1);
    assert_eq!(summary.nodes[0].attempt, 1);
}
