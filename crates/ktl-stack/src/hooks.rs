use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::process::{run_command_with_timeout, tail_lines};
use crate::runtime::CancelToken;
use crate::store::RunStore;
use crate::types::{
    Cluster, ErrorClass, HookSpec, HookType, HookWhen, RunError, RunEvent, RunEventKind,
};

/// Result of one hook invocation.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl HookOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Execution surroundings for a hook: where it runs and against what.
pub struct HookEnv<'a> {
    /// Cluster for kubectl hooks; `None` for stack-scoped script hooks.
    pub cluster: Option<&'a Cluster>,
    pub namespace: Option<&'a str>,
    /// Default working directory (the stack root).
    pub work_dir: &'a Path,
    pub timeout: Duration,
    /// Tail length kept in events and failure messages.
    pub output_lines: usize,
    /// Where full stdout/stderr are captured, when set.
    pub capture_dir: Option<&'a Path>,
    /// File-name base for captured output.
    pub capture_key: String,
}

/// Run one hook to completion, capturing output.
pub fn execute_hook(
    hook: &HookSpec,
    env: &HookEnv<'_>,
    cancel: &CancelToken,
) -> Result<HookOutcome> {
    let (program, args, work_dir) = match hook.hook_type {
        HookType::Kubectl => {
            let spec = hook
                .kubectl
                .as_ref()
                .context("kubectl hook is missing its kubectl block")?;
            let mut args = spec.args.clone();
            if let Some(cluster) = env.cluster {
                args.push("--context".to_string());
                args.push(cluster.context.clone());
                args.push("--kubeconfig".to_string());
                args.push(cluster.kubeconfig.display().to_string());
            }
            if let Some(namespace) = env.namespace {
                args.push("--namespace".to_string());
                args.push(namespace.to_string());
            }
            (kubectl_program(), args, env.work_dir.to_path_buf())
        }
        HookType::Script => {
            let spec = hook
                .script
                .as_ref()
                .context("script hook is missing its script block")?;
            let Some((program, rest)) = spec.command.split_first() else {
                bail!("script hook {} has an empty command", hook.summary);
            };
            let work_dir = spec
                .work_dir
                .clone()
                .unwrap_or_else(|| env.work_dir.to_path_buf());
            (program.clone(), rest.to_vec(), work_dir)
        }
    };

    let output = run_command_with_timeout(&program, &args, &work_dir, Some(env.timeout), cancel)
        .with_context(|| format!("failed to execute hook {}", hook.summary))?;

    if let Some(dir) = env.capture_dir {
        let _ = fs::create_dir_all(dir);
        let _ = fs::write(dir.join(format!("{}.stdout", env.capture_key)), &output.stdout);
        let _ = fs::write(dir.join(format!("{}.stderr", env.capture_key)), &output.stderr);
    }

    Ok(HookOutcome {
        exit_code: output.exit_code,
        stdout_tail: tail_lines(&output.stdout, env.output_lines),
        stderr_tail: tail_lines(&output.stderr, env.output_lines),
        duration: output.duration,
        timed_out: output.timed_out,
    })
}

fn kubectl_program() -> String {
    env::var("KTL_KUBECTL_BIN").unwrap_or_else(|_| "kubectl".to_string())
}

pub(crate) fn when_key(when: HookWhen) -> &'static str {
    match when {
        HookWhen::PreApply => "pre-apply",
        HookWhen::PostApply => "post-apply",
        HookWhen::PreDelete => "pre-delete",
        HookWhen::PostDelete => "post-delete",
    }
}

/// Run every hook of `hooks` matching `when`, in declared order, emitting
/// hook events through `emit`.
///
/// `run_once` hooks leave a marker in the run store and are skipped when
/// the marker already exists (a resumed run). The first failure stops the
/// sequence and is returned as a classified error.
#[allow(clippy::too_many_arguments)]
pub fn run_hook_set(
    hooks: &[HookSpec],
    when: HookWhen,
    cluster: Option<&Cluster>,
    namespace: Option<&str>,
    work_dir: &Path,
    timeout: Duration,
    output_lines: usize,
    store: Option<&RunStore>,
    marker_prefix: &str,
    cancel: &CancelToken,
    emit: &mut dyn FnMut(RunEvent),
) -> Result<(), RunError> {
    for (index, hook) in hooks.iter().filter(|h| h.when == when).enumerate() {
        let key = format!("{marker_prefix}-{}-{index}", when_key(when));

        if hook.run_once {
            if let Some(store) = store {
                if store.hook_marker(&key).exists() {
                    emit(
                        RunEvent::new(RunEventKind::HookSkipped)
                            .message(hook.summary.clone())
                            .field("reason", "already ran in this run"),
                    );
                    continue;
                }
            }
        }

        emit(
            RunEvent::new(RunEventKind::HookStarted)
                .message(hook.summary.clone())
                .field("when", when_key(when)),
        );

        let capture_dir = store.map(|s| s.hooks_dir());
        let env = HookEnv {
            cluster,
            namespace,
            work_dir,
            timeout,
            output_lines,
            capture_dir: capture_dir.as_deref(),
            capture_key: key.clone(),
        };

        let result = execute_hook(hook, &env, cancel);
        match result {
            Ok(outcome) if outcome.success() => {
                if hook.run_once {
                    if let Some(store) = store {
                        let _ = fs::write(store.hook_marker(&key), b"done");
                    }
                }
                emit(
                    RunEvent::new(RunEventKind::HookSucceeded)
                        .message(hook.summary.clone())
                        .field("durationMs", outcome.duration.as_millis() as u64)
                        .field("exitCode", outcome.exit_code),
                );
            }
            Ok(outcome) => {
                let cause = if outcome.timed_out {
                    format!("hook {} timed out", hook.summary)
                } else if outcome.stderr_tail.is_empty() {
                    format!("hook {} exited with code {}", hook.summary, outcome.exit_code)
                } else {
                    format!(
                        "hook {} exited with code {}: {}",
                        hook.summary, outcome.exit_code, outcome.stderr_tail
                    )
                };
                let error = RunError::new(ErrorClass::HookFailed, cause);
                emit(
                    RunEvent::new(RunEventKind::HookFailed)
                        .message(hook.summary.clone())
                        .field("exitCode", outcome.exit_code)
                        .error(error.clone()),
                );
                return Err(error);
            }
            Err(err) => {
                let error = RunError::new(
                    ErrorClass::HookFailed,
                    format!("hook {} failed to start: {err:#}", hook.summary),
                );
                emit(
                    RunEvent::new(RunEventKind::HookFailed)
                        .message(hook.summary.clone())
                        .error(error.clone()),
                );
                return Err(error);
            }
        }
    }
    Ok(())
}
