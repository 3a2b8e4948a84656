use std::collections::BTreeSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::helm::classify_kube_failure;
use crate::kube::{FetchOutcome, ManifestTarget, WarningEvent, condition_status};
use crate::runtime::{CancelToken, RuntimeContext};
use crate::types::{ErrorClass, ReleaseNode, RunError};

/// Result of the verify stage.
///
/// `Warned` carries findings demoted by `warn_only`; the node still
/// succeeds but the messages are logged.
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    Passed,
    Warned(Vec<String>),
    Failed(RunError),
}

/// Post-apply verification: required status conditions on referenced
/// objects, then a scan for Warning events targeting the release's
/// objects.
///
/// Workload readiness is a precondition established by the caller (the
/// wait phase, or a dedicated readiness wait when `wait` was off).
pub fn run_verify(
    ctx: &RuntimeContext,
    node: &ReleaseNode,
    targets: &[ManifestTarget],
    namespaces: &BTreeSet<String>,
    readiness_reached_at: DateTime<Utc>,
    cancel: &CancelToken,
) -> VerifyOutcome {
    if let Some(error) = check_required_conditions(ctx, node, targets, cancel) {
        return finish(node, Some(error));
    }

    if node.verify.fail_on_warnings {
        if let Some(error) =
            check_warning_events(ctx, node, targets, namespaces, readiness_reached_at)
        {
            return finish(node, Some(error));
        }
    }

    finish(node, None)
}

fn finish(node: &ReleaseNode, error: Option<RunError>) -> VerifyOutcome {
    match error {
        None => VerifyOutcome::Passed,
        Some(error) if node.verify.warn_only && error.class == ErrorClass::VerifyFailed => {
            VerifyOutcome::Warned(vec![error.message])
        }
        Some(error) => VerifyOutcome::Failed(error),
    }
}

fn check_required_conditions(
    ctx: &RuntimeContext,
    node: &ReleaseNode,
    targets: &[ManifestTarget],
    cancel: &CancelToken,
) -> Option<RunError> {
    for requirement in &node.verify.require_conditions {
        if cancel.is_cancelled() {
            return Some(RunError::new(
                ErrorClass::Internal,
                "run canceled during verify",
            ));
        }

        let mapping = match ctx
            .kube
            .rest_mapping(&node.cluster, &requirement.group, &requirement.kind)
        {
            Ok(mapping) => mapping,
            Err(err) => {
                let message = format!(
                    "failed to resolve {}/{}: {err:#}",
                    requirement.group, requirement.kind
                );
                return Some(RunError::new(classify_kube_failure(&message), message));
            }
        };
        if mapping.is_none() {
            if requirement.allow_missing {
                continue;
            }
            return Some(RunError::new(
                ErrorClass::VerifyFailed,
                format!(
                    "no server mapping for required kind {}/{}",
                    requirement.group, requirement.kind
                ),
            ));
        }

        let matching: Vec<&ManifestTarget> = targets
            .iter()
            .filter(|t| t.group == requirement.group && t.kind == requirement.kind)
            .collect();
        if matching.is_empty() {
            if requirement.allow_missing {
                continue;
            }
            return Some(RunError::new(
                ErrorClass::VerifyFailed,
                format!(
                    "release renders no {}/{} object to satisfy required condition {}",
                    requirement.group, requirement.kind, requirement.condition_type
                ),
            ));
        }

        for target in matching {
            match ctx.kube.get_object(&node.cluster, target) {
                Ok(FetchOutcome::Found(object)) => {
                    match condition_status(&object, &requirement.condition_type) {
                        Some(status) if status == requirement.require_status => {}
                        Some(status) => {
                            return Some(RunError::new(
                                ErrorClass::VerifyFailed,
                                format!(
                                    "{target}: condition {} is {status}, want {}",
                                    requirement.condition_type, requirement.require_status
                                ),
                            ));
                        }
                        None => {
                            return Some(RunError::new(
                                ErrorClass::VerifyFailed,
                                format!(
                                    "{target}: condition {} not reported",
                                    requirement.condition_type
                                ),
                            ));
                        }
                    }
                }
                Ok(FetchOutcome::Missing) | Ok(FetchOutcome::Forbidden) => {
                    if !requirement.allow_missing {
                        return Some(RunError::new(
                            ErrorClass::VerifyFailed,
                            format!("{target}: required object is missing"),
                        ));
                    }
                }
                Err(err) => {
                    let message = format!("{target}: fetch failed: {err:#}");
                    return Some(RunError::new(classify_kube_failure(&message), message));
                }
            }
        }
    }
    None
}

fn check_warning_events(
    ctx: &RuntimeContext,
    node: &ReleaseNode,
    targets: &[ManifestTarget],
    namespaces: &BTreeSet<String>,
    readiness_reached_at: DateTime<Utc>,
) -> Option<RunError> {
    let now = ctx.clock.now();
    let window_start = window_start(now, readiness_reached_at, node);

    let mut warnings: Vec<WarningEvent> = Vec::new();
    for namespace in namespaces {
        let events = match ctx
            .kube
            .list_warning_events(&node.cluster, namespace, window_start)
        {
            Ok(events) => events,
            Err(err) => {
                let message = format!("failed to list events in {namespace}: {err:#}");
                return Some(RunError::new(classify_kube_failure(&message), message));
            }
        };
        for event in events {
            if !targets_event(targets, &event) {
                continue;
            }
            if reason_allowed(node, &event.reason) {
                continue;
            }
            warnings.push(event);
        }
    }

    if warnings.is_empty() {
        return None;
    }

    warnings.sort_by_key(|w| w.last_seen);
    let latest = warnings.last().expect("warnings is non-empty");
    Some(RunError::new(
        ErrorClass::VerifyFailed,
        format!(
            "{} warning event(s) target release objects; latest on {}/{} {}: {}: {}",
            warnings.len(),
            latest.namespace,
            latest.kind,
            latest.name,
            latest.reason,
            latest.message
        ),
    ))
}

/// Scan window start: at least `events_window` back, widened to the
/// readiness instant when readiness took longer than the window.
fn window_start(
    now: DateTime<Utc>,
    readiness_reached_at: DateTime<Utc>,
    node: &ReleaseNode,
) -> DateTime<Utc> {
    let window = ChronoDuration::from_std(node.verify.events_window)
        .unwrap_or_else(|_| ChronoDuration::seconds(300));
    (now - window).min(readiness_reached_at)
}

/// Does the event target one of the manifest's objects, or a pod derived
/// from one?
fn targets_event(targets: &[ManifestTarget], event: &WarningEvent) -> bool {
    targets.iter().any(|target| {
        let namespace_matches = target
            .namespace
            .as_deref()
            .map(|ns| ns == event.namespace)
            .unwrap_or(false);
        if !namespace_matches {
            return false;
        }
        if target.kind == event.kind && target.name == event.name {
            return true;
        }
        // Pods spawned by an owned controller carry generated suffixes.
        event.kind == "Pod" && event.name.starts_with(&format!("{}-", target.name))
    })
}

fn reason_allowed(node: &ReleaseNode, reason: &str) -> bool {
    if node
        .verify
        .deny_warning_reasons
        .iter()
        .any(|denied| denied == reason)
    {
        return false;
    }
    node.verify
        .allow_warning_reasons
        .iter()
        .any(|allowed| allowed == reason)
}
