use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ktl_manifest::{NormalizeOptions, api_group_version, parse_manifest};

use crate::kube::{FetchOutcome, KubeApi, ManifestTarget, value_path};
use crate::runtime::{CancelToken, Clock};
use crate::types::Cluster;

/// Normalized readiness of one tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    Ready,
    Progressing,
    Pending,
    Failed,
    Unknown,
}

/// Snapshot row for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub status: ResourceState,
    pub reason: String,
    pub message: String,
}

/// Aggregate counts over a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub ready: usize,
    pub progressing: usize,
    pub pending: usize,
    pub failed: usize,
    pub unknown: usize,
}

impl HealthSummary {
    pub fn from_statuses(statuses: &[ResourceStatus]) -> Self {
        let mut summary = Self::default();
        for status in statuses {
            match status.status {
                ResourceState::Ready => summary.ready += 1,
                ResourceState::Progressing => summary.progressing += 1,
                ResourceState::Pending => summary.pending += 1,
                ResourceState::Failed => summary.failed += 1,
                ResourceState::Unknown => summary.unknown += 1,
            }
        }
        summary
    }

    pub fn all_ready(&self) -> bool {
        self.progressing == 0 && self.pending == 0 && self.failed == 0 && self.unknown == 0
    }

    pub fn total(&self) -> usize {
        self.ready + self.progressing + self.pending + self.failed + self.unknown
    }
}

/// How a wait for readiness ended.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Ready { at: DateTime<Utc> },
    TimedOut { pending: Vec<ResourceStatus> },
    Cancelled,
}

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "StorageClass",
    "PersistentVolume",
    "PriorityClass",
];

/// Extract the `(group, version, kind, namespace, name)` tuples a rendered
/// manifest says should exist.
///
/// Hook objects are excluded: they are transient jobs that Helm removes,
/// not resources whose readiness the release owns.
pub fn extract_targets(manifest: &str, default_namespace: &str) -> Result<Vec<ManifestTarget>> {
    let objects = parse_manifest(manifest, &NormalizeOptions::default())?;
    let mut targets = Vec::new();
    for object in objects.into_iter().filter(|o| !o.is_hook) {
        let (group, version) = api_group_version(&object.api_version);
        let namespace = object.namespace.clone().or_else(|| {
            if CLUSTER_SCOPED_KINDS.contains(&object.kind.as_str()) {
                None
            } else {
                Some(default_namespace.to_string())
            }
        });
        targets.push(ManifestTarget {
            group: group.to_string(),
            version: version.to_string(),
            kind: object.kind.clone(),
            namespace,
            name: object.name.clone(),
        });
    }
    targets.sort();
    targets.dedup();
    Ok(targets)
}

/// Kind-specific readiness rules over an untyped object.
///
/// Known workload kinds get real readiness logic; anything else counts as
/// `Ready` merely by existing, because the tracker cannot know what
/// healthy means for it.
pub fn assess_object(kind: &str, object: &Value) -> (ResourceState, String, String) {
    match kind {
        "Deployment" => assess_deployment(object),
        "StatefulSet" => assess_stateful_set(object),
        "DaemonSet" => assess_daemon_set(object),
        "Job" => assess_job(object),
        "CronJob" => (ResourceState::Ready, "Exists".into(), String::new()),
        "Pod" => assess_pod(object),
        "PodDisruptionBudget" => assess_pdb(object),
        "HorizontalPodAutoscaler" => assess_hpa(object),
        _ => (ResourceState::Ready, "Exists".into(), String::new()),
    }
}

fn int_at(object: &Value, path: &str) -> i64 {
    value_path(object, path).and_then(Value::as_i64).unwrap_or(0)
}

fn assess_deployment(object: &Value) -> (ResourceState, String, String) {
    let desired = value_path(object, "spec.replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let ready = int_at(object, "status.readyReplicas");
    let updated = int_at(object, "status.updatedReplicas");
    let observed = int_at(object, "status.observedGeneration");
    let generation = int_at(object, "metadata.generation");

    if generation > 0 && observed < generation {
        return (
            ResourceState::Progressing,
            "GenerationLag".into(),
            format!("observed generation {observed} behind {generation}"),
        );
    }
    if ready >= desired && updated >= desired {
        (ResourceState::Ready, "ReplicasReady".into(), String::new())
    } else {
        (
            ResourceState::Progressing,
            "ReplicasUnready".into(),
            format!("{ready}/{desired} replicas ready"),
        )
    }
}

fn assess_stateful_set(object: &Value) -> (ResourceState, String, String) {
    let desired = value_path(object, "spec.replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let ready = int_at(object, "status.readyReplicas");
    let current = value_path(object, "status.currentRevision").and_then(Value::as_str);
    let update = value_path(object, "status.updateRevision").and_then(Value::as_str);

    if let (Some(current), Some(update)) = (current, update) {
        if current != update {
            return (
                ResourceState::Progressing,
                "RevisionRollout".into(),
                format!("rolling from {current} to {update}"),
            );
        }
    }
    if ready >= desired {
        (ResourceState::Ready, "ReplicasReady".into(), String::new())
    } else {
        (
            ResourceState::Progressing,
            "ReplicasUnready".into(),
            format!("{ready}/{desired} replicas ready"),
        )
    }
}

fn assess_daemon_set(object: &Value) -> (ResourceState, String, String) {
    let desired = int_at(object, "status.desiredNumberScheduled");
    let ready = int_at(object, "status.numberReady");
    if ready >= desired {
        (ResourceState::Ready, "PodsReady".into(), String::new())
    } else {
        (
            ResourceState::Progressing,
            "PodsUnready".into(),
            format!("{ready}/{desired} pods ready"),
        )
    }
}

fn assess_job(object: &Value) -> (ResourceState, String, String) {
    let completions = value_path(object, "spec.completions")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let succeeded = int_at(object, "status.succeeded");
    let failed = int_at(object, "status.failed");
    let backoff_limit = value_path(object, "spec.backoffLimit")
        .and_then(Value::as_i64)
        .unwrap_or(6);

    if succeeded >= completions {
        (ResourceState::Ready, "Completed".into(), String::new())
    } else if failed > backoff_limit {
        (
            ResourceState::Failed,
            "BackoffLimitExceeded".into(),
            format!("{failed} failed pods"),
        )
    } else {
        (
            ResourceState::Progressing,
            "Running".into(),
            format!("{succeeded}/{completions} completions"),
        )
    }
}

fn assess_pod(object: &Value) -> (ResourceState, String, String) {
    let phase = value_path(object, "status.phase")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");

    // A container stuck in CrashLoopBackOff keeps phase Running; surface
    // it as failed instead of progressing forever.
    if let Some(statuses) = value_path(object, "status.containerStatuses").and_then(Value::as_array)
    {
        for status in statuses {
            let waiting_reason = value_path(status, "state.waiting.reason").and_then(Value::as_str);
            if waiting_reason == Some("CrashLoopBackOff") {
                return (
                    ResourceState::Failed,
                    "CrashLoopBackOff".into(),
                    format!(
                        "container {} crash-looping",
                        status.get("name").and_then(Value::as_str).unwrap_or("?")
                    ),
                );
            }
        }
    }

    match phase {
        "Succeeded" => (ResourceState::Ready, "Succeeded".into(), String::new()),
        "Failed" => (ResourceState::Failed, "PodFailed".into(), String::new()),
        "Pending" => (ResourceState::Pending, "Pending".into(), String::new()),
        "Running" => {
            let all_ready = value_path(object, "status.containerStatuses")
                .and_then(Value::as_array)
                .map(|statuses| {
                    statuses
                        .iter()
                        .all(|s| s.get("ready").and_then(Value::as_bool).unwrap_or(false))
                })
                .unwrap_or(false);
            if all_ready {
                (ResourceState::Ready, "Running".into(), String::new())
            } else {
                (
                    ResourceState::Progressing,
                    "ContainersUnready".into(),
                    String::new(),
                )
            }
        }
        other => (ResourceState::Unknown, other.to_string(), String::new()),
    }
}

fn assess_pdb(object: &Value) -> (ResourceState, String, String) {
    let healthy = int_at(object, "status.currentHealthy");
    let desired = int_at(object, "status.desiredHealthy");
    if healthy >= desired {
        (ResourceState::Ready, "HealthyBudget".into(), String::new())
    } else {
        (
            ResourceState::Pending,
            "InsufficientHealthy".into(),
            format!("{healthy}/{desired} healthy"),
        )
    }
}

fn assess_hpa(object: &Value) -> (ResourceState, String, String) {
    match crate::kube::condition_status(object, "ScalingActive") {
        Some("False") => (
            ResourceState::Pending,
            "ScalingInactive".into(),
            String::new(),
        ),
        _ => (ResourceState::Ready, "Exists".into(), String::new()),
    }
}

/// Live readiness tracker for one running release.
///
/// Polls the tracked targets at a fixed cadence, fetching each target
/// concurrently, and falls back to the instance label selector to pick up
/// workloads the manifest does not name directly (e.g. pods created by
/// owned controllers).
pub struct ResourceTracker {
    kube: Arc<dyn KubeApi>,
    clock: Arc<dyn Clock>,
    cluster: Cluster,
    release: String,
    targets: Vec<ManifestTarget>,
    namespaces: BTreeSet<String>,
    pub poll_interval: Duration,
}

impl ResourceTracker {
    pub fn new(
        kube: Arc<dyn KubeApi>,
        clock: Arc<dyn Clock>,
        cluster: Cluster,
        release: String,
        default_namespace: &str,
        targets: Vec<ManifestTarget>,
    ) -> Self {
        let mut namespaces: BTreeSet<String> = targets
            .iter()
            .filter_map(|t| t.namespace.clone())
            .collect();
        namespaces.insert(default_namespace.to_string());

        Self {
            kube,
            clock,
            cluster,
            release,
            targets,
            namespaces,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn targets(&self) -> &[ManifestTarget] {
        &self.targets
    }

    pub fn namespaces(&self) -> &BTreeSet<String> {
        &self.namespaces
    }

    /// One poll: per-target status plus label-selector fallback.
    pub fn snapshot(&self) -> Vec<ResourceStatus> {
        let mut statuses: Vec<ResourceStatus> = Vec::with_capacity(self.targets.len());

        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .targets
                .iter()
                .map(|target| scope.spawn(move || self.fetch_one(target)))
                .collect();
            for handle in handles {
                if let Ok(status) = handle.join() {
                    statuses.push(status);
                }
            }
        });

        // Label fallback: workloads tagged with the release instance that
        // the manifest does not name (dependents like Pods, PDBs, HPAs).
        let mut seen: BTreeSet<(String, Option<String>, String)> = statuses
            .iter()
            .map(|s| (s.kind.clone(), s.namespace.clone(), s.name.clone()))
            .collect();
        for namespace in &self.namespaces {
            let Ok(objects) =
                self.kube
                    .list_instance_workloads(&self.cluster, namespace, &self.release)
            else {
                continue;
            };
            for object in objects {
                let Some(kind) = object.get("kind").and_then(Value::as_str) else {
                    continue;
                };
                let Some(name) = value_path(&object, "metadata.name").and_then(Value::as_str)
                else {
                    continue;
                };
                let key = (
                    kind.to_string(),
                    Some(namespace.clone()),
                    name.to_string(),
                );
                if !seen.insert(key) {
                    continue;
                }
                let (state, reason, message) = assess_object(kind, &object);
                statuses.push(ResourceStatus {
                    kind: kind.to_string(),
                    namespace: Some(namespace.clone()),
                    name: name.to_string(),
                    status: state,
                    reason,
                    message,
                });
            }
        }

        statuses.sort_by(|a, b| {
            (&a.kind, &a.namespace, &a.name).cmp(&(&b.kind, &b.namespace, &b.name))
        });
        statuses
    }

    fn fetch_one(&self, target: &ManifestTarget) -> ResourceStatus {
        let base = |status: ResourceState, reason: &str, message: String| ResourceStatus {
            kind: target.kind.clone(),
            namespace: target.namespace.clone(),
            name: target.name.clone(),
            status,
            reason: reason.to_string(),
            message,
        };

        match self.kube.get_object(&self.cluster, target) {
            Ok(FetchOutcome::Found(object)) => {
                let (state, reason, message) = assess_object(&target.kind, &object);
                base(state, &reason, message)
            }
            Ok(FetchOutcome::Missing) => base(ResourceState::Pending, "NotFound", String::new()),
            Ok(FetchOutcome::Forbidden) => {
                base(ResourceState::Unknown, "Forbidden", String::new())
            }
            Err(err) => base(ResourceState::Unknown, "Error", format!("{err:#}")),
        }
    }

    /// Poll until every tracked resource is Ready, the deadline passes, or
    /// the run is cancelled. `on_snapshot` observes every poll.
    pub fn wait_until_ready(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
        mut on_snapshot: impl FnMut(&[ResourceStatus], &HealthSummary),
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }

            let statuses = self.snapshot();
            let summary = HealthSummary::from_statuses(&statuses);
            on_snapshot(&statuses, &summary);

            if summary.all_ready() {
                return WaitOutcome::Ready {
                    at: self.clock.now(),
                };
            }
            if Instant::now() >= deadline {
                let pending = statuses
                    .into_iter()
                    .filter(|s| s.status != ResourceState::Ready)
                    .collect();
                return WaitOutcome::TimedOut { pending };
            }

            // Sleep in short slices so cancellation is observed promptly.
            let mut remaining = self
                .poll_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            while remaining > Duration::ZERO {
                if cancel.is_cancelled() {
                    return WaitOutcome::Cancelled;
                }
                let slice = remaining.min(Duration::from_millis(100));
                std::thread::sleep(slice);
                remaining = remaining.saturating_sub(slice);
            }
        }
    }
}
