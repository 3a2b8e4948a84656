//! Shared fakes for scheduler scenario tests: a scripted helm driver and
//! an always-ready kube API.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde_json::Value;

use ktl_stack::helm::{Applied, ApplySettings, ChartFingerprint, HelmDriver, HelmRequest, Rendered};
use ktl_stack::kube::{
    DryRunVerdict, FetchOutcome, KubeApi, ManifestTarget, RestMapping, WarningEvent,
};
use ktl_stack::plan::{ReleaseConfig, StackConfig};
use ktl_stack::runtime::{CancelToken, RuntimeContext};
use ktl_stack::types::{ApplyOptions, Cluster, DeleteOptions, RunEvent, VerifySpec};

/// Helm driver whose behavior is scripted per release.
#[derive(Default)]
pub struct ScriptedHelm {
    /// Deployed manifest per release, updated by installs.
    deployed: Mutex<BTreeMap<String, String>>,
    /// Failure messages consumed by successive install attempts.
    install_failures: Mutex<BTreeMap<String, VecDeque<String>>>,
    /// Releases in the order their installs completed or failed.
    pub install_log: Mutex<Vec<String>>,
    /// Artificial install latency, for concurrency probes.
    pub install_delay: Duration,
    concurrent: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl ScriptedHelm {
    /// Driver whose installs take `delay`, for concurrency probes.
    pub fn with_install_delay(delay: Duration) -> Self {
        Self {
            install_delay: delay,
            ..Self::default()
        }
    }

    pub fn fail_next_installs(&self, release: &str, messages: &[&str]) {
        let mut failures = self.install_failures.lock().expect("lock");
        failures
            .entry(release.to_string())
            .or_default()
            .extend(messages.iter().map(|m| m.to_string()));
    }

    pub fn installed_releases(&self) -> Vec<String> {
        self.install_log.lock().expect("lock").clone()
    }

    pub fn clear_install_log(&self) {
        self.install_log.lock().expect("lock").clear();
    }

    fn manifest_for(release: &str) -> String {
        format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {release}\n  namespace: demo\nspec:\n  replicas: 1\n"
        )
    }
}

impl HelmDriver for ScriptedHelm {
    fn render(&self, request: &HelmRequest) -> Result<Rendered> {
        Ok(Rendered {
            manifest: Self::manifest_for(&request.release),
            notes: String::new(),
            chart_version: Some("1.0.0".to_string()),
        })
    }

    fn deployed_manifest(&self, request: &HelmRequest) -> Result<Option<String>> {
        Ok(self
            .deployed
            .lock()
            .expect("lock")
            .get(&request.release)
            .cloned())
    }

    fn install_or_upgrade(
        &self,
        request: &HelmRequest,
        _settings: &ApplySettings,
        _cancel: &CancelToken,
    ) -> Result<Applied> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        if !self.install_delay.is_zero() {
            std::thread::sleep(self.install_delay);
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        self.install_log
            .lock()
            .expect("lock")
            .push(request.release.clone());

        let failure = self
            .install_failures
            .lock()
            .expect("lock")
            .get_mut(&request.release)
            .and_then(VecDeque::pop_front);
        if let Some(message) = failure {
            bail!("{message}");
        }

        let manifest = Self::manifest_for(&request.release);
        self.deployed
            .lock()
            .expect("lock")
            .insert(request.release.clone(), manifest.clone());
        Ok(Applied {
            manifest,
            log_tail: vec![format!("release \"{}\" deployed", request.release)],
        })
    }

    fn uninstall(
        &self,
        request: &HelmRequest,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<()> {
        self.deployed.lock().expect("lock").remove(&request.release);
        self.install_log
            .lock()
            .expect("lock")
            .push(format!("uninstall:{}", request.release));
        Ok(())
    }

    fn chart_fingerprint(&self, chart: &str, version: Option<&str>) -> Result<ChartFingerprint> {
        Ok(ChartFingerprint {
            resolved_version: Some(version.unwrap_or("1.0.0").to_string()),
            digest: format!("sha256:{chart}"),
        })
    }
}

/// Kube API where every object exists and is immediately ready.
pub struct ReadyKube;

impl KubeApi for ReadyKube {
    fn get_object(&self, _cluster: &Cluster, _target: &ManifestTarget) -> Result<FetchOutcome> {
        Ok(FetchOutcome::Found(serde_json::json!({
            "spec": {"replicas": 1},
            "status": {"readyReplicas": 1, "updatedReplicas": 1}
        })))
    }

    fn rest_mapping(
        &self,
        _cluster: &Cluster,
        group: &str,
        kind: &str,
    ) -> Result<Option<RestMapping>> {
        Ok(Some(RestMapping {
            api_version: if group.is_empty() {
                "v1".to_string()
            } else {
                format!("{group}/v1")
            },
            kind: kind.to_string(),
            namespaced: true,
        }))
    }

    fn list_instance_workloads(
        &self,
        _cluster: &Cluster,
        _namespace: &str,
        _release: &str,
    ) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }

    fn list_warning_events(
        &self,
        _cluster: &Cluster,
        _namespace: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<WarningEvent>> {
        Ok(Vec::new())
    }

    fn dry_run_apply(&self, _cluster: &Cluster, _object: &Value) -> Result<DryRunVerdict> {
        Ok(DryRunVerdict::Accepted)
    }
}

pub fn context(helm: Arc<ScriptedHelm>) -> RuntimeContext {
    RuntimeContext::new(helm, Arc::new(ReadyKube))
}

/// A one-cluster stack with the given `(release, needs)` declarations.
pub fn stack_config(root: &Path, releases: &[(&str, &[&str])]) -> StackConfig {
    StackConfig {
        name: "demo".to_string(),
        root: root.to_path_buf(),
        clusters: vec![Cluster {
            name: "eu".to_string(),
            context: "eu-ctx".to_string(),
            kubeconfig: PathBuf::from("/etc/kube/eu"),
            namespace: Some("demo".to_string()),
        }],
        releases: releases
            .iter()
            .map(|(name, needs)| release_config(name, needs))
            .collect(),
        stack_hooks: Vec::new(),
    }
}

pub fn release_config(name: &str, needs: &[&str]) -> ReleaseConfig {
    ReleaseConfig {
        name: name.to_string(),
        clusters: Vec::new(),
        chart: format!("charts/{name}"),
        chart_version: None,
        namespace: None,
        values: Vec::new(),
        set: BTreeMap::new(),
        needs: needs.iter().map(|n| n.to_string()).collect(),
        hooks: Vec::new(),
        apply: ApplyOptions {
            atomic: false,
            wait: true,
            timeout: Duration::from_secs(5),
        },
        delete: DeleteOptions {
            timeout: Duration::from_secs(5),
        },
        parallelism: None,
        critical: false,
        verify: VerifySpec::default(),
        retry: ktl_retry::RetryPolicy {
            max_attempts: 1,
            backoff: ktl_retry::BackoffConfig {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                multiplier: 1.0,
                jitter: 0.0,
            },
        },
        profiles: BTreeMap::new(),
    }
}

/// Parse the durable event log of a run.
pub fn read_events(run_root: &Path) -> Vec<RunEvent> {
    let content = std::fs::read_to_string(run_root.join("events.jsonl")).expect("events.jsonl");
    content
        .lines()
        .map(|line| serde_json::from_str(line).expect("event line parses"))
        .collect()
}

/// Seq of the first event matching the predicate.
pub fn seq_of(events: &[RunEvent], predicate: impl Fn(&RunEvent) -> bool) -> Option<u64> {
    events.iter().find(|e| predicate(e)).map(|e| e.seq)
}
