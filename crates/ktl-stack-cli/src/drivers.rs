//! Subprocess-backed drivers: `helm` and `kubectl` binaries behind the
//! orchestrator's collaborator traits.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use ktl_stack::helm::{
    Applied, ApplySettings, ChartFingerprint, HelmDriver, HelmRequest, Rendered,
};
use ktl_stack::kube::{
    DryRunVerdict, FetchOutcome, KubeApi, ManifestTarget, RestMapping, WarningEvent,
};
use ktl_stack::runtime::CancelToken;
use ktl_stack::types::Cluster;

struct Exec {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

fn exec(program: &str, args: &[String], stdin: Option<&str>) -> Result<Exec> {
    let mut command = Command::new(program);
    command.args(args);
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .with_context(|| format!("failed to write stdin for {program}"))?;
    }
    let output = child
        .wait_with_output()
        .with_context(|| format!("failed to wait for {program}"))?;

    Ok(Exec {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn helm_program() -> String {
    env::var("KTL_HELM_BIN").unwrap_or_else(|_| "helm".to_string())
}

fn kubectl_program() -> String {
    env::var("KTL_KUBECTL_BIN").unwrap_or_else(|_| "kubectl".to_string())
}

/// Helm driver shelling out to the `helm` binary.
#[derive(Debug, Default)]
pub struct HelmCli;

impl HelmCli {
    fn base_args(request: &HelmRequest) -> Vec<String> {
        vec![
            "--namespace".to_string(),
            request.namespace.clone(),
            "--kube-context".to_string(),
            request.cluster.context.clone(),
            "--kubeconfig".to_string(),
            request.cluster.kubeconfig.display().to_string(),
        ]
    }

    fn chart_args(request: &HelmRequest) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(version) = &request.chart_version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        for values in &request.values {
            args.push("--values".to_string());
            args.push(values.display().to_string());
        }
        for (key, value) in &request.set {
            args.push("--set".to_string());
            args.push(format!("{key}={value}"));
        }
        args
    }
}

impl HelmDriver for HelmCli {
    fn render(&self, request: &HelmRequest) -> Result<Rendered> {
        let mut args = vec![
            "template".to_string(),
            request.release.clone(),
            request.chart.clone(),
        ];
        args.extend(Self::base_args(request));
        args.extend(Self::chart_args(request));

        let out = exec(&helm_program(), &args, None)?;
        if out.exit_code != 0 {
            bail!("helm template failed: {}", out.stderr.trim());
        }
        Ok(Rendered {
            manifest: out.stdout,
            notes: String::new(),
            chart_version: request.chart_version.clone(),
        })
    }

    fn deployed_manifest(&self, request: &HelmRequest) -> Result<Option<String>> {
        let mut args = vec!["get".to_string(), "manifest".to_string(), request.release.clone()];
        args.extend(Self::base_args(request));

        let out = exec(&helm_program(), &args, None)?;
        if out.exit_code != 0 {
            if out.stderr.contains("not found") {
                return Ok(None);
            }
            bail!("helm get manifest failed: {}", out.stderr.trim());
        }
        Ok(Some(out.stdout))
    }

    fn install_or_upgrade(
        &self,
        request: &HelmRequest,
        settings: &ApplySettings,
        _cancel: &CancelToken,
    ) -> Result<Applied> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            request.release.clone(),
            request.chart.clone(),
            "--create-namespace".to_string(),
            "--timeout".to_string(),
            format!("{}s", settings.timeout.as_secs()),
        ];
        if settings.atomic {
            args.push("--atomic".to_string());
        }
        if settings.wait {
            args.push("--wait".to_string());
        }
        args.extend(Self::base_args(request));
        args.extend(Self::chart_args(request));

        let out = exec(&helm_program(), &args, None)?;
        if out.exit_code != 0 {
            bail!("helm upgrade failed: {}", out.stderr.trim());
        }

        let manifest = self
            .deployed_manifest(request)?
            .unwrap_or_default();
        let log_tail = out
            .stdout
            .lines()
            .chain(out.stderr.lines())
            .map(str::to_string)
            .collect();
        Ok(Applied { manifest, log_tail })
    }

    fn uninstall(
        &self,
        request: &HelmRequest,
        timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<()> {
        let mut args = vec![
            "uninstall".to_string(),
            request.release.clone(),
            "--wait".to_string(),
            "--timeout".to_string(),
            format!("{}s", timeout.as_secs()),
        ];
        args.extend(Self::base_args(request));

        let out = exec(&helm_program(), &args, None)?;
        if out.exit_code != 0 && !out.stderr.contains("not found") {
            bail!("helm uninstall failed: {}", out.stderr.trim());
        }
        Ok(())
    }

    fn chart_fingerprint(&self, chart: &str, version: Option<&str>) -> Result<ChartFingerprint> {
        let path = Path::new(chart);
        if path.is_dir() {
            return fingerprint_chart_dir(path);
        }

        // Remote chart references are identified by ref and pinned
        // version; their content is resolved by the registry.
        let mut hasher = Sha256::new();
        hasher.update(b"chart\0");
        hasher.update(chart.as_bytes());
        hasher.update(b"\0");
        hasher.update(version.unwrap_or("").as_bytes());
        Ok(ChartFingerprint {
            resolved_version: version.map(str::to_string),
            digest: format!("sha256:{}", hex::encode(hasher.finalize())),
        })
    }
}

/// Digest every file of a local chart directory in sorted path order,
/// each under a domain-separating prefix.
fn fingerprint_chart_dir(root: &Path) -> Result<ChartFingerprint> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    hasher.update(b"chart\0");
    for file in &files {
        let relative = file.strip_prefix(root).unwrap_or(file);
        hasher.update(b"file\0");
        hasher.update(relative.display().to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(
            &fs::read(file).with_context(|| format!("failed to read {}", file.display()))?,
        );
    }

    let resolved_version = fs::read_to_string(root.join("Chart.yaml"))
        .ok()
        .and_then(|chart| {
            chart.lines().find_map(|line| {
                line.strip_prefix("version:")
                    .map(|v| v.trim().trim_matches('"').to_string())
            })
        });

    Ok(ChartFingerprint {
        resolved_version,
        digest: format!("sha256:{}", hex::encode(hasher.finalize())),
    })
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<()> {
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Kube API shelling out to the `kubectl` binary.
#[derive(Debug, Default)]
pub struct KubectlCli;

impl KubectlCli {
    fn cluster_args(cluster: &Cluster) -> Vec<String> {
        vec![
            "--context".to_string(),
            cluster.context.clone(),
            "--kubeconfig".to_string(),
            cluster.kubeconfig.display().to_string(),
        ]
    }

    fn kind_ref(target: &ManifestTarget) -> String {
        if target.group.is_empty() {
            target.kind.clone()
        } else {
            format!("{}.{}", target.kind, target.group)
        }
    }
}

impl KubeApi for KubectlCli {
    fn get_object(&self, cluster: &Cluster, target: &ManifestTarget) -> Result<FetchOutcome> {
        let mut args = vec![
            "get".to_string(),
            Self::kind_ref(target),
            target.name.clone(),
            "--output".to_string(),
            "json".to_string(),
        ];
        if let Some(namespace) = &target.namespace {
            args.push("--namespace".to_string());
            args.push(namespace.clone());
        }
        args.extend(Self::cluster_args(cluster));

        let out = exec(&kubectl_program(), &args, None)?;
        if out.exit_code != 0 {
            if out.stderr.contains("NotFound") {
                return Ok(FetchOutcome::Missing);
            }
            if out.stderr.contains("Forbidden") || out.stderr.contains("forbidden") {
                return Ok(FetchOutcome::Forbidden);
            }
            bail!("kubectl get failed: {}", out.stderr.trim());
        }
        let value: Value =
            serde_json::from_str(&out.stdout).context("kubectl emitted invalid JSON")?;
        Ok(FetchOutcome::Found(value))
    }

    fn rest_mapping(
        &self,
        cluster: &Cluster,
        group: &str,
        kind: &str,
    ) -> Result<Option<RestMapping>> {
        let mut args = vec![
            "api-resources".to_string(),
            format!("--api-group={group}"),
            "--no-headers".to_string(),
        ];
        args.extend(Self::cluster_args(cluster));

        let out = exec(&kubectl_program(), &args, None)?;
        if out.exit_code != 0 {
            bail!("kubectl api-resources failed: {}", out.stderr.trim());
        }

        // Columns: NAME SHORTNAMES APIVERSION NAMESPACED KIND (SHORTNAMES
        // may be absent, so match from the right).
        for line in out.stdout.lines() {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let [.., api_version, namespaced, found_kind] = columns.as_slice() else {
                continue;
            };
            if *found_kind == kind {
                return Ok(Some(RestMapping {
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                    namespaced: *namespaced == "true",
                }));
            }
        }
        Ok(None)
    }

    fn list_instance_workloads(
        &self,
        cluster: &Cluster,
        namespace: &str,
        release: &str,
    ) -> Result<Vec<Value>> {
        let mut args = vec![
            "get".to_string(),
            "deployments,statefulsets,daemonsets,jobs,cronjobs,pods,poddisruptionbudgets,horizontalpodautoscalers"
                .to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--selector".to_string(),
            format!("app.kubernetes.io/instance={release}"),
            "--output".to_string(),
            "json".to_string(),
        ];
        args.extend(Self::cluster_args(cluster));

        let out = exec(&kubectl_program(), &args, None)?;
        if out.exit_code != 0 {
            bail!("kubectl get by selector failed: {}", out.stderr.trim());
        }
        let value: Value =
            serde_json::from_str(&out.stdout).context("kubectl emitted invalid JSON")?;
        Ok(value
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn list_warning_events(
        &self,
        cluster: &Cluster,
        namespace: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WarningEvent>> {
        let mut args = vec![
            "get".to_string(),
            "events".to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--field-selector".to_string(),
            "type=Warning".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        args.extend(Self::cluster_args(cluster));

        let out = exec(&kubectl_program(), &args, None)?;
        if out.exit_code != 0 {
            bail!("kubectl get events failed: {}", out.stderr.trim());
        }
        let value: Value =
            serde_json::from_str(&out.stdout).context("kubectl emitted invalid JSON")?;

        let mut events = Vec::new();
        for item in value
            .get("items")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let string_at = |path: &[&str]| {
                let mut current = item;
                for segment in path {
                    current = match current.get(segment) {
                        Some(value) => value,
                        None => return String::new(),
                    };
                }
                current.as_str().unwrap_or_default().to_string()
            };

            let last_seen = item
                .get("lastTimestamp")
                .and_then(Value::as_str)
                .and_then(|ts| ts.parse::<DateTime<Utc>>().ok())
                .unwrap_or(since);
            if last_seen < since {
                continue;
            }

            events.push(WarningEvent {
                reason: string_at(&["reason"]),
                message: string_at(&["message"]),
                kind: string_at(&["involvedObject", "kind"]),
                namespace: string_at(&["involvedObject", "namespace"]),
                name: string_at(&["involvedObject", "name"]),
                last_seen,
            });
        }
        Ok(events)
    }

    fn dry_run_apply(&self, cluster: &Cluster, object: &Value) -> Result<DryRunVerdict> {
        let mut args = vec![
            "apply".to_string(),
            "--dry-run=server".to_string(),
            "--filename".to_string(),
            "-".to_string(),
        ];
        args.extend(Self::cluster_args(cluster));

        let payload = serde_json::to_string(object).context("failed to serialize object")?;
        let out = exec(&kubectl_program(), &args, Some(&payload))?;
        if out.exit_code == 0 {
            return Ok(DryRunVerdict::Accepted);
        }
        if out.stderr.contains("field is immutable") || out.stderr.contains("Forbidden: updates") {
            return Ok(DryRunVerdict::ImmutableField(extract_immutable_field(
                &out.stderr,
            )));
        }
        Ok(DryRunVerdict::Rejected(out.stderr.trim().to_string()))
    }
}

/// Best-effort extraction of the offending field from a server rejection
/// like `Deployment.apps "web" is invalid: spec.selector: Invalid value:
/// ...: field is immutable`.
fn extract_immutable_field(stderr: &str) -> String {
    for part in stderr.split(':') {
        let candidate = part.trim();
        if candidate.starts_with("spec.") || candidate.starts_with("metadata.") {
            return candidate.to_string();
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn immutable_field_is_extracted_from_server_errors() {
        let stderr = "The Deployment \"web\" is invalid: spec.selector: Invalid value: \
                      v1.LabelSelector{...}: field is immutable";
        assert_eq!(extract_immutable_field(stderr), "spec.selector");
        assert_eq!(extract_immutable_field("something else entirely"), "unknown");
    }

    #[test]
    fn local_chart_fingerprint_tracks_content_and_version() {
        let td = tempdir().expect("tempdir");
        let chart = td.path().join("web");
        fs::create_dir_all(chart.join("templates")).expect("mkdir");
        fs::write(
            chart.join("Chart.yaml"),
            "apiVersion: v2\nname: web\nversion: 1.2.3\n",
        )
        .expect("write");
        fs::write(chart.join("templates/deploy.yaml"), "kind: Deployment\n").expect("write");

        let helm = HelmCli;
        let first = helm
            .chart_fingerprint(chart.to_str().expect("utf8"), None)
            .expect("fingerprint");
        assert_eq!(first.resolved_version.as_deref(), Some("1.2.3"));
        assert!(first.digest.starts_with("sha256:"));

        // Any file change moves the digest.
        fs::write(chart.join("templates/deploy.yaml"), "kind: StatefulSet\n").expect("write");
        let second = helm
            .chart_fingerprint(chart.to_str().expect("utf8"), None)
            .expect("fingerprint");
        assert_ne!(first.digest, second.digest);
    }

    #[test]
    fn remote_chart_fingerprint_is_ref_and_version_scoped() {
        let helm = HelmCli;
        let a = helm
            .chart_fingerprint("repo/web", Some("1.0.0"))
            .expect("fingerprint");
        let b = helm
            .chart_fingerprint("repo/web", Some("1.0.1"))
            .expect("fingerprint");
        assert_ne!(a.digest, b.digest);
        assert_eq!(a.resolved_version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn kind_ref_appends_group_for_non_core_kinds() {
        let core = ManifestTarget {
            group: String::new(),
            version: "v1".to_string(),
            kind: "Service".to_string(),
            namespace: None,
            name: "svc".to_string(),
        };
        assert_eq!(KubectlCli::kind_ref(&core), "Service");

        let grouped = ManifestTarget {
            group: "apps".to_string(),
            version: "v1".to_string(),
            kind: "Deployment".to_string(),
            namespace: None,
            name: "web".to_string(),
        };
        assert_eq!(KubectlCli::kind_ref(&grouped), "Deployment.apps");
    }
}
