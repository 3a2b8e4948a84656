use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::git::GitIdentity;
use crate::plan::StackPlan;
use crate::runtime::RuntimeContext;
use crate::types::{ApplyOptions, Cluster, DeleteOptions, NodeId, ReleaseNode};

/// Schema tag of the effective-input projection. Bumping it invalidates
/// every stored hash, forcing drift on resume.
pub const INPUT_API_VERSION: &str = "ktl.kubekattle.io/effective-input.v1";

/// Content identity of the chart feeding a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartInput {
    #[serde(rename = "ref")]
    pub chart_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_version: Option<String>,
    pub digest: String,
}

/// Digest of one values file. A missing file digests to `None` so drift
/// detection can name it instead of erroring out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuesInput {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Canonical projection of every input that influences what a node
/// renders and applies.
///
/// The hash of this projection is the single source of truth for
/// "unchanged since the last run"; resume never infers equality from
/// timestamps. Serialization field order is fixed by declaration order and
/// maps are ordered, so equal projections hash equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveInput {
    pub api_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_git_commit: Option<String>,
    pub stack_git_dirty: bool,
    pub ktl_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ktl_git_commit: Option<String>,
    pub node_id: NodeId,
    pub chart: ChartInput,
    pub values: Vec<ValuesInput>,
    pub set_digest: String,
    pub cluster_digest: String,
    pub apply: ApplyOptions,
    pub delete: DeleteOptions,
}

impl EffectiveInput {
    /// `sha256:<hex>` over the canonical JSON projection.
    pub fn hash(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("effective input serializes");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    /// Human-readable reasons why `current` differs from `self`, for the
    /// resume drift report. Empty when the hashes would match.
    pub fn diff_reasons(&self, current: &EffectiveInput) -> Vec<String> {
        let mut reasons = Vec::new();

        if self.stack_git_commit != current.stack_git_commit {
            reasons.push("stack git commit changed".to_string());
        }
        if self.stack_git_dirty != current.stack_git_dirty {
            reasons.push("stack git dirty flag changed".to_string());
        }
        if self.ktl_version != current.ktl_version || self.ktl_git_commit != current.ktl_git_commit
        {
            reasons.push("ktl version changed".to_string());
        }
        if self.chart != current.chart {
            reasons.push(format!("chart {} changed", current.chart.chart_ref));
        }

        let stored: BTreeMap<&str, &Option<String>> = self
            .values
            .iter()
            .map(|v| (v.path.as_str(), &v.digest))
            .collect();
        for value in &current.values {
            match stored.get(value.path.as_str()) {
                None => reasons.push(format!("values file added: {}", value.path)),
                Some(digest) if **digest != value.digest => {
                    reasons.push(format!("values file changed: {}", value.path));
                }
                _ => {}
            }
        }
        for value in &self.values {
            if !current.values.iter().any(|v| v.path == value.path) {
                reasons.push(format!("values file removed: {}", value.path));
            }
        }

        if self.set_digest != current.set_digest {
            reasons.push("set overrides changed".to_string());
        }
        if self.cluster_digest != current.cluster_digest {
            reasons.push("cluster binding changed".to_string());
        }
        if self.apply != current.apply {
            reasons.push("apply options changed".to_string());
        }
        if self.delete != current.delete {
            reasons.push("delete options changed".to_string());
        }

        reasons
    }
}

/// Compute the effective input of one node against the current world.
pub fn effective_input_for_node(
    ctx: &RuntimeContext,
    stack_root: &Path,
    stack_git: Option<&GitIdentity>,
    node: &ReleaseNode,
) -> Result<EffectiveInput> {
    let fingerprint = ctx
        .helm
        .chart_fingerprint(&node.chart, node.chart_version.as_deref())
        .with_context(|| format!("failed to fingerprint chart {}", node.chart))?;

    let values = node
        .values
        .iter()
        .map(|path| {
            let absolute = if path.is_absolute() {
                path.clone()
            } else {
                stack_root.join(path)
            };
            ValuesInput {
                path: path.display().to_string(),
                digest: digest_file(&absolute),
            }
        })
        .collect();

    Ok(EffectiveInput {
        api_version: INPUT_API_VERSION.to_string(),
        stack_git_commit: stack_git.and_then(|g| g.commit.clone()),
        stack_git_dirty: stack_git.map(|g| g.dirty).unwrap_or(false),
        ktl_version: ctx.ktl_version.clone(),
        ktl_git_commit: ctx.ktl_commit.clone(),
        node_id: node.id.clone(),
        chart: ChartInput {
            chart_ref: node.chart.clone(),
            version: node.chart_version.clone(),
            resolved_version: node
                .resolved_chart_version
                .clone()
                .or(fingerprint.resolved_version.clone()),
            digest: fingerprint.digest,
        },
        values,
        set_digest: digest_set(&node.set),
        cluster_digest: digest_cluster(&node.cluster),
        apply: node.apply.clone(),
        delete: node.delete.clone(),
    })
}

/// Compute effective inputs for every node of a plan.
pub fn compute_effective_inputs(
    ctx: &RuntimeContext,
    plan: &StackPlan,
    stack_git: Option<&GitIdentity>,
) -> Result<BTreeMap<NodeId, EffectiveInput>> {
    let mut inputs = BTreeMap::new();
    for node in &plan.nodes {
        let input = effective_input_for_node(ctx, &plan.stack_root, stack_git, node)?;
        inputs.insert(node.id.clone(), input);
    }
    Ok(inputs)
}

/// Seal a freshly compiled plan: resolve chart versions that resolution
/// returned, freeze effective inputs, and stamp the plan hash.
pub fn seal_plan(
    ctx: &RuntimeContext,
    plan: &mut StackPlan,
    stack_git: Option<&GitIdentity>,
) -> Result<()> {
    for node in &mut plan.nodes {
        if node.chart_version.is_none() {
            let fingerprint = ctx
                .helm
                .chart_fingerprint(&node.chart, None)
                .with_context(|| format!("failed to fingerprint chart {}", node.chart))?;
            node.resolved_chart_version = fingerprint.resolved_version;
        }
    }

    plan.effective_inputs = compute_effective_inputs(ctx, plan, stack_git)?;
    plan.plan_hash = plan_hash(plan);
    Ok(())
}

/// SHA-256 over the ordered node ids and their effective-input hashes.
pub fn plan_hash(plan: &StackPlan) -> String {
    let mut hasher = Sha256::new();
    for id in &plan.order {
        hasher.update(id.as_str().as_bytes());
        hasher.update(b"\n");
        if let Some(input) = plan.effective_inputs.get(id) {
            hasher.update(input.hash().as_bytes());
            hasher.update(b"\n");
        }
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn digest_file(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(b"values\0");
    hasher.update(&bytes);
    Some(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn digest_set(set: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"set\0");
    for (key, value) in set {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn digest_cluster(cluster: &Cluster) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"cluster\0");
    hasher.update(cluster.name.as_bytes());
    hasher.update(b"\0");
    hasher.update(cluster.context.as_bytes());
    hasher.update(b"\0");
    hasher.update(cluster.namespace.as_deref().unwrap_or("").as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sample_input() -> EffectiveInput {
        EffectiveInput {
            api_version: INPUT_API_VERSION.to_string(),
            stack_git_commit: Some("abc123".to_string()),
            stack_git_dirty: false,
            ktl_version: "0.4.0".to_string(),
            ktl_git_commit: None,
            node_id: NodeId::from("eu/api"),
            chart: ChartInput {
                chart_ref: "charts/api".to_string(),
                version: Some("1.0.0".to_string()),
                resolved_version: Some("1.0.0".to_string()),
                digest: "sha256:aaaa".to_string(),
            },
            values: vec![ValuesInput {
                path: "values/api.yaml".to_string(),
                digest: Some("sha256:bbbb".to_string()),
            }],
            set_digest: "sha256:cccc".to_string(),
            cluster_digest: "sha256:dddd".to_string(),
            apply: ApplyOptions::default(),
            delete: DeleteOptions::default(),
        }
    }

    #[test]
    fn hash_is_deterministic() {
        let input = sample_input();
        assert_eq!(input.hash(), input.hash());
        assert!(input.hash().starts_with("sha256:"));
        assert_eq!(input.hash().len(), "sha256:".len() + 64);
    }

    #[test]
    fn every_contributing_field_changes_the_hash() {
        let base = sample_input();
        let base_hash = base.hash();

        let mut changed = base.clone();
        changed.stack_git_commit = Some("def456".to_string());
        assert_ne!(changed.hash(), base_hash);

        let mut changed = base.clone();
        changed.stack_git_dirty = true;
        assert_ne!(changed.hash(), base_hash);

        let mut changed = base.clone();
        changed.chart.digest = "sha256:eeee".to_string();
        assert_ne!(changed.hash(), base_hash);

        let mut changed = base.clone();
        changed.values[0].digest = Some("sha256:ffff".to_string());
        assert_ne!(changed.hash(), base_hash);

        let mut changed = base.clone();
        changed.set_digest = "sha256:9999".to_string();
        assert_ne!(changed.hash(), base_hash);

        let mut changed = base.clone();
        changed.cluster_digest = "sha256:8888".to_string();
        assert_ne!(changed.hash(), base_hash);

        let mut changed = base.clone();
        changed.apply.atomic = true;
        assert_ne!(changed.hash(), base_hash);

        let mut changed = base.clone();
        changed.delete.timeout = Duration::from_secs(10);
        assert_ne!(changed.hash(), base_hash);
    }

    #[test]
    fn diff_reasons_name_the_changed_values_file() {
        let stored = sample_input();
        let mut current = stored.clone();
        current.values[0].digest = Some("sha256:ffff".to_string());

        let reasons = stored.diff_reasons(&current);
        assert_eq!(reasons, vec!["values file changed: values/api.yaml"]);
    }

    #[test]
    fn diff_reasons_cover_added_and_removed_values_files() {
        let stored = sample_input();
        let mut current = stored.clone();
        current.values.push(ValuesInput {
            path: "values/extra.yaml".to_string(),
            digest: None,
        });

        let reasons = stored.diff_reasons(&current);
        assert!(reasons.iter().any(|r| r.contains("added")));

        let mut current = stored.clone();
        current.values.clear();
        let reasons = stored.diff_reasons(&current);
        assert!(reasons.iter().any(|r| r.contains("removed")));
    }

    #[test]
    fn equal_inputs_have_no_diff_reasons() {
        let input = sample_input();
        assert!(input.diff_reasons(&input.clone()).is_empty());
    }

    #[test]
    fn set_digest_orders_keys() {
        let a = BTreeMap::from([
            ("x".to_string(), "1".to_string()),
            ("y".to_string(), "2".to_string()),
        ]);
        let b = BTreeMap::from([
            ("y".to_string(), "2".to_string()),
            ("x".to_string(), "1".to_string()),
        ]);
        assert_eq!(digest_set(&a), digest_set(&b));

        let c = BTreeMap::from([("x".to_string(), "other".to_string())]);
        assert_ne!(digest_set(&a), digest_set(&c));
    }

    #[test]
    fn cluster_digest_covers_context_and_namespace() {
        let base = Cluster {
            name: "eu".to_string(),
            context: "eu-ctx".to_string(),
            kubeconfig: PathBuf::from("/etc/kube/eu"),
            namespace: Some("platform".to_string()),
        };
        let mut other = base.clone();
        other.context = "eu-admin".to_string();
        assert_ne!(digest_cluster(&base), digest_cluster(&other));

        let mut other = base.clone();
        other.namespace = None;
        assert_ne!(digest_cluster(&base), digest_cluster(&other));
    }

    #[test]
    fn missing_values_file_digests_to_none() {
        assert_eq!(digest_file(Path::new("/does/not/exist.yaml")), None);
    }

    #[test]
    fn file_digest_tracks_content() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("values.yaml");
        fs::write(&path, "replicas: 1\n").expect("write");
        let first = digest_file(&path).expect("digest");

        fs::write(&path, "replicas: 2\n").expect("write");
        let second = digest_file(&path).expect("digest");
        assert_ne!(first, second);
    }
}
