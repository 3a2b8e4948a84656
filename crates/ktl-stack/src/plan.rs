use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ktl_retry::RetryPolicy;

use crate::inputs::EffectiveInput;
use crate::types::{
    ApplyOptions, Cluster, DEFAULT_PARALLELISM, DeleteOptions, ErrorClass, HookSpec, NodeId,
    ReleaseNode, VerifySpec,
};

/// Current plan artifact schema version.
pub const CURRENT_PLAN_VERSION: &str = "ktl.stack.plan.v1";

/// Raw stack declarations, already parsed by the caller.
///
/// Loading these from YAML is the outer CLI's concern; the compiler only
/// resolves, validates, and orders them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackConfig {
    pub name: String,
    pub root: PathBuf,
    pub clusters: Vec<Cluster>,
    pub releases: Vec<ReleaseConfig>,
    #[serde(default)]
    pub stack_hooks: Vec<HookSpec>,
}

/// One release declaration, before cluster binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseConfig {
    pub name: String,
    /// Target cluster names; empty means every cluster in the stack.
    #[serde(default)]
    pub clusters: Vec<String>,
    pub chart: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub values: Vec<PathBuf>,
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    /// Names of sibling releases this one depends on, within the same
    /// cluster.
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
    #[serde(default)]
    pub apply: ApplyOptions,
    #[serde(default)]
    pub delete: DeleteOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<String>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub verify: VerifySpec,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-profile field overrides, applied last-writer-wins.
    #[serde(default)]
    pub profiles: BTreeMap<String, ReleaseOverlay>,
}

/// Field-level overrides a profile lays over a release declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOverlay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<DeleteOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifySpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Compile-time failures. Both are fatal for the run.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("dependency cycle among: {members}")]
    Cycle { members: String },
    #[error("{0}")]
    Config(String),
}

impl PlanError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PlanError::Cycle { .. } => ErrorClass::Cycle,
            PlanError::Config(_) => ErrorClass::Config,
        }
    }
}

/// The compiled, immutable execution plan.
///
/// `order` is a topological sort of the same-cluster dependency relation;
/// `effective_inputs` are frozen in by [`crate::inputs::seal_plan`] before
/// execution. Unknown top-level fields from older/newer writers are
/// preserved across load/store round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackPlan {
    pub plan_version: String,
    /// SHA-256 over the ordered node ids and their effective-input
    /// hashes; empty until the plan is sealed.
    #[serde(default)]
    pub plan_hash: String,
    pub created_at: DateTime<Utc>,
    pub stack_name: String,
    pub stack_root: PathBuf,
    pub nodes: Vec<ReleaseNode>,
    pub order: Vec<NodeId>,
    #[serde(default)]
    pub stack_hooks: Vec<HookSpec>,
    #[serde(default)]
    pub effective_inputs: BTreeMap<NodeId, EffectiveInput>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl StackPlan {
    pub fn node(&self, id: &NodeId) -> Option<&ReleaseNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Index of nodes by id.
    pub fn by_id(&self) -> BTreeMap<&NodeId, &ReleaseNode> {
        self.nodes.iter().map(|n| (&n.id, n)).collect()
    }

    /// Reverse dependency edges: who waits on each node.
    pub fn dependents_of(&self) -> BTreeMap<NodeId, Vec<NodeId>> {
        let mut dependents: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for node in &self.nodes {
            for need in &node.needs {
                dependents
                    .entry(need.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }
        dependents
    }

    /// Subset plan with only `keep` nodes and the edges among them.
    ///
    /// Dependencies on nodes outside the subset are dropped; the caller is
    /// asserting those already hold (e.g. they succeeded in a prior run).
    pub fn restrict_to_nodes(&self, keep: &BTreeSet<NodeId>) -> StackPlan {
        let nodes: Vec<ReleaseNode> = self
            .nodes
            .iter()
            .filter(|n| keep.contains(&n.id))
            .map(|n| {
                let mut node = n.clone();
                node.needs.retain(|need| keep.contains(need));
                node
            })
            .collect();
        let order: Vec<NodeId> = self
            .order
            .iter()
            .filter(|id| keep.contains(id))
            .cloned()
            .collect();
        let effective_inputs = self
            .effective_inputs
            .iter()
            .filter(|(id, _)| keep.contains(id))
            .map(|(id, input)| (id.clone(), input.clone()))
            .collect();

        StackPlan {
            plan_version: self.plan_version.clone(),
            plan_hash: self.plan_hash.clone(),
            created_at: self.created_at,
            stack_name: self.stack_name.clone(),
            stack_root: self.stack_root.clone(),
            nodes,
            order,
            stack_hooks: self.stack_hooks.clone(),
            effective_inputs,
            extra: self.extra.clone(),
        }
    }
}

/// Compile stack declarations into an ordered plan.
///
/// Profile overlays are resolved first, then bindings expand to one node
/// per (cluster, release), dependencies resolve to node ids, and a
/// Kahn-style sort assigns execution groups. Cycles and dangling
/// references fail compilation.
pub fn compile(
    config: &StackConfig,
    profile: Option<&str>,
    now: DateTime<Utc>,
) -> Result<StackPlan, PlanError> {
    let mut clusters: BTreeMap<&str, &Cluster> = BTreeMap::new();
    for cluster in &config.clusters {
        if clusters.insert(cluster.name.as_str(), cluster).is_some() {
            return Err(PlanError::Config(format!(
                "duplicate cluster name: {}",
                cluster.name
            )));
        }
    }
    if clusters.is_empty() {
        return Err(PlanError::Config("stack declares no clusters".to_string()));
    }

    let mut release_names: BTreeSet<&str> = BTreeSet::new();
    for release in &config.releases {
        if !release_names.insert(release.name.as_str()) {
            return Err(PlanError::Config(format!(
                "duplicate release name: {}",
                release.name
            )));
        }
    }

    // Bind every release to its target clusters.
    let mut nodes: Vec<ReleaseNode> = Vec::new();
    for release in &config.releases {
        let resolved = resolve_profile(release, profile);

        let targets: Vec<&Cluster> = if resolved.clusters.is_empty() {
            clusters.values().copied().collect()
        } else {
            let mut targets = Vec::new();
            for name in &resolved.clusters {
                let cluster = clusters.get(name.as_str()).ok_or_else(|| {
                    PlanError::Config(format!(
                        "release {} targets unknown cluster: {}",
                        release.name, name
                    ))
                })?;
                targets.push(*cluster);
            }
            targets
        };

        for cluster in targets {
            let namespace = resolved
                .namespace
                .clone()
                .or_else(|| cluster.namespace.clone())
                .unwrap_or_else(|| "default".to_string());

            nodes.push(ReleaseNode {
                id: NodeId::new(&cluster.name, &resolved.name),
                release: resolved.name.clone(),
                cluster: cluster.clone(),
                namespace,
                chart: resolved.chart.clone(),
                chart_version: resolved.chart_version.clone(),
                resolved_chart_version: None,
                values: resolved.values.clone(),
                set: resolved.set.clone(),
                needs: Vec::new(),
                hooks: resolved.hooks.clone(),
                apply: resolved.apply.clone(),
                delete: resolved.delete.clone(),
                execution_group: 0,
                parallelism: resolved
                    .parallelism
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PARALLELISM.to_string()),
                critical: resolved.critical,
                verify: resolved.verify.clone(),
                retry: resolved.retry.clone(),
            });
        }
    }

    // Resolve needs to node ids within the same cluster. Dependencies can
    // never cross cluster boundaries by construction.
    let node_ids: BTreeSet<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
    let needs_by_release: BTreeMap<&str, &Vec<String>> = config
        .releases
        .iter()
        .map(|r| (r.name.as_str(), &r.needs))
        .collect();
    for node in &mut nodes {
        let needs = needs_by_release
            .get(node.release.as_str())
            .copied()
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut resolved_needs = Vec::new();
        for need in needs {
            let need_id = NodeId::new(&node.cluster.name, need);
            if !node_ids.contains(&need_id) {
                return Err(PlanError::Config(format!(
                    "release {} on cluster {} needs unknown release: {need}",
                    node.release, node.cluster.name
                )));
            }
            resolved_needs.push(need_id);
        }
        node.needs = resolved_needs;
    }

    let (order, groups) = topo_sort(&nodes)?;
    for node in &mut nodes {
        node.execution_group = *groups.get(&node.id).unwrap_or(&0);
    }

    Ok(StackPlan {
        plan_version: CURRENT_PLAN_VERSION.to_string(),
        plan_hash: String::new(),
        created_at: now,
        stack_name: config.name.clone(),
        stack_root: config.root.clone(),
        nodes,
        order,
        stack_hooks: config.stack_hooks.clone(),
        effective_inputs: BTreeMap::new(),
        extra: BTreeMap::new(),
    })
}

/// A release declaration with one profile's overrides folded in.
struct ResolvedRelease {
    name: String,
    clusters: Vec<String>,
    chart: String,
    chart_version: Option<String>,
    namespace: Option<String>,
    values: Vec<PathBuf>,
    set: BTreeMap<String, String>,
    hooks: Vec<HookSpec>,
    apply: ApplyOptions,
    delete: DeleteOptions,
    parallelism: Option<String>,
    critical: bool,
    verify: VerifySpec,
    retry: RetryPolicy,
}

fn resolve_profile(release: &ReleaseConfig, profile: Option<&str>) -> ResolvedRelease {
    let overlay = profile
        .and_then(|p| release.profiles.get(p))
        .cloned()
        .unwrap_or_default();

    ResolvedRelease {
        name: release.name.clone(),
        clusters: release.clusters.clone(),
        chart: overlay.chart.unwrap_or_else(|| release.chart.clone()),
        chart_version: overlay.chart_version.or_else(|| release.chart_version.clone()),
        namespace: overlay.namespace.or_else(|| release.namespace.clone()),
        values: overlay.values.unwrap_or_else(|| release.values.clone()),
        set: overlay.set.unwrap_or_else(|| release.set.clone()),
        hooks: release.hooks.clone(),
        apply: overlay.apply.unwrap_or_else(|| release.apply.clone()),
        delete: overlay.delete.unwrap_or_else(|| release.delete.clone()),
        parallelism: overlay.parallelism.or_else(|| release.parallelism.clone()),
        critical: overlay.critical.unwrap_or(release.critical),
        verify: overlay.verify.unwrap_or_else(|| release.verify.clone()),
        retry: overlay.retry.unwrap_or_else(|| release.retry.clone()),
    }
}

/// Kahn-style sort; returns the order and each node's layer (the lowest
/// depth at which all its dependencies are satisfied).
fn topo_sort(nodes: &[ReleaseNode]) -> Result<(Vec<NodeId>, BTreeMap<NodeId, u32>), PlanError> {
    let mut indegree: BTreeMap<&NodeId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
    for node in nodes {
        indegree.entry(&node.id).or_insert(0);
        for need in &node.needs {
            *indegree.entry(&node.id).or_insert(0) += 1;
            dependents.entry(need).or_default().push(&node.id);
        }
    }

    let mut layer: Vec<&NodeId> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    layer.sort();

    let mut order: Vec<NodeId> = Vec::with_capacity(nodes.len());
    let mut groups: BTreeMap<NodeId, u32> = BTreeMap::new();
    let mut depth: u32 = 0;

    while !layer.is_empty() {
        let mut next: Vec<&NodeId> = Vec::new();
        for id in &layer {
            order.push((*id).clone());
            groups.insert((*id).clone(), depth);
            if let Some(waiting) = dependents.get(*id) {
                for dependent in waiting {
                    let remaining = indegree
                        .get_mut(dependent)
                        .expect("dependent is a known node");
                    *remaining -= 1;
                    if *remaining == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        next.sort();
        next.dedup();
        layer = next;
        depth += 1;
    }

    if order.len() != nodes.len() {
        let stuck: Vec<String> = nodes
            .iter()
            .filter(|n| !groups.contains_key(&n.id))
            .map(|n| n.id.to_string())
            .collect();
        return Err(PlanError::Cycle {
            members: stuck.join(", "),
        });
    }

    Ok((order, groups))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str) -> Cluster {
        Cluster {
            name: name.to_string(),
            context: format!("{name}-ctx"),
            kubeconfig: PathBuf::from(format!("/etc/kube/{name}")),
            namespace: Some("platform".to_string()),
        }
    }

    fn release(name: &str, needs: &[&str]) -> ReleaseConfig {
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
            apply: ApplyOptions::default(),
            delete: DeleteOptions::default(),
            parallelism: None,
            critical: false,
            verify: VerifySpec::default(),
            retry: RetryPolicy::default(),
            profiles: BTreeMap::new(),
        }
    }

    fn config(clusters: Vec<Cluster>, releases: Vec<ReleaseConfig>) -> StackConfig {
        StackConfig {
            name: "demo".to_string(),
            root: PathBuf::from("/stacks/demo"),
            clusters,
            releases,
            stack_hooks: Vec::new(),
        }
    }

    #[test]
    fn binding_expands_releases_across_all_clusters() {
        let cfg = config(
            vec![cluster("eu"), cluster("us")],
            vec![release("api", &[])],
        );
        let plan = compile(&cfg, None, Utc::now()).expect("compile");
        let ids: Vec<String> = plan.nodes.iter().map(|n| n.id.to_string()).collect();
        assert_eq!(ids, vec!["eu/api", "us/api"]);
    }

    #[test]
    fn explicit_cluster_binding_limits_expansion() {
        let mut api = release("api", &[]);
        api.clusters = vec!["us".to_string()];
        let cfg = config(vec![cluster("eu"), cluster("us")], vec![api]);
        let plan = compile(&cfg, None, Utc::now()).expect("compile");
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].id.as_str(), "us/api");
    }

    #[test]
    fn namespace_falls_back_to_cluster_default() {
        let cfg = config(vec![cluster("eu")], vec![release("api", &[])]);
        let plan = compile(&cfg, None, Utc::now()).expect("compile");
        assert_eq!(plan.nodes[0].namespace, "platform");
    }

    #[test]
    fn needs_resolve_within_the_same_cluster() {
        let cfg = config(
            vec![cluster("eu"), cluster("us")],
            vec![release("db", &[]), release("api", &["db"])],
        );
        let plan = compile(&cfg, None, Utc::now()).expect("compile");

        let api_eu = plan.node(&NodeId::from("eu/api")).expect("eu/api");
        assert_eq!(api_eu.needs, vec![NodeId::from("eu/db")]);
        let api_us = plan.node(&NodeId::from("us/api")).expect("us/api");
        assert_eq!(api_us.needs, vec![NodeId::from("us/db")]);
    }

    #[test]
    fn unknown_dependency_is_a_config_error() {
        let cfg = config(vec![cluster("eu")], vec![release("api", &["ghost"])]);
        let err = compile(&cfg, None, Utc::now()).expect_err("must fail");
        assert!(matches!(err, PlanError::Config(_)));
        assert_eq!(err.class(), ErrorClass::Config);
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn unknown_target_cluster_is_a_config_error() {
        let mut api = release("api", &[]);
        api.clusters = vec!["mars".to_string()];
        let cfg = config(vec![cluster("eu")], vec![api]);
        let err = compile(&cfg, None, Utc::now()).expect_err("must fail");
        assert!(err.to_string().contains("mars"));
    }

    #[test]
    fn cycles_are_rejected_naming_their_members() {
        let cfg = config(
            vec![cluster("eu")],
            vec![release("a", &["b"]), release("b", &["a"]), release("c", &[])],
        );
        let err = compile(&cfg, None, Utc::now()).expect_err("must fail");
        assert_eq!(err.class(), ErrorClass::Cycle);
        let msg = err.to_string();
        assert!(msg.contains("eu/a"));
        assert!(msg.contains("eu/b"));
        assert!(!msg.contains("eu/c"));
    }

    #[test]
    fn execution_groups_follow_dependency_depth() {
        let cfg = config(
            vec![cluster("eu")],
            vec![
                release("db", &[]),
                release("cache", &[]),
                release("api", &["db", "cache"]),
                release("web", &["api"]),
            ],
        );
        let plan = compile(&cfg, None, Utc::now()).expect("compile");
        let group = |id: &str| plan.node(&NodeId::from(id)).expect("node").execution_group;
        assert_eq!(group("eu/db"), 0);
        assert_eq!(group("eu/cache"), 0);
        assert_eq!(group("eu/api"), 1);
        assert_eq!(group("eu/web"), 2);
    }

    #[test]
    fn order_is_topological_and_deterministic() {
        let cfg = config(
            vec![cluster("eu")],
            vec![
                release("zeta", &[]),
                release("alpha", &[]),
                release("api", &["zeta", "alpha"]),
            ],
        );
        let plan = compile(&cfg, None, Utc::now()).expect("compile");
        let order: Vec<&str> = plan.order.iter().map(|id| id.as_str()).collect();
        assert_eq!(order, vec!["eu/alpha", "eu/zeta", "eu/api"]);
    }

    #[test]
    fn profile_overlay_wins_per_field() {
        let mut api = release("api", &[]);
        api.set = BTreeMap::from([("replicas".to_string(), "1".to_string())]);
        api.profiles.insert(
            "prod".to_string(),
            ReleaseOverlay {
                chart_version: Some("2.0.0".to_string()),
                set: Some(BTreeMap::from([(
                    "replicas".to_string(),
                    "5".to_string(),
                )])),
                critical: Some(true),
                ..ReleaseOverlay::default()
            },
        );
        let cfg = config(vec![cluster("eu")], vec![api]);

        let base = compile(&cfg, None, Utc::now()).expect("compile");
        assert_eq!(base.nodes[0].chart_version, None);
        assert!(!base.nodes[0].critical);

        let prod = compile(&cfg, Some("prod"), Utc::now()).expect("compile");
        assert_eq!(prod.nodes[0].chart_version.as_deref(), Some("2.0.0"));
        assert_eq!(prod.nodes[0].set.get("replicas").map(String::as_str), Some("5"));
        assert!(prod.nodes[0].critical);
        // Fields the overlay does not touch keep their declared values.
        assert_eq!(prod.nodes[0].chart, "charts/api");
    }

    #[test]
    fn restrict_to_nodes_keeps_internal_edges_only() {
        let cfg = config(
            vec![cluster("eu")],
            vec![
                release("db", &[]),
                release("api", &["db"]),
                release("web", &["api"]),
            ],
        );
        let plan = compile(&cfg, None, Utc::now()).expect("compile");

        let keep: BTreeSet<NodeId> = [NodeId::from("eu/api"), NodeId::from("eu/web")]
            .into_iter()
            .collect();
        let subset = plan.restrict_to_nodes(&keep);

        assert_eq!(subset.nodes.len(), 2);
        let api = subset.node(&NodeId::from("eu/api")).expect("api");
        // The edge to eu/db left the subset with its node.
        assert!(api.needs.is_empty());
        let web = subset.node(&NodeId::from("eu/web")).expect("web");
        assert_eq!(web.needs, vec![NodeId::from("eu/api")]);
        assert_eq!(
            subset.order.iter().map(|i| i.as_str()).collect::<Vec<_>>(),
            vec!["eu/api", "eu/web"]
        );
    }

    #[test]
    fn duplicate_releases_and_clusters_are_rejected() {
        let cfg = config(
            vec![cluster("eu"), cluster("eu")],
            vec![release("api", &[])],
        );
        assert!(compile(&cfg, None, Utc::now()).is_err());

        let cfg = config(
            vec![cluster("eu")],
            vec![release("api", &[]), release("api", &[])],
        );
        assert!(compile(&cfg, None, Utc::now()).is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Random forward-edged DAGs always compile, and the order
            // places every dependency before its dependent.
            #[test]
            fn order_respects_needs(edge_bits in prop::collection::vec(any::<bool>(), 45)) {
                let n = 10usize;
                let mut releases: Vec<ReleaseConfig> = Vec::new();
                let mut bit = 0usize;
                for i in 0..n {
                    let mut needs = Vec::new();
                    for j in 0..i {
                        if edge_bits[bit] {
                            needs.push(format!("r{j}"));
                        }
                        bit += 1;
                    }
                    let needs_refs: Vec<&str> = needs.iter().map(String::as_str).collect();
                    releases.push(release(&format!("r{i}"), &needs_refs));
                }
                let cfg = config(vec![cluster("eu")], releases);
                let plan = compile(&cfg, None, Utc::now()).expect("acyclic plan compiles");

                let position: BTreeMap<&NodeId, usize> = plan
                    .order
                    .iter()
                    .enumerate()
                    .map(|(i, id)| (id, i))
                    .collect();
                for node in &plan.nodes {
                    for need in &node.needs {
                        prop_assert!(position[need] < position[&node.id]);
                        prop_assert!(
                            plan.node(need).expect("need exists").execution_group
                                < node.execution_group
                        );
                    }
                }
            }
        }
    }
}
