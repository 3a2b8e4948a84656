use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::object::{ManifestObject, api_group_version, parse_manifest};
use crate::{NormalizeOptions, immutable_change};

/// How the server will realize one object of the proposed manifest.
///
/// The derived `Ord` (declaration order) is the display order: adds first,
/// destroys last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Change,
    Replace,
    Destroy,
}

/// One classified object change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanChange {
    pub action: ChangeAction,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub is_hook: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
}

impl PlanChange {
    fn from_object(action: ChangeAction, object: &ManifestObject) -> Self {
        let (group, version) = api_group_version(&object.api_version);
        Self {
            action,
            group: group.to_string(),
            version: version.to_string(),
            kind: object.kind.clone(),
            namespace: object.namespace.clone().unwrap_or_default(),
            name: object.name.clone(),
            is_hook: object.is_hook,
            hook: object.hook.clone(),
        }
    }

    fn sort_key(&self) -> (ChangeAction, &str, &str, &str, &str) {
        (
            self.action,
            self.group.as_str(),
            self.kind.as_str(),
            self.namespace.as_str(),
            self.name.as_str(),
        )
    }
}

/// Changes to Helm hook objects, tallied apart from workload changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookChanges {
    pub add: usize,
    pub change: usize,
    pub replace: usize,
    pub destroy: usize,
    pub changes: Vec<PlanChange>,
}

/// Summary of a previous-vs-proposed manifest comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub add: usize,
    pub change: usize,
    pub replace: usize,
    pub destroy: usize,
    /// Workload changes, sorted by `(action, group, kind, namespace, name)`.
    pub changes: Vec<PlanChange>,
    pub hooks: HookChanges,
}

impl PlanSummary {
    /// True when neither workloads nor hooks change.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.hooks.changes.is_empty()
    }

    pub fn workload_total(&self) -> usize {
        self.add + self.change + self.replace + self.destroy
    }
}

/// Server-side confirmation for immutable-field detection.
///
/// The local table in [`crate::immutable_change`] only knows common kinds;
/// a dry-run apply against the live server catches immutable fields on
/// CRDs and aggregated APIs. Implementations return the offending field
/// when the server rejects the proposed object as immutable.
pub trait ServerDryRun {
    fn immutable_rejection(&self, proposed: &ManifestObject) -> Option<String>;
}

/// Classify two rendered manifest streams. See [`summarize_with_probe`].
pub fn summarize(
    previous: &str,
    proposed: &str,
    opts: &NormalizeOptions,
) -> Result<PlanSummary> {
    summarize_with_probe(previous, proposed, opts, None)
}

/// Classify two rendered manifest streams, optionally confirming
/// `change` classifications against a server dry-run probe.
pub fn summarize_with_probe(
    previous: &str,
    proposed: &str,
    opts: &NormalizeOptions,
    probe: Option<&dyn ServerDryRun>,
) -> Result<PlanSummary> {
    let previous = parse_manifest(previous, opts)?;
    let proposed = parse_manifest(proposed, opts)?;
    Ok(summarize_objects(&previous, &proposed, probe))
}

/// Classify already-parsed object sets.
pub fn summarize_objects(
    previous: &[ManifestObject],
    proposed: &[ManifestObject],
    probe: Option<&dyn ServerDryRun>,
) -> PlanSummary {
    let previous_by_key: BTreeMap<String, &ManifestObject> =
        previous.iter().map(|o| (o.primary_key(), o)).collect();
    let proposed_by_key: BTreeMap<String, &ManifestObject> =
        proposed.iter().map(|o| (o.primary_key(), o)).collect();

    let mut adds: Vec<&ManifestObject> = Vec::new();
    let mut destroys: Vec<&ManifestObject> = Vec::new();
    let mut entries: Vec<(ChangeAction, &ManifestObject)> = Vec::new();

    for (key, next) in &proposed_by_key {
        match previous_by_key.get(key) {
            None => adds.push(next),
            Some(prev) => {
                if prev.canonical_json() == next.canonical_json() {
                    continue;
                }
                let replace_field = immutable_change(&next.kind, &prev.normalized, &next.normalized)
                    .or_else(|| {
                        if next.is_hook {
                            None
                        } else {
                            probe.and_then(|p| p.immutable_rejection(next))
                        }
                    });
                let action = if replace_field.is_some() {
                    ChangeAction::Replace
                } else {
                    ChangeAction::Change
                };
                entries.push((action, next));
            }
        }
    }

    for (key, prev) in &previous_by_key {
        if !proposed_by_key.contains_key(key) {
            destroys.push(prev);
        }
    }

    // An add and a destroy that share an apiVersion-agnostic identity are
    // one object migrating across apiVersions: collapse to a replace.
    let mut destroyed_by_alt: BTreeMap<String, Vec<&ManifestObject>> = BTreeMap::new();
    for prev in destroys {
        destroyed_by_alt.entry(prev.alt_key()).or_default().push(prev);
    }

    for next in adds {
        match destroyed_by_alt.get_mut(&next.alt_key()) {
            Some(matched) if !matched.is_empty() => {
                matched.pop();
                entries.push((ChangeAction::Replace, next));
            }
            _ => entries.push((ChangeAction::Add, next)),
        }
    }
    for remaining in destroyed_by_alt.values() {
        for prev in remaining {
            entries.push((ChangeAction::Destroy, prev));
        }
    }

    let mut summary = PlanSummary::default();
    for (action, object) in entries {
        let change = PlanChange::from_object(action, object);
        if change.is_hook {
            match action {
                ChangeAction::Add => summary.hooks.add += 1,
                ChangeAction::Change => summary.hooks.change += 1,
                ChangeAction::Replace => summary.hooks.replace += 1,
                ChangeAction::Destroy => summary.hooks.destroy += 1,
            }
            summary.hooks.changes.push(change);
        } else {
            match action {
                ChangeAction::Add => summary.add += 1,
                ChangeAction::Change => summary.change += 1,
                ChangeAction::Replace => summary.replace += 1,
                ChangeAction::Destroy => summary.destroy += 1,
            }
            summary.changes.push(change);
        }
    }

    summary.changes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    summary
        .hooks
        .changes
        .sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    summary
}

/// Kinds whose changes carry security or cluster-wide blast radius and are
/// surfaced separately in pre-apply review.
pub fn is_risky_kind(kind: &str) -> bool {
    matches!(
        kind,
        "CustomResourceDefinition"
            | "MutatingWebhookConfiguration"
            | "ValidatingWebhookConfiguration"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "PodDisruptionBudget"
            | "NetworkPolicy"
    )
}

/// Per-kind counts of workload changes touching risky kinds.
pub fn risky_counts(summary: &PlanSummary) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for change in &summary.changes {
        if is_risky_kind(&change.kind) {
            *counts.entry(change.kind.clone()).or_insert(0) += 1;
        }
    }
    counts
}
