use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// Annotation that marks an object as a Helm hook.
pub const HOOK_ANNOTATION: &str = "helm.sh/hook";

/// One Kubernetes object parsed out of a rendered manifest stream.
///
/// `raw` is the object as rendered; `normalized` has server-managed and
/// cosmetic fields stripped (see [`crate::normalize`]). Classification
/// compares normalized bodies only.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestObject {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub raw: Value,
    pub normalized: Value,
    pub is_hook: bool,
    /// Value of the `helm.sh/hook` annotation, e.g. `pre-install`.
    pub hook: Option<String>,
}

impl ManifestObject {
    /// Primary identity: `apiVersion/kind/namespace/name`, apiVersion
    /// lowercased. Cluster-scoped objects use an empty namespace segment.
    pub fn primary_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.api_version.to_lowercase(),
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }

    /// ApiVersion-agnostic identity: `group/kind/namespace/name`.
    ///
    /// Two objects that share an alt key but differ in primary key are the
    /// same resource migrating across apiVersions.
    pub fn alt_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            api_group(&self.api_version),
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }

    /// Canonical JSON of the normalized body. `serde_json` maps are keyed
    /// by `BTreeMap`, so equal trees serialize byte-equal.
    pub fn canonical_json(&self) -> String {
        self.normalized.to_string()
    }
}

/// API group of an `apiVersion` string; the core group is `""`.
pub fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

/// `(group, version)` split of an `apiVersion` string.
pub fn api_group_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Parse a multi-document YAML stream into manifest objects.
///
/// Documents that are not mappings, or that lack `kind` or
/// `metadata.name`, are dropped: Helm emits empty documents and comment
/// stubs for disabled subcharts and those carry no identity to diff.
pub fn parse_manifest(source: &str, opts: &crate::NormalizeOptions) -> Result<Vec<ManifestObject>> {
    let mut objects = Vec::new();

    for document in serde_yaml::Deserializer::from_str(source) {
        let value = serde_yaml::Value::deserialize(document)
            .context("failed to parse manifest YAML document")?;
        if value.is_null() {
            continue;
        }
        let json = yaml_to_json(value).context("manifest document is not representable as JSON")?;
        if let Some(object) = object_from_value(json, opts) {
            objects.push(object);
        }
    }

    Ok(objects)
}

fn object_from_value(value: Value, opts: &crate::NormalizeOptions) -> Option<ManifestObject> {
    let map = value.as_object()?;
    let api_version = map.get("apiVersion")?.as_str()?.to_string();
    let kind = map.get("kind")?.as_str()?.to_string();
    let metadata = map.get("metadata")?.as_object()?;
    let name = metadata.get("name")?.as_str()?.to_string();
    let namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .map(str::to_string);

    let hook = metadata
        .get("annotations")
        .and_then(Value::as_object)
        .and_then(|annotations| annotations.get(HOOK_ANNOTATION))
        .and_then(Value::as_str)
        .map(str::to_string);

    let normalized = crate::normalize(&value, &kind, opts);

    Some(ManifestObject {
        api_version,
        kind,
        namespace,
        name,
        is_hook: hook.is_some(),
        hook,
        raw: value,
        normalized,
    })
}

/// Convert a YAML value to JSON. Non-string mapping keys are stringified;
/// YAML-specific tags are resolved by serde_yaml before we see them.
fn yaml_to_json(value: serde_yaml::Value) -> Option<Value> {
    match value {
        serde_yaml::Value::Null => Some(Value::Null),
        serde_yaml::Value::Bool(b) => Some(Value::Bool(b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Value::from(i))
            } else if let Some(u) = n.as_u64() {
                Some(Value::from(u))
            } else {
                n.as_f64().and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            }
        }
        serde_yaml::Value::String(s) => Some(Value::String(s)),
        serde_yaml::Value::Sequence(seq) => {
            let items: Option<Vec<Value>> = seq.into_iter().map(yaml_to_json).collect();
            items.map(Value::Array)
        }
        serde_yaml::Value::Mapping(mapping) => {
            let mut out = serde_json::Map::new();
            for (key, val) in mapping {
                let key = match key {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                out.insert(key, yaml_to_json(val)?);
            }
            Some(Value::Object(out))
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NormalizeOptions;

    #[test]
    fn parses_multiple_documents() {
        let source = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: one
  namespace: demo
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: two
  namespace: demo
"#;
        let objects = parse_manifest(source, &NormalizeOptions::default()).expect("parse");
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind, "ConfigMap");
        assert_eq!(objects[1].kind, "Deployment");
    }

    #[test]
    fn drops_documents_without_kind_or_name() {
        let source = r#"
apiVersion: v1
metadata:
  name: no-kind
---
apiVersion: v1
kind: ConfigMap
metadata:
  namespace: demo
---
# comment-only document
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: kept
"#;
        let objects = parse_manifest(source, &NormalizeOptions::default()).expect("parse");
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name, "kept");
    }

    #[test]
    fn detects_hook_annotation() {
        let source = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  namespace: demo
  annotations:
    helm.sh/hook: pre-install,pre-upgrade
"#;
        let objects = parse_manifest(source, &NormalizeOptions::default()).expect("parse");
        assert!(objects[0].is_hook);
        assert_eq!(objects[0].hook.as_deref(), Some("pre-install,pre-upgrade"));
    }

    #[test]
    fn primary_key_lowercases_api_version_and_uses_empty_namespace() {
        let source = r#"
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: reader
"#;
        let objects = parse_manifest(source, &NormalizeOptions::default()).expect("parse");
        assert_eq!(
            objects[0].primary_key(),
            "rbac.authorization.k8s.io/v1/ClusterRole//reader"
        );
    }

    #[test]
    fn alt_key_is_api_version_agnostic() {
        let v1 = r#"
apiVersion: autoscaling/v1
kind: HorizontalPodAutoscaler
metadata:
  name: app
  namespace: ns
"#;
        let v2 = r#"
apiVersion: autoscaling/v2
kind: HorizontalPodAutoscaler
metadata:
  name: app
  namespace: ns
"#;
        let opts = NormalizeOptions::default();
        let a = parse_manifest(v1, &opts).expect("parse");
        let b = parse_manifest(v2, &opts).expect("parse");
        assert_eq!(a[0].alt_key(), b[0].alt_key());
        assert_ne!(a[0].primary_key(), b[0].primary_key());
    }

    #[test]
    fn api_group_of_core_kinds_is_empty() {
        assert_eq!(api_group("v1"), "");
        assert_eq!(api_group("apps/v1"), "apps");
        assert_eq!(api_group_version("batch/v1"), ("batch", "v1"));
        assert_eq!(api_group_version("v1"), ("", "v1"));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Arbitrary input never panics the parser; it either yields
            // objects or a clean error.
            #[test]
            fn parse_manifest_never_panics(source in ".{0,400}") {
                let _ = parse_manifest(&source, &NormalizeOptions::default());
            }

            #[test]
            fn primary_key_is_prefix_stable(
                name in "[a-z][a-z0-9-]{0,20}",
                namespace in "[a-z][a-z0-9-]{0,20}",
            ) {
                let source = format!(
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: {namespace}\n"
                );
                let objects = parse_manifest(&source, &NormalizeOptions::default()).expect("parse");
                prop_assert_eq!(objects.len(), 1);
                prop_assert_eq!(
                    objects[0].primary_key(),
                    format!("v1/ConfigMap/{namespace}/{name}")
                );
            }
        }
    }

    #[test]
    fn canonical_json_is_stable_across_key_order() {
        let a = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: cm
data:
  b: "2"
  a: "1"
"#;
        let b = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: cm
data:
  a: "1"
  b: "2"
"#;
        let opts = NormalizeOptions::default();
        let first = parse_manifest(a, &opts).expect("parse");
        let second = parse_manifest(b, &opts).expect("parse");
        assert_eq!(first[0].canonical_json(), second[0].canonical_json());
    }
}
