use serde_json::Value;

/// Which annotations to strip before diffing.
///
/// Chart tooling injects annotations that change on every render without
/// changing behavior; comparing them would classify every upgrade as a
/// change.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Annotation key prefixes removed everywhere, e.g. `checksum/`.
    pub strip_annotation_prefixes: Vec<String>,
    /// Exact annotation keys removed everywhere, e.g. `helm.sh/chart`.
    pub strip_annotation_keys: Vec<String>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            strip_annotation_prefixes: vec!["checksum/".to_string()],
            strip_annotation_keys: vec!["helm.sh/chart".to_string()],
        }
    }
}

const STRIPPED_METADATA_FIELDS: &[&str] = &[
    "creationTimestamp",
    "generation",
    "managedFields",
    "resourceVersion",
    "uid",
    "selfLink",
    "finalizers",
];

/// Strip server-managed and cosmetic fields from an object body.
///
/// Rules:
/// - drop `status` and the server-managed `metadata` bookkeeping fields
/// - filter configured annotation prefixes/keys, recursing so pod-template
///   annotations are filtered too
/// - for `Service`, drop an empty `spec.clusterIP` (the empty string is an
///   allocation sentinel, not a value)
/// - sort any list whose members are all named objects by `name`, so
///   render-order churn does not read as a change
pub fn normalize(value: &Value, kind: &str, opts: &NormalizeOptions) -> Value {
    let mut out = value.clone();

    if let Some(map) = out.as_object_mut() {
        map.remove("status");
    }

    strip_metadata(&mut out, opts, true);

    if kind == "Service" {
        drop_empty_cluster_ip(&mut out);
    }

    sort_named_lists(&mut out);
    out
}

fn strip_metadata(value: &mut Value, opts: &NormalizeOptions, top_level: bool) {
    match value {
        Value::Object(map) => {
            if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
                if top_level {
                    for field in STRIPPED_METADATA_FIELDS {
                        metadata.remove(*field);
                    }
                }
                if let Some(Value::Object(annotations)) = metadata.get_mut("annotations") {
                    annotations.retain(|key, _| !stripped_annotation(key, opts));
                }
                if metadata
                    .get("annotations")
                    .and_then(Value::as_object)
                    .is_some_and(serde_json::Map::is_empty)
                {
                    metadata.remove("annotations");
                }
            }
            for (key, child) in map.iter_mut() {
                if key != "metadata" {
                    strip_metadata(child, opts, false);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_metadata(item, opts, false);
            }
        }
        _ => {}
    }
}

fn stripped_annotation(key: &str, opts: &NormalizeOptions) -> bool {
    opts.strip_annotation_keys.iter().any(|k| k == key)
        || opts
            .strip_annotation_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
}

fn drop_empty_cluster_ip(value: &mut Value) {
    if let Some(spec) = value.get_mut("spec").and_then(Value::as_object_mut) {
        if spec.get("clusterIP").and_then(Value::as_str) == Some("") {
            spec.remove("clusterIP");
        }
    }
}

fn sort_named_lists(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                sort_named_lists(child);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                sort_named_lists(item);
            }
            let all_named = !items.is_empty()
                && items.iter().all(|item| {
                    item.as_object()
                        .and_then(|map| map.get("name"))
                        .and_then(Value::as_str)
                        .is_some()
                });
            if all_named {
                items.sort_by(|a, b| {
                    let a_name = a.get("name").and_then(Value::as_str).unwrap_or("");
                    let b_name = b.get("name").and_then(Value::as_str).unwrap_or("");
                    a_name.cmp(b_name)
                });
            }
        }
        _ => {}
    }
}
