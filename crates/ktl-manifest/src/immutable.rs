use serde_json::Value;

/// Fields the API server refuses to mutate in place, per kind.
///
/// A change to one of these upgrades the classification from `change` to
/// `replace`: the object must be deleted and re-created.
const IMMUTABLE_FIELDS: &[(&str, &[&str])] = &[
    ("Service", &["spec.clusterIP"]),
    ("Deployment", &["spec.selector"]),
    ("StatefulSet", &["spec.selector"]),
    ("DaemonSet", &["spec.selector"]),
    ("ReplicaSet", &["spec.selector"]),
    (
        "PersistentVolumeClaim",
        &["spec.storageClassName", "spec.volumeName"],
    ),
    ("Ingress", &["spec.ingressClassName"]),
    ("CustomResourceDefinition", &["spec.names", "spec.group"]),
];

/// Return the first immutable field that changed between two normalized
/// bodies of the same object, or `None` when the change is mutable.
///
/// `spec.clusterIP` is special-cased: the empty string means "let the
/// server allocate", so going from empty/absent to a concrete IP is not a
/// replace — only a concrete IP changing to a different concrete IP is.
pub fn immutable_change(kind: &str, previous: &Value, proposed: &Value) -> Option<String> {
    let fields = IMMUTABLE_FIELDS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, fields)| *fields)?;

    for field in fields {
        let before = lookup(previous, field);
        let after = lookup(proposed, field);

        let changed = match (kind, *field) {
            ("Service", "spec.clusterIP") => match (before.and_then(Value::as_str), after.and_then(Value::as_str)) {
                (Some(before_ip), Some(after_ip)) => {
                    !before_ip.is_empty() && !after_ip.is_empty() && before_ip != after_ip
                }
                _ => false,
            },
            _ => match (before, after) {
                (Some(before), Some(after)) => before != after,
                _ => false,
            },
        };

        if changed {
            return Some((*field).to_string());
        }
    }

    None
}

fn lookup<'a>(value: &'a Value, dotted_path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in dotted_path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cluster_ip_change_between_concrete_ips_is_immutable() {
        let before = json!({"spec": {"clusterIP": "10.0.0.1"}});
        let after = json!({"spec": {"clusterIP": "10.0.0.2"}});
        assert_eq!(
            immutable_change("Service", &before, &after),
            Some("spec.clusterIP".to_string())
        );
    }

    #[test]
    fn cluster_ip_allocation_from_empty_is_mutable() {
        let before = json!({"spec": {"clusterIP": ""}});
        let after = json!({"spec": {"clusterIP": "10.0.0.2"}});
        assert_eq!(immutable_change("Service", &before, &after), None);

        let absent = json!({"spec": {}});
        assert_eq!(immutable_change("Service", &absent, &after), None);
    }

    #[test]
    fn selector_change_replaces_workloads() {
        let before = json!({"spec": {"selector": {"matchLabels": {"app": "a"}}}});
        let after = json!({"spec": {"selector": {"matchLabels": {"app": "b"}}}});

        for kind in ["Deployment", "StatefulSet", "DaemonSet", "ReplicaSet"] {
            assert_eq!(
                immutable_change(kind, &before, &after),
                Some("spec.selector".to_string()),
                "kind {kind}"
            );
        }
    }

    #[test]
    fn pvc_storage_class_and_volume_name_are_immutable() {
        let before = json!({"spec": {"storageClassName": "standard", "volumeName": "pv-1"}});
        let class_changed = json!({"spec": {"storageClassName": "fast", "volumeName": "pv-1"}});
        let volume_changed = json!({"spec": {"storageClassName": "standard", "volumeName": "pv-2"}});

        assert_eq!(
            immutable_change("PersistentVolumeClaim", &before, &class_changed),
            Some("spec.storageClassName".to_string())
        );
        assert_eq!(
            immutable_change("PersistentVolumeClaim", &before, &volume_changed),
            Some("spec.volumeName".to_string())
        );
    }

    #[test]
    fn ingress_class_name_is_immutable() {
        let before = json!({"spec": {"ingressClassName": "nginx"}});
        let after = json!({"spec": {"ingressClassName": "traefik"}});
        assert_eq!(
            immutable_change("Ingress", &before, &after),
            Some("spec.ingressClassName".to_string())
        );
    }

    #[test]
    fn crd_names_and_group_are_immutable() {
        let before = json!({"spec": {"group": "a.example.com", "names": {"plural": "widgets"}}});
        let group_changed = json!({"spec": {"group": "b.example.com", "names": {"plural": "widgets"}}});
        assert_eq!(
            immutable_change("CustomResourceDefinition", &before, &group_changed),
            Some("spec.group".to_string())
        );
    }

    #[test]
    fn unknown_kind_has_no_immutable_fields() {
        let before = json!({"spec": {"anything": 1}});
        let after = json!({"spec": {"anything": 2}});
        assert_eq!(immutable_change("ConfigMap", &before, &after), None);
    }

    #[test]
    fn equal_fields_are_not_flagged() {
        let value = json!({"spec": {"selector": {"matchLabels": {"app": "a"}}}});
        assert_eq!(immutable_change("Deployment", &value, &value), None);
    }
}
