//! Node predicates and identity helpers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;

/// Node labels a node must carry to be handled by this controller. `None`
/// selects every node.
pub type NodeSelector = Option<BTreeMap<String, String>>;

/// Whether the controller is responsible for `node`.
pub fn own_node(selector: &NodeSelector, node: Option<&Node>) -> bool {
    let Some(node) = node else {
        return false;
    };
    let Some(selector) = selector else {
        return true;
    };
    let labels = node.metadata.labels.as_ref();
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

fn provider_id(node: &Node) -> Option<&str> {
    node.spec.as_ref().and_then(|s| s.provider_id.as_deref())
}

/// Whether a node update needs a reconcile.
pub fn predict_node_update(selector: &NodeSelector, old: Option<&Node>, new: &Node) -> bool {
    if !own_node(selector, Some(new)) {
        return false;
    }
    if !own_node(selector, old) {
        return true;
    }
    if new.metadata.deletion_timestamp.is_some() {
        return true;
    }
    old.map(provider_id) != Some(provider_id(new))
}

/// Instance id from a `<region>.<instance-id>` provider id.
pub fn provider_instance_id(node: &Node) -> Option<String> {
    let parts: Vec<&str> = provider_id(node)?.split('.').collect();
    match parts.as_slice() {
        [_, instance_id] if !instance_id.is_empty() => Some((*instance_id).to_string()),
        _ => None,
    }
}

pub fn node_internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeAddress;
    use k8s_openapi::api::core::v1::NodeSpec;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use similar_asserts::assert_eq;

    use super::*;

    fn node(labels: &[(&str, &str)], provider_id: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-a".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: provider_id.map(str::to_string),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn selector(pairs: &[(&str, &str)]) -> NodeSelector {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn nil_selector_owns_every_present_node() {
        assert!(own_node(&None, Some(&node(&[], None))));
        assert!(!own_node(&None, None));
    }

    #[test]
    fn selector_requires_every_label() {
        let sel = selector(&[("erdma", "true"), ("pool", "gpu")]);
        assert!(own_node(&sel, Some(&node(&[("erdma", "true"), ("pool", "gpu")], None))));
        assert!(!own_node(&sel, Some(&node(&[("erdma", "true")], None))));
        assert!(!own_node(&sel, Some(&node(&[("erdma", "false"), ("pool", "gpu")], None))));
    }

    #[test]
    fn update_triggers_on_ownership_deletion_or_provider_change() {
        let sel = selector(&[("erdma", "true")]);
        let unlabeled = node(&[], Some("cn.i-1"));
        let labeled = node(&[("erdma", "true")], Some("cn.i-1"));
        let moved = node(&[("erdma", "true")], Some("cn.i-2"));
        let mut deleting = labeled.clone();
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        assert!(predict_node_update(&sel, Some(&unlabeled), &labeled));
        assert!(!predict_node_update(&sel, Some(&labeled), &labeled));
        assert!(predict_node_update(&sel, Some(&labeled), &moved));
        assert!(predict_node_update(&sel, Some(&labeled), &deleting));
        assert!(!predict_node_update(&sel, Some(&labeled), &unlabeled));
        assert!(predict_node_update(&sel, None, &labeled));
    }

    #[test]
    fn provider_id_needs_exactly_two_parts() {
        assert_eq!(
            provider_instance_id(&node(&[], Some("cn-hangzhou.i-abc"))),
            Some("i-abc".to_string())
        );
        assert_eq!(provider_instance_id(&node(&[], Some("i-abc"))), None);
        assert_eq!(provider_instance_id(&node(&[], Some("a.b.c"))), None);
        assert_eq!(provider_instance_id(&node(&[], None)), None);
    }

    #[test]
    fn internal_ip_is_picked_from_addresses() {
        let mut n = node(&[], None);
        n.status = Some(NodeStatus {
            addresses: Some(vec![
                NodeAddress {
                    type_: "Hostname".to_string(),
                    address: "node-a".to_string(),
                },
                NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: "10.0.0.7".to_string(),
                },
            ]),
            ..Default::default()
        });
        assert_eq!(node_internal_ip(&n), Some("10.0.0.7".to_string()));
    }
}
