use crate::rbac::Closure;
use cloudcore_core::Operation;
use cloudcore_k8s_api::{
    policy::{AccessSpec, ServiceAccountAccess},
    ServiceAccount,
};
use std::collections::BTreeSet;

/// The writes and messages that bring an access object in line with the cluster.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    /// The access object is deleted; no other write happens.
    pub delete: bool,
    pub spec: Option<AccessSpec>,
    /// The node list to record on the status.
    pub nodes: Option<Vec<String>>,
    pub sends: Vec<(String, Operation)>,
}

/// Compares the recorded access against the desired spec and node set.
///
/// Nodes that no longer run the service account are told to delete the access. If the spec
/// changed, nodes that keep it are sent an update. Newly added nodes are sent an insert.
pub fn plan(acc: &ServiceAccountAccess, desired: AccessSpec, nodes: Vec<String>) -> Plan {
    let nodes = nodes.into_iter().collect::<BTreeSet<_>>();
    let prior = acc.node_list().iter().cloned().collect::<BTreeSet<_>>();
    if nodes.is_empty() && prior.is_empty() {
        return Plan::default();
    }

    let removed = prior.difference(&nodes).map(|n| (n.clone(), Operation::Delete));
    if nodes.is_empty() {
        return Plan {
            delete: true,
            sends: removed.collect(),
            ..Default::default()
        };
    }

    let mut plan = Plan {
        sends: removed.collect(),
        ..Default::default()
    };
    if !same_spec(&acc.spec, &desired) {
        plan.spec = Some(desired);
        plan.sends.extend(
            prior
                .intersection(&nodes)
                .map(|n| (n.clone(), Operation::Update)),
        );
    }
    plan.sends.extend(
        nodes
            .difference(&prior)
            .map(|n| (n.clone(), Operation::Insert)),
    );
    if nodes != prior {
        plan.nodes = Some(nodes.into_iter().collect());
    }
    plan
}

/// Binding order is ignored. Service accounts are compared without their metadata, which the
/// access object cannot track.
fn same_spec(recorded: &AccessSpec, desired: &AccessSpec) -> bool {
    let sorted = |spec: &AccessSpec| {
        let mut closure = Closure {
            cluster_role_bindings: spec.access_cluster_role_bindings.clone(),
            role_bindings: spec.access_role_bindings.clone(),
        };
        closure.sort();
        closure
    };
    let strip = |sa: &ServiceAccount| ServiceAccount {
        metadata: Default::default(),
        ..sa.clone()
    };
    recorded.service_account_uid == desired.service_account_uid
        && strip(&recorded.service_account) == strip(&desired.service_account)
        && sorted(recorded) == sorted(desired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudcore_k8s_api::{
        policy::{AccessRoleBinding, AccessStatus},
        ObjectMeta, RoleBinding,
    };
    use pretty_assertions::assert_eq;

    fn mk_spec(uid: &str, bindings: &[&str]) -> AccessSpec {
        AccessSpec {
            service_account: ServiceAccount {
                metadata: ObjectMeta {
                    namespace: Some("default".to_string()),
                    name: Some("app".to_string()),
                    uid: Some(uid.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            service_account_uid: uid.to_string(),
            access_role_bindings: bindings
                .iter()
                .map(|name| AccessRoleBinding {
                    role_binding: RoleBinding {
                        metadata: ObjectMeta {
                            namespace: Some("default".to_string()),
                            name: Some(name.to_string()),
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                    rules: vec![],
                })
                .collect(),
            ..Default::default()
        }
    }

    fn mk_access(spec: AccessSpec, nodes: &[&str]) -> ServiceAccountAccess {
        let mut acc = ServiceAccountAccess::new("app", spec);
        acc.metadata.namespace = Some("default".to_string());
        acc.status = Some(AccessStatus {
            node_list: nodes.iter().map(|n| n.to_string()).collect(),
        });
        acc
    }

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn sends(pairs: &[(&str, Operation)]) -> Vec<(String, Operation)> {
        pairs.iter().map(|(n, op)| (n.to_string(), *op)).collect()
    }

    #[test]
    fn nothing_to_do_without_nodes() {
        let acc = mk_access(mk_spec("u1", &[]), &[]);
        assert_eq!(plan(&acc, mk_spec("u2", &["rb"]), vec![]), Plan::default());
    }

    #[test]
    fn new_nodes_receive_inserts() {
        let acc = mk_access(mk_spec("u1", &["rb"]), &[]);
        let plan = plan(&acc, mk_spec("u1", &["rb"]), nodes(&["n2", "n1", "n1"]));
        assert_eq!(
            plan,
            Plan {
                nodes: Some(nodes(&["n1", "n2"])),
                sends: sends(&[("n1", Operation::Insert), ("n2", Operation::Insert)]),
                ..Default::default()
            }
        );
    }

    #[test]
    fn spec_changes_update_kept_nodes() {
        let acc = mk_access(mk_spec("u1", &["a"]), &["n1", "n2"]);
        let desired = mk_spec("u1", &["a", "b"]);
        let plan = plan(&acc, desired.clone(), nodes(&["n2", "n3"]));
        assert_eq!(
            plan,
            Plan {
                spec: Some(desired),
                nodes: Some(nodes(&["n2", "n3"])),
                sends: sends(&[
                    ("n1", Operation::Delete),
                    ("n2", Operation::Update),
                    ("n3", Operation::Insert),
                ]),
                ..Default::default()
            }
        );
    }

    #[test]
    fn unchanged_access_is_left_alone() {
        let acc = mk_access(mk_spec("u1", &["b", "a"]), &["n1"]);
        let mut desired = mk_spec("u1", &["a", "b"]);
        desired.service_account.metadata.resource_version = Some("9".to_string());
        assert_eq!(plan(&acc, desired, nodes(&["n1"])), Plan::default());
    }

    #[test]
    fn recreated_service_accounts_change_the_spec() {
        let acc = mk_access(mk_spec("u1", &["a"]), &["n1"]);
        let desired = mk_spec("u2", &["a"]);
        let plan = plan(&acc, desired.clone(), nodes(&["n1"]));
        assert_eq!(plan.spec, Some(desired));
        assert_eq!(plan.nodes, None);
        assert_eq!(plan.sends, sends(&[("n1", Operation::Update)]));
    }

    #[test]
    fn losing_every_node_deletes_the_access() {
        let acc = mk_access(mk_spec("u1", &["a"]), &["n1", "n2"]);
        assert_eq!(
            plan(&acc, mk_spec("u1", &["a"]), vec![]),
            Plan {
                delete: true,
                sends: sends(&[("n1", Operation::Delete), ("n2", Operation::Delete)]),
                ..Default::default()
            }
        );
    }
}
