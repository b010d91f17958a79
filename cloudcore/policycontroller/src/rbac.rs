//! Resolves the RBAC rules a service account can reach.

use cloudcore_k8s_api::{
    policy::{AccessClusterRoleBinding, AccessRoleBinding},
    ClusterRole, ClusterRoleBinding, PolicyRule, ResourceExt, Role, RoleBinding,
};
use cloudcore_k8s_index::Lister;
use k8s_openapi::api::rbac::v1::{RoleRef, Subject};

const ALL_SERVICE_ACCOUNTS_GROUP: &str = "system:serviceaccounts";
const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Cached RBAC objects.
#[derive(Clone)]
pub struct Rbac {
    pub roles: Lister<Role>,
    pub cluster_roles: Lister<ClusterRole>,
    pub role_bindings: Lister<RoleBinding>,
    pub cluster_role_bindings: Lister<ClusterRoleBinding>,
}

/// The user a service account authenticates as.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceAccountUser {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RbacError {
    #[error("{kind} {name:?} not found")]
    MissingRole { kind: &'static str, name: String },

    #[error("unsupported role reference kind: {0:?}")]
    UnsupportedRoleRef(String),
}

/// The bindings that apply to a service account, each with the rules of the role it references.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Closure {
    pub cluster_role_bindings: Vec<AccessClusterRoleBinding>,
    pub role_bindings: Vec<AccessRoleBinding>,
}

// === impl ServiceAccountUser ===

impl ServiceAccountUser {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn username(&self) -> String {
        format!("system:serviceaccount:{}:{}", self.namespace, self.name)
    }

    fn in_group(&self, group: &str) -> bool {
        group == ALL_SERVICE_ACCOUNTS_GROUP
            || group == AUTHENTICATED_GROUP
            || group
                .strip_prefix(ALL_SERVICE_ACCOUNTS_GROUP)
                .and_then(|rest| rest.strip_prefix(':'))
                == Some(self.namespace.as_str())
    }

    /// Returns true if any subject of a binding in `binding_ns` names this user. Service account
    /// subjects without a namespace default to the binding's.
    pub fn bound_by(&self, subjects: Option<&Vec<Subject>>, binding_ns: &str) -> bool {
        subjects
            .into_iter()
            .flatten()
            .any(|subject| match subject.kind.as_str() {
                "User" => subject.name == self.username(),
                "Group" => self.in_group(&subject.name),
                "ServiceAccount" => {
                    let ns = subject
                        .namespace
                        .as_deref()
                        .filter(|ns| !ns.is_empty())
                        .unwrap_or(binding_ns);
                    !ns.is_empty() && ns == self.namespace && subject.name == self.name
                }
                _ => false,
            })
    }
}

impl std::fmt::Display for ServiceAccountUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Rbac ===

impl Rbac {
    /// Resolves the rules of the role a binding in `binding_ns` references.
    pub fn rules_for(
        &self,
        role_ref: &RoleRef,
        binding_ns: &str,
    ) -> Result<Vec<PolicyRule>, RbacError> {
        match role_ref.kind.as_str() {
            "Role" => self
                .roles
                .get(binding_ns, &role_ref.name)
                .map(|role| role.rules.unwrap_or_default())
                .ok_or_else(|| RbacError::MissingRole {
                    kind: "Role",
                    name: format!("{binding_ns}/{}", role_ref.name),
                }),
            "ClusterRole" => self
                .cluster_roles
                .get("", &role_ref.name)
                .map(|role| role.rules.unwrap_or_default())
                .ok_or_else(|| RbacError::MissingRole {
                    kind: "ClusterRole",
                    name: role_ref.name.clone(),
                }),
            kind => Err(RbacError::UnsupportedRoleRef(kind.to_string())),
        }
    }

    /// Collects every cluster role binding and every role binding in `namespace` that applies to
    /// `user`, sorted by binding name.
    pub fn closure(&self, user: &ServiceAccountUser, namespace: &str) -> Result<Closure, RbacError> {
        let mut closure = Closure::default();

        for binding in self.cluster_role_bindings.list() {
            if !user.bound_by(binding.subjects.as_ref(), "") {
                continue;
            }
            let rules = self.rules_for(&binding.role_ref, "")?;
            closure.cluster_role_bindings.push(AccessClusterRoleBinding {
                cluster_role_binding: binding,
                rules,
            });
        }

        if !namespace.is_empty() {
            for binding in self.role_bindings.list_namespace(namespace) {
                if !user.bound_by(binding.subjects.as_ref(), namespace) {
                    continue;
                }
                let rules = self.rules_for(&binding.role_ref, namespace)?;
                closure.role_bindings.push(AccessRoleBinding {
                    role_binding: binding,
                    rules,
                });
            }
        }

        closure.sort();
        Ok(closure)
    }

    pub fn cluster_role_binding_affects(
        &self,
        user: &ServiceAccountUser,
        binding: &ClusterRoleBinding,
    ) -> bool {
        user.bound_by(binding.subjects.as_ref(), "")
    }

    pub fn role_binding_affects(&self, user: &ServiceAccountUser, binding: &RoleBinding) -> bool {
        user.bound_by(
            binding.subjects.as_ref(),
            &binding.namespace().unwrap_or_default(),
        )
    }

    /// A role matters to a user bound to it through a role binding in the user's namespace.
    pub fn role_affects(&self, user: &ServiceAccountUser, role: &Role) -> bool {
        let role_ns = role.namespace().unwrap_or_default();
        self.role_bindings
            .list_namespace(&user.namespace)
            .into_iter()
            .filter(|rb| rb.namespace().unwrap_or_default() == role_ns)
            .filter(|rb| references(&rb.role_ref, "Role", &role.name_any()))
            .any(|rb| user.bound_by(rb.subjects.as_ref(), &role_ns))
    }

    /// A cluster role matters to a user bound to it through a cluster role binding or through a
    /// role binding in the user's namespace.
    pub fn cluster_role_affects(&self, user: &ServiceAccountUser, role: &ClusterRole) -> bool {
        let name = role.name_any();
        let cluster_bound = self
            .cluster_role_bindings
            .list()
            .into_iter()
            .filter(|crb| references(&crb.role_ref, "ClusterRole", &name))
            .any(|crb| user.bound_by(crb.subjects.as_ref(), ""));
        cluster_bound
            || self
                .role_bindings
                .list_namespace(&user.namespace)
                .into_iter()
                .filter(|rb| references(&rb.role_ref, "ClusterRole", &name))
                .any(|rb| user.bound_by(rb.subjects.as_ref(), &user.namespace))
    }
}

impl std::fmt::Debug for Rbac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rbac")
            .field("roles", &self.roles.len())
            .field("cluster_roles", &self.cluster_roles.len())
            .field("role_bindings", &self.role_bindings.len())
            .field("cluster_role_bindings", &self.cluster_role_bindings.len())
            .finish()
    }
}

// === impl Closure ===

impl Closure {
    pub fn sort(&mut self) {
        self.cluster_role_bindings
            .sort_by(|a, b| a.cluster_role_binding.name_any().cmp(&b.cluster_role_binding.name_any()));
        self.role_bindings
            .sort_by(|a, b| a.role_binding.name_any().cmp(&b.role_binding.name_any()));
    }
}

fn references(role_ref: &RoleRef, kind: &str, name: &str) -> bool {
    role_ref.kind == kind && role_ref.name == name
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudcore_k8s_api::{Event, ObjectMeta};
    use cloudcore_k8s_index::Informer;

    fn sa_subject(ns: Option<&str>, name: &str) -> Subject {
        Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: ns.map(str::to_string),
            ..Default::default()
        }
    }

    fn rule(verb: &str, resource: &str) -> PolicyRule {
        PolicyRule {
            verbs: vec![verb.to_string()],
            resources: Some(vec![resource.to_string()]),
            api_groups: Some(vec![String::new()]),
            ..Default::default()
        }
    }

    fn mk_rbac() -> Rbac {
        let roles = Informer::<Role>::new();
        roles.apply(Event::Apply(Role {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("cm-reader".to_string()),
                ..Default::default()
            },
            rules: Some(vec![rule("get", "configmaps")]),
        }));
        let cluster_roles = Informer::<ClusterRole>::new();
        cluster_roles.apply(Event::Apply(ClusterRole {
            metadata: ObjectMeta {
                name: Some("node-reader".to_string()),
                ..Default::default()
            },
            rules: Some(vec![rule("list", "nodes")]),
            ..Default::default()
        }));

        let role_bindings = Informer::<RoleBinding>::new();
        for (name, kind, role, subject) in [
            ("b-local", "Role", "cm-reader", sa_subject(None, "app")),
            ("a-cluster", "ClusterRole", "node-reader", sa_subject(Some("default"), "app")),
            ("c-other", "Role", "cm-reader", sa_subject(None, "other")),
        ] {
            role_bindings.apply(Event::Apply(RoleBinding {
                metadata: ObjectMeta {
                    namespace: Some("default".to_string()),
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: kind.to_string(),
                    name: role.to_string(),
                },
                subjects: Some(vec![subject]),
            }));
        }

        let cluster_role_bindings = Informer::<ClusterRoleBinding>::new();
        cluster_role_bindings.apply(Event::Apply(ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some("all-sas".to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "node-reader".to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "Group".to_string(),
                name: "system:serviceaccounts:default".to_string(),
                ..Default::default()
            }]),
        }));

        Rbac {
            roles: roles.lister(),
            cluster_roles: cluster_roles.lister(),
            role_bindings: role_bindings.lister(),
            cluster_role_bindings: cluster_role_bindings.lister(),
        }
    }

    #[test]
    fn subjects_match_service_accounts() {
        let user = ServiceAccountUser::new("default", "app");
        assert!(user.bound_by(Some(&vec![sa_subject(None, "app")]), "default"));
        assert!(user.bound_by(Some(&vec![sa_subject(Some("default"), "app")]), ""));
        assert!(!user.bound_by(Some(&vec![sa_subject(None, "app")]), ""));
        assert!(!user.bound_by(Some(&vec![sa_subject(Some("other"), "app")]), "default"));

        let user_subject = Subject {
            kind: "User".to_string(),
            name: "system:serviceaccount:default:app".to_string(),
            ..Default::default()
        };
        assert!(user.bound_by(Some(&vec![user_subject]), ""));

        for (group, bound) in [
            ("system:serviceaccounts", true),
            ("system:serviceaccounts:default", true),
            ("system:serviceaccounts:kube-system", false),
            ("system:authenticated", true),
            ("system:nodes", false),
        ] {
            let subject = Subject {
                kind: "Group".to_string(),
                name: group.to_string(),
                ..Default::default()
            };
            assert_eq!(user.bound_by(Some(&vec![subject]), ""), bound, "{group}");
        }
        assert!(!user.bound_by(None, "default"));
    }

    #[test]
    fn closure_is_sorted_by_binding_name() {
        let rbac = mk_rbac();
        let closure = rbac
            .closure(&ServiceAccountUser::new("default", "app"), "default")
            .unwrap();

        let names = closure
            .role_bindings
            .iter()
            .map(|b| b.role_binding.name_any())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a-cluster", "b-local"]);
        assert_eq!(closure.role_bindings[0].rules, vec![rule("list", "nodes")]);
        assert_eq!(closure.role_bindings[1].rules, vec![rule("get", "configmaps")]);

        assert_eq!(closure.cluster_role_bindings.len(), 1);
        assert_eq!(
            closure.cluster_role_bindings[0].cluster_role_binding.name_any(),
            "all-sas"
        );
    }

    #[test]
    fn missing_roles_fail_the_closure() {
        let rbac = mk_rbac();
        let err = rbac
            .rules_for(
                &RoleRef {
                    kind: "Role".to_string(),
                    name: "gone".to_string(),
                    ..Default::default()
                },
                "default",
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "Role \"default/gone\" not found");

        let err = rbac
            .rules_for(
                &RoleRef {
                    kind: "Group".to_string(),
                    name: "x".to_string(),
                    ..Default::default()
                },
                "default",
            )
            .unwrap_err();
        assert!(matches!(err, RbacError::UnsupportedRoleRef(k) if k == "Group"));
    }

    #[test]
    fn roles_affect_bound_users() {
        let rbac = mk_rbac();
        let app = ServiceAccountUser::new("default", "app");
        let stranger = ServiceAccountUser::new("kube-system", "app");

        let role = rbac.roles.get("default", "cm-reader").unwrap();
        assert!(rbac.role_affects(&app, &role));
        assert!(!rbac.role_affects(&stranger, &role));

        let cluster_role = rbac.cluster_roles.get("", "node-reader").unwrap();
        assert!(rbac.cluster_role_affects(&app, &cluster_role));
        assert!(!rbac.cluster_role_affects(&stranger, &cluster_role));
    }
}
