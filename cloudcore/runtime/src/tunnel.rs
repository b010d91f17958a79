//! Negotiates a tunnel port that is unique among cloud core replicas.
//!
//! Replicas share a record of `ip → port` assignments stored as an annotation on a configmap in
//! the system namespace. A replica that finds its address recorded reuses that port; otherwise it
//! claims the lowest unrecorded port above the base and writes the record back, relying on the
//! store's optimistic concurrency to detect racing replicas.

use anyhow::{anyhow, Context};
use cloudcore_k8s_api::{ConfigMap, ObjectMeta};
use cloudcore_k8s_index::{DynamicStore, StoreError, TypedStoreExt};
use k8s_openapi::api::core::v1::Namespace;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::IpAddr};
use tracing::{debug, info};

pub const TUNNEL_PORT_CONFIGMAP: &str = "tunnelport";
pub const TUNNEL_PORT_RECORD_ANNOTATION: &str = "tunnelportrecord.kubeedge.io";

const MAX_ATTEMPTS: usize = 5;

/// Port assignments shared by every replica.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelPortRecord {
    pub ip_tunnel_port: BTreeMap<String, u16>,
    pub port: BTreeMap<u16, bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("configmap {namespace}/tunnelport has no tunnel port record")]
    MissingRecord { namespace: String },

    #[error("invalid tunnel port record: {0}")]
    Record(#[source] serde_json::Error),

    #[error("no free tunnel port above {0}")]
    Exhausted(u16),

    #[error("tunnel port record kept changing after {0} attempts")]
    Contended(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// === impl TunnelPortRecord ===

impl TunnelPortRecord {
    /// Returns the port recorded for `ip`, recording the lowest unrecorded port above `base` if
    /// there is none. The flag is true when the record changed.
    pub fn assign(&mut self, ip: &str, base: u16) -> Result<(u16, bool), TunnelError> {
        if let Some(port) = self.ip_tunnel_port.get(ip) {
            return Ok((*port, false));
        }
        let mut port = base;
        loop {
            port = port.checked_add(1).ok_or(TunnelError::Exhausted(base))?;
            if !self.port.contains_key(&port) {
                break;
            }
        }
        self.ip_tunnel_port.insert(ip.to_string(), port);
        self.port.insert(port, true);
        Ok((port, true))
    }

    fn from_configmap(cm: &ConfigMap, namespace: &str) -> Result<Self, TunnelError> {
        let value = cm
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(TUNNEL_PORT_RECORD_ANNOTATION))
            .ok_or_else(|| TunnelError::MissingRecord {
                namespace: namespace.to_string(),
            })?;
        serde_json::from_str(value).map_err(TunnelError::Record)
    }

    fn to_annotation(&self) -> Result<String, TunnelError> {
        serde_json::to_string(self).map_err(TunnelError::Record)
    }
}

/// Returns this replica's tunnel port, recording it if necessary. Concurrent writers are detected
/// through conflicts and the negotiation is retried from a fresh read.
pub async fn negotiate(
    store: &dyn DynamicStore,
    namespace: &str,
    ip: IpAddr,
    base: u16,
) -> Result<u16, TunnelError> {
    ensure_namespace(store, namespace).await?;
    let ip = ip.to_string();
    for attempt in 1..=MAX_ATTEMPTS {
        match try_negotiate(store, namespace, &ip, base).await {
            Err(TunnelError::Store(error)) if error.is_conflict() => {
                debug!(attempt, %error, "Tunnel port record changed; retrying");
            }
            res => return res,
        }
    }
    Err(TunnelError::Contended(MAX_ATTEMPTS))
}

async fn try_negotiate(
    store: &dyn DynamicStore,
    namespace: &str,
    ip: &str,
    base: u16,
) -> Result<u16, TunnelError> {
    let mut cm = match store
        .get_typed::<ConfigMap>(namespace, TUNNEL_PORT_CONFIGMAP)
        .await
    {
        Ok(cm) => cm,
        Err(error) if error.is_not_found() => {
            let mut record = TunnelPortRecord::default();
            let (port, _) = record.assign(ip, base)?;
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    namespace: Some(namespace.to_string()),
                    name: Some(TUNNEL_PORT_CONFIGMAP.to_string()),
                    annotations: Some(
                        [(
                            TUNNEL_PORT_RECORD_ANNOTATION.to_string(),
                            record.to_annotation()?,
                        )]
                        .into(),
                    ),
                    ..Default::default()
                },
                ..Default::default()
            };
            store.create_typed(namespace, &cm).await?;
            info!(%ip, port, "Created tunnel port record");
            return Ok(port);
        }
        Err(error) => return Err(error.into()),
    };

    let mut record = TunnelPortRecord::from_configmap(&cm, namespace)?;
    let (port, changed) = record.assign(ip, base)?;
    if changed {
        cm.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                TUNNEL_PORT_RECORD_ANNOTATION.to_string(),
                record.to_annotation()?,
            );
        store.replace_typed(namespace, &cm).await?;
        info!(%ip, port, "Recorded tunnel port");
    } else {
        debug!(%ip, port, "Reusing tunnel port");
    }
    Ok(port)
}

async fn ensure_namespace(store: &dyn DynamicStore, name: &str) -> Result<(), StoreError> {
    match store.get_typed::<Namespace>("", name).await {
        Ok(_) => return Ok(()),
        Err(error) if error.is_not_found() => {}
        Err(error) => return Err(error),
    }
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match store.create_typed("", &ns).await {
        Ok(_) => {
            info!(namespace = %name, "Created system namespace");
            Ok(())
        }
        Err(error) if error.is_already_exists() => Ok(()),
        Err(error) => Err(error),
    }
}

/// Resolves the address this replica records its port under: the advertised address if one is
/// configured, else the first non-loopback address of the host name.
pub async fn local_ip(advertise: Option<IpAddr>) -> anyhow::Result<IpAddr> {
    if let Some(ip) = advertise {
        return Ok(ip);
    }
    let host = std::env::var("HOSTNAME")
        .context("HOSTNAME is not set and no advertise address was configured")?;
    let addrs = tokio::net::lookup_host((host.as_str(), 0))
        .await
        .with_context(|| format!("failed to resolve {host}"))?
        .map(|addr| addr.ip())
        .collect::<Vec<_>>();
    addrs
        .iter()
        .find(|ip| !ip.is_loopback())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow!("{host} has no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudcore_k8s_index::store::MemoryStore;
    use maplit::btreemap;

    const NS: &str = "kubeedge";
    const BASE: u16 = 10350;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn mk_record_cm(record: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(NS.to_string()),
                name: Some(TUNNEL_PORT_CONFIGMAP.to_string()),
                annotations: Some(btreemap! {
                    TUNNEL_PORT_RECORD_ANNOTATION.to_string() => record.to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn annotation(store: &MemoryStore) -> String {
        let cm = store
            .get_typed_object::<ConfigMap>(NS, TUNNEL_PORT_CONFIGMAP)
            .expect("configmap must exist");
        cm.metadata.annotations.unwrap()[TUNNEL_PORT_RECORD_ANNOTATION].clone()
    }

    #[tokio::test]
    async fn first_replica_creates_the_record() {
        let store = MemoryStore::new();
        let port = negotiate(&store, NS, ip("10.0.0.1"), BASE).await.unwrap();
        assert_eq!(port, 10351);
        assert_eq!(
            annotation(&store),
            r#"{"ipTunnelPort":{"10.0.0.1":10351},"port":{"10351":true}}"#
        );
        assert!(store.get_typed_object::<Namespace>("", NS).is_some());
    }

    #[tokio::test]
    async fn recorded_ports_are_skipped() {
        let store = MemoryStore::new();
        store.insert(&mk_record_cm(
            r#"{"ipTunnelPort":{"127.0.0.1":10351},"port":{"10351":true}}"#,
        ));
        let port = negotiate(&store, NS, ip("10.0.0.2"), BASE).await.unwrap();
        assert_eq!(port, 10352);
        assert_eq!(
            annotation(&store),
            r#"{"ipTunnelPort":{"10.0.0.2":10352,"127.0.0.1":10351},"port":{"10351":true,"10352":true}}"#
        );
    }

    #[tokio::test]
    async fn known_addresses_reuse_their_port() {
        let store = MemoryStore::new();
        store.insert(&mk_record_cm(
            r#"{"ipTunnelPort":{"127.0.0.1":10353},"port":{"10353":true}}"#,
        ));
        let before = store
            .get_typed_object::<ConfigMap>(NS, TUNNEL_PORT_CONFIGMAP)
            .unwrap();
        let port = negotiate(&store, NS, ip("127.0.0.1"), BASE).await.unwrap();
        assert_eq!(port, 10353);
        let after = store
            .get_typed_object::<ConfigMap>(NS, TUNNEL_PORT_CONFIGMAP)
            .unwrap();
        assert_eq!(
            before.metadata.resource_version,
            after.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn conflicts_are_retried() {
        let store = MemoryStore::new();
        store.insert(&Namespace {
            metadata: ObjectMeta {
                name: Some(NS.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        store.insert(&mk_record_cm(
            r#"{"ipTunnelPort":{"127.0.0.1":10351},"port":{"10351":true}}"#,
        ));
        store.fail_next(StoreError::conflict(
            "configmaps",
            TUNNEL_PORT_CONFIGMAP,
            "the object has been modified",
        ));
        let port = negotiate(&store, NS, ip("10.0.0.2"), BASE).await.unwrap();
        assert_eq!(port, 10352);
    }

    #[tokio::test]
    async fn records_without_an_annotation_fail() {
        let store = MemoryStore::new();
        store.insert(&ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(NS.to_string()),
                name: Some(TUNNEL_PORT_CONFIGMAP.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let err = negotiate(&store, NS, ip("10.0.0.2"), BASE)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::MissingRecord { .. }), "{err}");
    }

    #[test]
    fn assigns_the_lowest_free_port() {
        let mut record = TunnelPortRecord {
            ip_tunnel_port: btreemap! {
                "a".to_string() => 10351,
                "b".to_string() => 10352,
                "c".to_string() => 10354,
            },
            port: btreemap! { 10351 => true, 10352 => true, 10354 => true },
        };
        assert_eq!(record.assign("d", BASE).unwrap(), (10353, true));
        assert_eq!(record.assign("e", BASE).unwrap(), (10355, true));
        assert_eq!(record.assign("a", BASE).unwrap(), (10351, false));
    }

    #[test]
    fn exhausted_ranges_fail() {
        let mut record = TunnelPortRecord::default();
        assert!(matches!(
            record.assign("a", u16::MAX),
            Err(TunnelError::Exhausted(u16::MAX))
        ));
    }
}
