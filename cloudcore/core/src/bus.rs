use crate::{
    message::{Message, Operation},
    modules, resource,
};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An in-process, module-addressed message bus.
///
/// Each registered module owns a bounded inbox; delivery is FIFO per sender and blocks when the
/// target's inbox is full.
#[derive(Clone, Debug, Default)]
pub struct Bus {
    modules: Arc<RwLock<HashMap<String, Registration>>>,
    metrics: Option<BusMetrics>,
}

/// A module's inbound queue.
#[derive(Debug)]
pub struct Inbox {
    name: String,
    rx: mpsc::Receiver<Message>,
}

#[derive(Clone, Debug)]
struct Registration {
    group: String,
    tx: mpsc::Sender<Message>,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum BusError {
    #[error("module {0} is not registered")]
    UnknownModule(String),

    #[error("module {0} is already registered")]
    AlreadyRegistered(String),

    #[error("module {0} is no longer receiving")]
    Closed(String),

    #[error("no module is registered in group {0}")]
    UnknownGroup(String),
}

/// Sends on behalf of one module: outbound messages go to the cloud hub unless they address the
/// router domain, and responses correlate to their request.
#[derive(Clone, Debug)]
pub struct MessageLayer {
    bus: Bus,
    source: &'static str,
    send_target: &'static str,
    response_target: &'static str,
}

#[derive(Clone, Debug)]
pub struct BusMetrics {
    sent: Family<SendLabels, Counter>,
    failed: Family<SendLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SendLabels {
    module: String,
    operation: String,
}

// === impl Bus ===

impl Bus {
    pub fn new(metrics: BusMetrics) -> Self {
        Self {
            modules: Default::default(),
            metrics: Some(metrics),
        }
    }

    /// Registers a module and returns its inbox.
    pub fn register(
        &self,
        name: impl Into<String>,
        group: impl Into<String>,
        capacity: usize,
    ) -> Result<Inbox, BusError> {
        let name = name.into();
        let mut modules = self.modules.write();
        if modules.contains_key(&name) {
            return Err(BusError::AlreadyRegistered(name));
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        modules.insert(
            name.clone(),
            Registration {
                group: group.into(),
                tx,
            },
        );
        tracing::debug!(module = %name, "Registered");
        Ok(Inbox { name, rx })
    }

    pub fn unregister(&self, name: &str) {
        self.modules.write().remove(name);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    /// Enqueues `msg` into the inbox of `module`, waiting for capacity.
    pub async fn send(&self, module: &str, msg: Message) -> Result<(), BusError> {
        let tx = self
            .modules
            .read()
            .get(module)
            .map(|r| r.tx.clone())
            .ok_or_else(|| BusError::UnknownModule(module.to_string()));
        let res = match tx {
            Ok(tx) => {
                let op = msg.operation();
                tx.send(msg)
                    .await
                    .map_err(|_| BusError::Closed(module.to_string()))
                    .map(|()| op)
            }
            Err(e) => Err(e),
        };
        if let Some(metrics) = &self.metrics {
            metrics.record(module, res.as_ref().ok().copied());
        }
        res.map(|_| ())
    }

    /// Delivers a copy of `msg` to every module registered in `group`.
    pub async fn send_to_group(&self, group: &str, msg: Message) -> Result<(), BusError> {
        let targets = self
            .modules
            .read()
            .iter()
            .filter(|(_, r)| r.group == group)
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        if targets.is_empty() {
            return Err(BusError::UnknownGroup(group.to_string()));
        }
        for name in targets {
            self.send(&name, msg.clone()).await?;
        }
        Ok(())
    }
}

// === impl Inbox ===

impl Inbox {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next message. Returns `None` once the module is unregistered and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

// === impl MessageLayer ===

impl MessageLayer {
    pub fn new(bus: Bus, source: &'static str) -> Self {
        Self {
            bus,
            source,
            send_target: modules::CLOUDHUB,
            response_target: modules::CLOUDHUB,
        }
    }

    pub fn with_send_target(mut self, target: &'static str) -> Self {
        self.send_target = target;
        self
    }

    pub fn with_response_target(mut self, target: &'static str) -> Self {
        self.response_target = target;
        self
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Sends `msg` to the cloud hub, or to the router when it carries a rule or rule endpoint.
    pub async fn send(&self, msg: Message) -> Result<(), BusError> {
        let target = match router_resource_type(msg.resource()) {
            Some(_) => modules::ROUTER,
            None => self.send_target,
        };
        self.bus.send(target, msg).await
    }

    /// Sends `msg`, which must be a `response` correlated to a request.
    pub async fn response(&self, msg: Message) -> Result<(), BusError> {
        debug_assert_eq!(msg.operation(), Operation::Response);
        self.bus.send(self.response_target, msg).await
    }
}

fn router_resource_type(res: &str) -> Option<&str> {
    let ty = resource::resource_type(res)
        .ok()
        .or_else(|| res.split(resource::SEP).next())?;
    matches!(ty, resource::RULE | resource::RULE_ENDPOINT).then_some(ty)
}

// === impl BusMetrics ===

impl BusMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let sent = Family::<SendLabels, Counter>::default();
        reg.register("sent", "Total number of messages delivered to a module", sent.clone());

        let failed = Family::<SendLabels, Counter>::default();
        reg.register(
            "send_failed",
            "Total number of messages that could not be delivered to a module",
            failed.clone(),
        );

        Self { sent, failed }
    }

    fn record(&self, module: &str, op: Option<Operation>) {
        let (family, operation) = match op {
            Some(op) => (&self.sent, op.to_string()),
            None => (&self.failed, String::new()),
        };
        family
            .get_or_create(&SendLabels {
                module: module.to_string(),
                operation,
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    fn mk_msg(resource: &str, op: Operation) -> Message {
        Message::new("").build_router(modules::EDGE_CONTROLLER, modules::GROUP_RESOURCE, resource, op)
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let bus = Bus::default();
        let mut inbox = bus.register(modules::CLOUDHUB, modules::GROUP_CLOUDHUB, 8).unwrap();

        let first = mk_msg("node/n/default/pod/a", Operation::Insert);
        let second = mk_msg("node/n/default/pod/a", Operation::Update);
        bus.send(modules::CLOUDHUB, first.clone()).await.unwrap();
        bus.send(modules::CLOUDHUB, second.clone()).await.unwrap();

        assert_eq!(inbox.recv().await.unwrap().id(), first.id());
        assert_eq!(inbox.recv().await.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn unknown_module() {
        let bus = Bus::default();
        let err = bus
            .send("nope", mk_msg("node/n/default/pod/a", Operation::Insert))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownModule(m) if m == "nope"));
        assert!(bus.register("a", "g", 1).is_ok());
        assert!(matches!(
            bus.register("a", "g", 1),
            Err(BusError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn rules_are_routed_to_the_router() {
        let bus = Bus::default();
        let mut hub = bus.register(modules::CLOUDHUB, modules::GROUP_CLOUDHUB, 8).unwrap();
        let mut router = bus.register(modules::ROUTER, modules::GROUP_ROUTER, 8).unwrap();
        let layer = MessageLayer::new(bus, modules::EDGE_CONTROLLER);

        layer
            .send(mk_msg("rule/r1", Operation::Insert))
            .await
            .unwrap();
        layer
            .send(mk_msg("node/n/default/ruleendpoint/re", Operation::Delete))
            .await
            .unwrap();
        layer
            .send(mk_msg("node/n/default/pod/p", Operation::Insert))
            .await
            .unwrap();

        assert_eq!(router.recv().await.unwrap().resource(), "rule/r1");
        assert_eq!(
            router.recv().await.unwrap().resource(),
            "node/n/default/ruleendpoint/re"
        );
        assert_eq!(hub.recv().await.unwrap().resource(), "node/n/default/pod/p");
        assert!(time::timeout(time::Duration::from_millis(10), hub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn group_fan_out() {
        let bus = Bus::default();
        let mut a = bus.register("a", "meta", 1).unwrap();
        let mut b = bus.register("b", "meta", 1).unwrap();
        let _c = bus.register("c", "other", 1).unwrap();

        let msg = mk_msg("node/n/default/pod/p", Operation::Query);
        bus.send_to_group("meta", msg.clone()).await.unwrap();
        assert_eq!(a.recv().await.unwrap().id(), msg.id());
        assert_eq!(b.recv().await.unwrap().id(), msg.id());

        assert!(matches!(
            bus.send_to_group("missing", msg).await,
            Err(BusError::UnknownGroup(_))
        ));
    }
}
