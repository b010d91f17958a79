use super::*;
use crate::{
    cache::WatchCacheError,
    filter::DefaultMaster,
    test_util::{mk_pod, pods_gvr, pods_resource, FakeInformers},
};
use cloudcore_core::Bus;
use cloudcore_k8s_api::{ConfigMap, Event, ObjectMeta, Pod};
use cloudcore_k8s_index::store::MemoryStore;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointPort, EndpointSlice};
use maplit::btreemap;
use tokio::time;

struct Fixture {
    center: Center,
    store: MemoryStore,
    informers: FakeInformers,
    hub: Inbox,
    drain: drain::Watch,
    _signal: drain::Signal,
}

fn mk_fixture(config: Config) -> Fixture {
    mk_fixture_with_filters(config, Filters::default())
}

fn mk_fixture_with_filters(config: Config, filters: Filters) -> Fixture {
    let bus = Bus::default();
    let hub = bus
        .register(modules::CLOUDHUB, modules::GROUP_CLOUDHUB, 64)
        .unwrap();
    let messages = MessageLayer::new(bus, modules::DYNAMIC_CONTROLLER);
    let (signal, drain) = drain::channel();
    let store = MemoryStore::new()
        .with_typed::<Pod>()
        .with_typed::<ConfigMap>()
        .with_typed::<EndpointSlice>();
    let informers = FakeInformers::default();
    let handlers = HandlerCenter::new(
        Arc::new(informers.clone()),
        messages.clone(),
        filters.clone(),
        &config,
        drain.clone(),
    );
    let center = Center::new(Arc::new(store.clone()), handlers, messages, filters, config);
    Fixture {
        center,
        store,
        informers,
        hub,
        drain,
        _signal: signal,
    }
}

fn mk_msg(node: &str, app: &Application) -> Message {
    let resource = resource::build_resource(node, IGNORE, APPLICATION_RESOURCE, IGNORE).unwrap();
    Message::new("")
        .build_router("metaserver", modules::GROUP_RESOURCE, resource, Operation::Query)
        .fill_body(app)
}

fn mk_sync(node: &str, apps: &BTreeMap<String, Application>) -> Message {
    let resource = resource::build_resource(node, IGNORE, WATCH_APP_SYNC, "").unwrap();
    Message::new("")
        .build_router("metaserver", modules::GROUP_RESOURCE, resource, Operation::Query)
        .fill_body(apps)
}

fn mk_cm(name: &str, value: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(btreemap! { "k".to_string() => value.to_string() }),
        ..Default::default()
    }
}

async fn next(hub: &mut Inbox) -> Message {
    time::timeout(time::Duration::from_secs(1), hub.recv())
        .await
        .expect("must not time out")
        .expect("must receive")
}

/// Returns the next application response, skipping pushed watch events.
async fn next_response(hub: &mut Inbox) -> Message {
    loop {
        let msg = next(hub).await;
        if msg.operation() == Operation::Response {
            return msg;
        }
    }
}

async fn process(fx: &mut Fixture, app: &Application) -> Application {
    fx.center.process(mk_msg(&app.nodename, app)).await;
    let rsp = next_response(&mut fx.hub).await;
    assert_eq!(rsp.parent_id(), app.id, "responses must answer the application");
    assert_eq!(rsp.resource(), "node/edge-1/ignore/Application/ignore");
    rsp.content_to().expect("response must carry the application")
}

#[tokio::test]
async fn get_returns_the_object() {
    let mut fx = mk_fixture(Config::default());
    let pod = Pod {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some("p".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    fx.store.insert(&pod);

    let app = Application::new("edge-1", "/core/v1/pods/default/p", Verb::Get, vec![], vec![]);
    let rsp = process(&mut fx, &app).await;

    assert_eq!(rsp.status, ApplicationStatus::Approved);
    assert_eq!(rsp.reason, "");
    let stored = fx
        .store
        .get_object(&pods_resource(), "default", "p")
        .unwrap();
    assert_eq!(rsp.resp_body, serde_json::to_vec(&stored).unwrap());
    assert!(fx.store.reviews().is_empty());
}

#[tokio::test]
async fn missing_objects_are_rejected_with_a_status() {
    let mut fx = mk_fixture(Config::default());
    let app = Application::new("edge-1", "/core/v1/pods/default/p", Verb::Get, vec![], vec![]);
    let rsp = process(&mut fx, &app).await;

    assert_eq!(rsp.status, ApplicationStatus::Rejected);
    assert!(rsp.resp_body.is_empty());
    let status = rsp.error.expect("must carry a status").status;
    assert_eq!(status.code, Some(404));
    assert_eq!(status.reason.as_deref(), Some("NotFound"));
    assert_eq!(rsp.reason, "pods \"p\" not found");
}

#[tokio::test]
async fn resent_applications_get_a_fresh_verdict() {
    let mut fx = mk_fixture(Config::default());
    fx.store.insert(&mk_cm("web", "v"));

    let mut app = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/web",
        Verb::Get,
        vec![],
        vec![],
    );
    app.status = ApplicationStatus::Approved;
    app.reason = "stale".to_string();
    app.resp_body = b"stale".to_vec();
    let rsp = process(&mut fx, &app).await;
    assert_eq!(rsp.status, ApplicationStatus::Approved, "{}", rsp.reason);
    assert_eq!(rsp.reason, "");
    let body = serde_json::from_slice::<serde_json::Value>(&rsp.resp_body).unwrap();
    assert_eq!(body["data"]["k"], "v");

    let mut missing = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/gone",
        Verb::Get,
        vec![],
        vec![],
    );
    missing.status = ApplicationStatus::Completed;
    let rsp = process(&mut fx, &missing).await;
    assert_eq!(rsp.status, ApplicationStatus::Rejected);
    assert_eq!(rsp.reason, "configmaps \"gone\" not found");
}

#[tokio::test]
async fn node_must_match_when_authorizing() {
    let mut fx = mk_fixture(Config {
        enable_authorization: true,
        ..Default::default()
    });
    let app = Application::new("edge-1", "/core/v1/pods/default/p", Verb::Get, vec![], vec![]);
    fx.center.process(mk_msg("edge-2", &app)).await;

    let rsp = next_response(&mut fx.hub).await.content_to::<Application>().unwrap();
    assert_eq!(rsp.status, ApplicationStatus::Rejected);
    assert!(rsp.reason.contains("edge-2"), "{}", rsp.reason);
    assert!(rsp.error.is_none());
}

#[tokio::test]
async fn authorization_reviews_every_verb() {
    let mut fx = mk_fixture(Config {
        enable_authorization: true,
        ..Default::default()
    });
    fx.store.insert(&mk_cm("cm", "v"));
    fx.store.allow("system:node:edge-1", false);

    let app = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/cm",
        Verb::UpdateStatus,
        vec![],
        serde_json::to_vec(&mk_cm("cm", "v2")).unwrap(),
    );
    let rsp = process(&mut fx, &app).await;
    assert_eq!(rsp.status, ApplicationStatus::Rejected);
    assert_eq!(rsp.error.unwrap().status.code, Some(403));

    let reviews = fx.store.reviews();
    assert_eq!(reviews.len(), 1);
    let attrs = reviews[0].spec.resource_attributes.clone().unwrap();
    assert_eq!(attrs.verb.as_deref(), Some("update"));
    assert_eq!(attrs.subresource.as_deref(), Some("status"));
    assert_eq!(attrs.namespace.as_deref(), Some("default"));
    assert_eq!(attrs.name.as_deref(), Some("cm"));
    assert_eq!(
        reviews[0].spec.groups.as_deref(),
        Some(&["system:nodes".to_string()][..])
    );
}

#[tokio::test]
async fn pass_through_paths_return_raw_bodies() {
    let mut fx = mk_fixture(Config::default());
    let version = br#"{"major":"1","minor":"33","gitVersion":"v1.33.0"}"#;
    fx.store.set_raw("/version", version.to_vec());

    let app = Application::new("edge-1", "/version", Verb::Get, vec![], vec![]);
    let rsp = process(&mut fx, &app).await;
    assert_eq!(rsp.status, ApplicationStatus::Approved);
    assert_eq!(rsp.resp_body, version.to_vec());
}

#[tokio::test]
async fn unknown_verbs_are_rejected() {
    let mut fx = mk_fixture(Config::default());
    let app = Application::new(
        "edge-1",
        "/core/v1/pods/default/p",
        Verb::Other("connect".to_string()),
        vec![],
        vec![],
    );
    let rsp = process(&mut fx, &app).await;
    assert_eq!(rsp.status, ApplicationStatus::Rejected);
    assert_eq!(rsp.reason, "unsupported Application Verb type: connect");
}

#[tokio::test]
async fn undecodable_messages_are_dropped() {
    let mut fx = mk_fixture(Config::default());
    let msg = Message::new("")
        .build_router(
            "metaserver",
            modules::GROUP_RESOURCE,
            "node/edge-1/ignore/Application/ignore",
            Operation::Query,
        )
        .fill_body(&"not an application");
    fx.center.process(msg).await;
    assert!(time::timeout(time::Duration::from_millis(10), fx.hub.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn configmap_lifecycle() {
    let mut fx = mk_fixture(Config::default());

    let create = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/null",
        Verb::Create,
        vec![],
        serde_json::to_vec(&mk_cm("cm", "v1")).unwrap(),
    );
    let rsp = process(&mut fx, &create).await;
    assert_eq!(rsp.status, ApplicationStatus::Approved, "{}", rsp.reason);
    let created = serde_json::from_slice::<ConfigMap>(&rsp.resp_body).unwrap();
    assert!(created.metadata.resource_version.is_some());

    let mut update = mk_cm("cm", "v2");
    update.metadata.resource_version = created.metadata.resource_version.clone();
    let update = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/cm",
        Verb::Update,
        vec![],
        serde_json::to_vec(&update).unwrap(),
    );
    let rsp = process(&mut fx, &update).await;
    assert_eq!(rsp.status, ApplicationStatus::Approved, "{}", rsp.reason);

    // The create's version is now stale.
    let mut stale = mk_cm("cm", "v3");
    stale.metadata.resource_version = created.metadata.resource_version;
    let stale = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/cm",
        Verb::Update,
        vec![],
        serde_json::to_vec(&stale).unwrap(),
    );
    let rsp = process(&mut fx, &stale).await;
    assert_eq!(rsp.status, ApplicationStatus::Rejected);
    assert_eq!(rsp.error.unwrap().status.code, Some(409));

    let patch = PatchInfo {
        name: "cm".to_string(),
        patch_type: MERGE_PATCH.to_string(),
        data: br#"{"data":{"k":"patched"}}"#.to_vec(),
        ..Default::default()
    };
    let patch = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/cm",
        Verb::Patch,
        serde_json::to_vec(&patch).unwrap(),
        vec![],
    );
    let rsp = process(&mut fx, &patch).await;
    assert_eq!(rsp.status, ApplicationStatus::Approved, "{}", rsp.reason);
    let stored = fx
        .store
        .get_typed_object::<ConfigMap>("default", "cm")
        .unwrap();
    assert_eq!(stored.data.unwrap()["k"], "patched");

    let delete = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/cm",
        Verb::Delete,
        vec![],
        vec![],
    );
    let rsp = process(&mut fx, &delete).await;
    assert_eq!(rsp.status, ApplicationStatus::Approved, "{}", rsp.reason);
    assert!(fx
        .store
        .get_typed_object::<ConfigMap>("default", "cm")
        .is_none());
}

#[tokio::test]
async fn json_patches_are_unsupported() {
    let mut fx = mk_fixture(Config::default());
    fx.store.insert(&mk_cm("cm", "v"));
    let patch = PatchInfo {
        name: "cm".to_string(),
        patch_type: "application/json-patch+json".to_string(),
        data: br#"[{"op":"remove","path":"/data"}]"#.to_vec(),
        ..Default::default()
    };
    let app = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/cm",
        Verb::Patch,
        serde_json::to_vec(&patch).unwrap(),
        vec![],
    );
    let rsp = process(&mut fx, &app).await;
    assert_eq!(rsp.status, ApplicationStatus::Rejected);
    assert_eq!(
        rsp.reason,
        "unsupported patch type: application/json-patch+json"
    );
}

#[tokio::test]
async fn list_honors_label_selectors() {
    let mut fx = mk_fixture(Config::default());
    let mut web = mk_cm("web", "v");
    web.metadata.labels = Some(btreemap! { "app".to_string() => "web".to_string() });
    fx.store.insert(&web);
    fx.store.insert(&mk_cm("other", "v"));

    let app = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/null",
        Verb::List,
        br#"{"labelSelector":"app=web"}"#.to_vec(),
        vec![],
    );
    let rsp = process(&mut fx, &app).await;
    assert_eq!(rsp.status, ApplicationStatus::Approved, "{}", rsp.reason);
    let list = serde_json::from_slice::<serde_json::Value>(&rsp.resp_body).unwrap();
    let items = list["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["metadata"]["name"], "web");
}

#[tokio::test]
async fn list_items_are_filtered_for_the_node() {
    let filters = Filters::default()
        .with(DefaultMaster::new(10550))
        .unwrap();
    let mut fx = mk_fixture_with_filters(Config::default(), filters);
    let endpoint = |ip: &str| Endpoint {
        addresses: vec![ip.to_string()],
        ..Default::default()
    };
    fx.store.insert(&EndpointSlice {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some("kubernetes".to_string()),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: vec![endpoint("10.0.0.1"), endpoint("10.0.0.2")],
        ports: Some(vec![EndpointPort {
            name: Some("https".to_string()),
            port: Some(6443),
            ..Default::default()
        }]),
    });

    let app = Application::new(
        "edge-1",
        "/discovery.k8s.io/v1/endpointslices/default/null",
        Verb::List,
        vec![],
        vec![],
    );
    let rsp = process(&mut fx, &app).await;
    assert_eq!(rsp.status, ApplicationStatus::Approved, "{}", rsp.reason);
    let list = serde_json::from_slice::<serde_json::Value>(&rsp.resp_body).unwrap();
    let items = list["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["kind"], "EndpointSlice");
    assert_eq!(
        items[0]["endpoints"],
        serde_json::json!([{ "addresses": ["127.0.0.1"] }])
    );
    assert_eq!(items[0]["ports"][0]["port"], 10550);
}

#[tokio::test]
async fn watch_registers_a_listener() {
    let mut fx = mk_fixture(Config::default());
    let tx = fx.informers.add(
        pods_gvr(),
        pods_resource(),
        vec![mk_pod("default", "a", "edge-1", Default::default())],
    );

    let app = Application::new(
        "edge-1",
        "/core/v1/pods/default/null",
        Verb::Watch,
        br#"{"fieldSelector":"spec.nodeName=edge-1"}"#.to_vec(),
        vec![],
    );
    fx.center.process(mk_msg("edge-1", &app)).await;

    let mut pushed = Vec::new();
    let mut response = None;
    while pushed.is_empty() || response.is_none() {
        let msg = next(&mut fx.hub).await;
        match msg.operation() {
            Operation::Response => response = Some(msg),
            _ => pushed.push(msg),
        }
    }
    let rsp = response.unwrap().content_to::<Application>().unwrap();
    assert_eq!(rsp.status, ApplicationStatus::Approved);
    assert_eq!(pushed[0].resource(), "node/edge-1/default/pod/a");
    assert_eq!(pushed[0].operation(), Operation::Insert);

    let listeners = fx.center.handlers().listeners_for_node("edge-1");
    assert!(listeners.contains_key(&app.id));

    let reviews = fx.store.reviews();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].spec.user.as_deref(), Some("system:node:edge-1"));
    let attrs = reviews[0].spec.resource_attributes.clone().unwrap();
    assert_eq!(attrs.verb.as_deref(), Some("watch"));
    assert_eq!(attrs.resource.as_deref(), Some("pods"));
    assert_eq!(attrs.name, None);

    tx.unbounded_send(Event::Apply(mk_pod("default", "b", "edge-2", Default::default())))
        .unwrap();
    tx.unbounded_send(Event::Apply(mk_pod("default", "c", "edge-1", Default::default())))
        .unwrap();
    assert_eq!(next(&mut fx.hub).await.resource(), "node/edge-1/default/pod/c");
}

#[tokio::test]
async fn denied_watches_are_forbidden() {
    let mut fx = mk_fixture(Config::default());
    fx.informers.add(pods_gvr(), pods_resource(), vec![]);
    fx.store.allow("system:node:edge-1", false);

    let app = Application::new("edge-1", "/core/v1/pods/null/null", Verb::Watch, vec![], vec![]);
    let rsp = process(&mut fx, &app).await;
    assert_eq!(rsp.status, ApplicationStatus::Rejected);
    let status = rsp.error.unwrap().status;
    assert_eq!(status.code, Some(403));
    assert_eq!(status.reason.as_deref(), Some("Forbidden"));
    assert!(fx.center.handlers().listeners().is_empty());
}

#[tokio::test]
async fn watch_sync_reconciles_listeners() {
    let mut fx = mk_fixture(Config::default());
    fx.informers.add(pods_gvr(), pods_resource(), vec![]);

    let pods = Application::new("edge-1", "/core/v1/pods/null/null", Verb::Watch, vec![], vec![]);
    let deployments = Application::new(
        "edge-1",
        "/apps/v1/deployments/null/null",
        Verb::Watch,
        vec![],
        vec![],
    );
    let held = btreemap! {
        pods.id.clone() => pods.clone(),
        deployments.id.clone() => deployments.clone(),
    };

    fx.center.process(mk_sync("edge-1", &held)).await;
    let rsp = next_response(&mut fx.hub).await;
    let rejected = rsp.content_to::<BTreeMap<String, String>>().unwrap();
    assert_eq!(rejected.keys().collect::<Vec<_>>(), vec![&deployments.id]);
    assert!(rejected[&deployments.id].contains("failed to start informer"));

    let listeners = fx.center.handlers().listeners_for_node("edge-1");
    assert_eq!(listeners.keys().collect::<Vec<_>>(), vec![&pods.id]);

    // Syncing the same watches again changes nothing.
    fx.center.process(mk_sync("edge-1", &held)).await;
    next_response(&mut fx.hub).await;
    let again = fx.center.handlers().listeners_for_node("edge-1");
    assert_eq!(again, listeners);
    assert_eq!(fx.center.handlers().listeners().len(), 1);

    // Watches the node no longer holds are removed.
    fx.center.process(mk_sync("edge-1", &BTreeMap::new())).await;
    let rsp = next_response(&mut fx.hub).await;
    assert!(rsp
        .content_to::<BTreeMap<String, String>>()
        .unwrap()
        .is_empty());
    assert!(fx.center.handlers().listeners().is_empty());
}

#[test]
fn expired_watches_report_gone() {
    let error = CenterError::Handler(HandlerError::Expired(WatchCacheError::ResourceExpired {
        requested: 3,
        oldest: 5,
    }));
    let status = error.api_status().unwrap();
    assert_eq!(status.code, Some(410));
    assert_eq!(status.reason.as_deref(), Some("Expired"));
    assert_eq!(
        status.message.as_deref(),
        Some("too old resource version: 3 (5)")
    );
}

#[tokio::test]
async fn spawned_center_answers_until_drained() {
    let Fixture {
        center,
        store,
        mut hub,
        drain,
        _signal: signal,
        ..
    } = mk_fixture(Config::default());
    store.insert(&mk_cm("web", "v"));
    let bus = center.inner.messages.bus().clone();
    let inbox = bus
        .register(
            modules::DYNAMIC_CONTROLLER,
            modules::GROUP_DYNAMIC_CONTROLLER,
            8,
        )
        .unwrap();
    let task = center.spawn(inbox, drain);

    let app = Application::new(
        "edge-1",
        "/core/v1/configmaps/default/web",
        Verb::Get,
        vec![],
        vec![],
    );
    bus.send(modules::DYNAMIC_CONTROLLER, mk_msg("edge-1", &app))
        .await
        .unwrap();
    let rsp = next_response(&mut hub).await;
    assert_eq!(rsp.parent_id(), app.id);

    time::timeout(time::Duration::from_secs(1), signal.drain())
        .await
        .expect("center must release the shutdown handle");
    task.await.unwrap();
}
