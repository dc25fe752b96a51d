use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use meshkit_core::{SelectStream, ServerOptions};
use meshkit_memory::{MemoryMesh, MemoryRegistry, MemoryTransport};
use meshkit_types::Service;

use super::*;

fn service_with(nodes: &[&str]) -> Service {
    let mut svc = Service::new("greeter", "v1");
    for id in nodes {
        svc.nodes.push(Node::new(*id, format!("{id}:8080")));
    }
    svc
}

fn reply_with(nodes: &[&str], expires: i64) -> SelectReply {
    SelectReply { services: vec![service_with(nodes)], expires }
}

struct MockApi {
    calls: AtomicUsize,
    failing: AtomicBool,
    reply: std::sync::Mutex<SelectReply>,
    stream_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SelectReply>>>,
}

impl MockApi {
    fn new(reply: SelectReply) -> (Arc<Self>, mpsc::UnboundedSender<SelectReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let api = Arc::new(Self {
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            reply: std::sync::Mutex::new(reply),
            stream_rx: std::sync::Mutex::new(Some(rx)),
        });
        (api, tx)
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<SelectReply>,
}

#[async_trait]
impl SelectStream for MockStream {
    async fn next(&mut self) -> Result<SelectReply> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::Watch("stream closed".into()))
    }
}

#[async_trait]
impl RouterApi for MockApi {
    async fn select(&self, _service: &str) -> Result<SelectReply> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transport("router down".into()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.lock().unwrap().clone())
    }

    async fn select_stream(&self, _service: &str) -> Result<Box<dyn SelectStream>> {
        match self.stream_rx.lock().unwrap().take() {
            Some(rx) => Ok(Box::new(MockStream { rx })),
            None => Err(Error::NotAvailable),
        }
    }
}

fn transport(mesh: &MemoryMesh) -> MemoryTransport {
    mesh.join(ServerOptions {
        name: "host".into(),
        address: "10.0.0.1:8080".into(),
        ..ServerOptions::default()
    })
}

fn router_with(
    mesh: &MemoryMesh,
    registry: Arc<MemoryRegistry>,
    api: Option<Arc<dyn RouterApi>>,
    config: RouterConfig,
) -> Router {
    Router::new(registry, Arc::new(transport(mesh)), api, config)
}

async fn eventually(what: &str, mut check: impl AsyncFnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check().await {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn select_caches_the_routing_decision() {
    let mesh = MemoryMesh::new();
    let (api, _stream_tx) = MockApi::new(reply_with(&["n1", "n2"], -1));
    let router = router_with(
        &mesh,
        Arc::new(MemoryRegistry::new()),
        Some(api.clone() as Arc<dyn RouterApi>),
        RouterConfig::default(),
    );

    let next = router
        .select("greeter", SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(api.calls.load(Ordering::SeqCst), 1);

    // Round-robin over the cached node set.
    let picks: Vec<String> = (0..4).map(|_| next.next().unwrap().id).collect();
    assert_eq!(picks, ["n1", "n2", "n1", "n2"]);

    // Second select is answered from the cache.
    router
        .select("greeter", SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(api.calls.load(Ordering::SeqCst), 1);

    // An expired entry forces a fresh RPC.
    router
        .state
        .cache
        .write()
        .unwrap()
        .get_mut("greeter")
        .unwrap()
        .expires = unix_seconds() - 1;
    router
        .select("greeter", SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(api.calls.load(Ordering::SeqCst), 2);

    router.stop().await.unwrap();
}

#[tokio::test]
async fn stream_update_replaces_the_cache_and_drops_stats() {
    let mesh = MemoryMesh::new();
    let (api, stream_tx) = MockApi::new(reply_with(&["n1", "n2"], -1));
    let router = router_with(
        &mesh,
        Arc::new(MemoryRegistry::new()),
        Some(api as Arc<dyn RouterApi>),
        RouterConfig::default(),
    );

    router
        .select("greeter", SelectOptions::default())
        .await
        .unwrap();

    // Both nodes have stats records after the install.
    {
        let stats = router.state.stats.read().unwrap();
        assert!(stats.contains_key("n1"));
        assert!(stats.contains_key("n2"));
    }

    // A live update drops n1 from the snapshot.
    stream_tx.send(reply_with(&["n2"], -1)).unwrap();

    eventually("the update to land", async || {
        !router.state.stats.read().unwrap().contains_key("n1")
    })
    .await;

    let next = router
        .select("greeter", SelectOptions::default())
        .await
        .unwrap();
    for _ in 0..3 {
        assert_eq!(next.next().unwrap().id, "n2");
    }
    assert!(router.state.stats.read().unwrap().contains_key("n2"));

    router.stop().await.unwrap();
}

#[tokio::test]
async fn missing_router_service_falls_back_to_the_registry() {
    let mesh = MemoryMesh::new();
    let registry = Arc::new(MemoryRegistry::new());
    registry.register(&service_with(&["n1"])).await.unwrap();

    let router = router_with(&mesh, registry, None, RouterConfig::default());
    let next = router
        .select("greeter", SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(next.next().unwrap().id, "n1");
}

#[tokio::test]
async fn failing_router_service_falls_back_to_the_registry() {
    let mesh = MemoryMesh::new();
    let registry = Arc::new(MemoryRegistry::new());
    registry.register(&service_with(&["n1"])).await.unwrap();

    let (api, _stream_tx) = MockApi::new(reply_with(&["ignored"], -1));
    api.failing.store(true, Ordering::SeqCst);

    let router = router_with(
        &mesh,
        registry,
        Some(api as Arc<dyn RouterApi>),
        RouterConfig::default(),
    );
    let next = router
        .select("greeter", SelectOptions::default())
        .await
        .unwrap();
    assert_eq!(next.next().unwrap().id, "n1");
}

#[tokio::test]
async fn reset_zeroes_every_record_of_the_service() {
    let mesh = MemoryMesh::new();
    let router = router_with(
        &mesh,
        Arc::new(MemoryRegistry::new()),
        None,
        RouterConfig::default(),
    );

    let req = Request::new("greeter", "Greeter.Hello", &serde_json::json!({})).unwrap();
    let other = Request::new("billing", "Billing.Charge", &serde_json::json!({})).unwrap();
    let n1 = Node::new("n1", "n1:8080");
    let n2 = Node::new("n2", "n2:8080");
    let b1 = Node::new("b1", "b1:8080");

    router.record(&req, &n1, Duration::from_millis(3), None);
    router.record(&req, &n2, Duration::from_millis(5), Some(&Error::NotAvailable));
    router.record(&other, &b1, Duration::from_millis(7), None);

    router.reset("greeter").await;

    let stats = router.state.stats.read().unwrap();
    for id in ["n1", "n2"] {
        let record = &stats[id];
        assert_eq!(record.calls, 0);
        assert_eq!(record.errors, 0);
        assert_eq!(record.latency_micros, 0);
        assert!(record.methods.is_empty());
    }
    assert_eq!(stats["b1"].calls, 1);
}

#[tokio::test]
async fn stats_publish_then_reset() {
    let mesh = MemoryMesh::new();
    let router = router_with(
        &mesh,
        Arc::new(MemoryRegistry::new()),
        None,
        RouterConfig {
            publish_interval: Duration::from_millis(20),
            ..RouterConfig::default()
        },
    );
    router.start().unwrap();

    let req = Request::new("greeter", "Greeter.Hello", &serde_json::json!({})).unwrap();
    let node = Node::new("n1", "n1:8080");
    router.record(&req, &node, Duration::from_millis(3), None);
    router.record(&req, &node, Duration::from_millis(4), Some(&Error::NotAvailable));

    eventually("a stats batch to publish", async || {
        !mesh.published(STATS_TOPIC).is_empty()
    })
    .await;

    let batch = mesh.published(STATS_TOPIC);
    let message: StatsMessage = serde_json::from_value(batch[0].clone()).unwrap();
    assert_eq!(message.service, "greeter");
    assert_eq!(message.node_id, "n1");
    assert_eq!(message.calls, 2);
    assert_eq!(message.errors, 1);
    assert_eq!(message.latency_micros, 7_000);
    assert_eq!(message.methods["Greeter.Hello"].total(), 2);

    // The record was reset with the snapshot; an idle record does not
    // publish again.
    eventually("the record to be reset", async || {
        router.state.stats.read().unwrap()["n1"].is_idle()
    })
    .await;
    let count = mesh.published(STATS_TOPIC).len();
    sleep(Duration::from_millis(80)).await;
    assert_eq!(mesh.published(STATS_TOPIC).len(), count);

    router.stop().await.unwrap();
}

#[tokio::test]
async fn mark_counts_errors_and_benches_via_the_fallback() {
    let mesh = MemoryMesh::new();
    let registry = Arc::new(MemoryRegistry::new());
    registry.register(&service_with(&["n1", "n2"])).await.unwrap();

    let router = router_with(&mesh, registry, None, RouterConfig::default());
    let bad = Node::new("n1", "n1:8080");

    for _ in 0..3 {
        router.mark("greeter", &bad, Some(&Error::NotAvailable)).await;
    }

    assert_eq!(router.state.stats.read().unwrap()["n1"].errors, 3);

    let next = router
        .select("greeter", SelectOptions::default())
        .await
        .unwrap();
    for _ in 0..4 {
        assert_eq!(next.next().unwrap().id, "n2");
    }
}

#[tokio::test]
async fn close_terminates_and_clears() {
    let mesh = MemoryMesh::new();
    let (api, _stream_tx) = MockApi::new(reply_with(&["n1"], -1));
    let router = router_with(
        &mesh,
        Arc::new(MemoryRegistry::new()),
        Some(api as Arc<dyn RouterApi>),
        RouterConfig::default(),
    );
    router.start().unwrap();

    router
        .select("greeter", SelectOptions::default())
        .await
        .unwrap();
    router.close().await;

    assert!(router.state.cache.read().unwrap().is_empty());
    assert!(router.state.stats.read().unwrap().is_empty());
}
