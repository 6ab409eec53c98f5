// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use assert_matches::assert_matches;
use meshlink::registry::{new_target, Action, MemoryWatcher, Node, Registry, RegistryError, Service, WatchEvent, WatchOptions, Watcher};
use meshlink::resolver::ServiceStatus;
use meshlink::{MemoryRegistry, ResolveError, ResolvedState, ResolverBuilder, WatchConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
}

fn service(version: &str, addrs: &[&str]) -> Service {
    addrs
        .iter()
        .fold(Service::new("orders", version), |s, a| s.with_node(Node::new(format!("orders-{a}"), *a)))
}

fn sorted(state: &ResolvedState) -> Vec<String> {
    let mut addrs: Vec<String> = state.addresses.iter().map(|a| a.addr().to_string()).collect();
    addrs.sort();
    addrs
}

fn watch_config() -> WatchConfig {
    WatchConfig::default().with_burst(1000).with_interval(Duration::from_millis(1))
}

async fn changed(rx: &mut watch::Receiver<ResolvedState>) -> Vec<String> {
    tokio::time::timeout(WAIT, rx.changed()).await.expect("no update in time").unwrap();
    sorted(&rx.borrow_and_update())
}

async fn wait_for(rx: &mut watch::Receiver<ResolvedState>, expected: &[&str]) {
    tokio::time::timeout(WAIT, async {
        while sorted(&rx.borrow_and_update()) != expected {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("addresses not resolved in time");
}

async fn wait_status<R: Registry>(builder: &ResolverBuilder<R>, name: &str, status: ServiceStatus) {
    tokio::time::timeout(WAIT, async {
        while builder.status(name) != Some(status) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("status not reached in time");
}

#[tokio::test]
async fn test_version_filtered_resolvers() {
    init_tracing();
    let registry = Arc::new(MemoryRegistry::new());
    registry.register(&service("1.0", &["n1", "n2"]), Duration::ZERO).await.unwrap();
    registry.register(&service("1.1", &["n3"]), Duration::ZERO).await.unwrap();
    let builder = ResolverBuilder::with_config(registry.clone(), watch_config()).unwrap();

    let (tx_a, mut rx_a) = watch::channel(ResolvedState::default());
    let a = builder.build(&new_target("orders", Some("1.1")), tx_a).await.unwrap();
    assert_eq!(sorted(&rx_a.borrow_and_update()), vec!["n3"]);

    let (tx_b, mut rx_b) = watch::channel(ResolvedState::default());
    let _b = builder.build(&new_target("orders", None), tx_b).await.unwrap();
    assert_eq!(sorted(&rx_b.borrow_and_update()), vec!["n1", "n2", "n3"]);

    registry.register(&service("1.1", &["n4"]), Duration::ZERO).await.unwrap();
    assert_eq!(changed(&mut rx_a).await, vec!["n3", "n4"]);
    assert_eq!(changed(&mut rx_b).await, vec!["n1", "n2", "n3", "n4"]);

    registry.deregister(&service("1.0", &["n1"])).await.unwrap();
    assert_eq!(changed(&mut rx_b).await, vec!["n2", "n3", "n4"]);
    // Every attachment is pushed on each event, with its own filter applied.
    assert_eq!(changed(&mut rx_a).await, vec!["n3", "n4"]);

    a.close();
    registry.register(&service("1.1", &["n5"]), Duration::ZERO).await.unwrap();
    assert_eq!(changed(&mut rx_b).await, vec!["n2", "n3", "n4", "n5"]);
    assert!(!rx_a.has_changed().unwrap());
    assert_eq!(builder.attached("orders"), 1);
}

#[tokio::test]
async fn test_late_build_sees_current_set() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.register(&service("1.0", &["n1"]), Duration::ZERO).await.unwrap();
    let builder = ResolverBuilder::with_config(registry.clone(), watch_config()).unwrap();

    let (tx, mut rx) = watch::channel(ResolvedState::default());
    let _first = builder.build("registry:///orders", tx).await.unwrap();
    registry.register(&service("1.0", &["n2"]), Duration::ZERO).await.unwrap();
    assert_eq!(changed(&mut rx).await, vec!["n1", "n2"]);

    let (tx, rx) = watch::channel(ResolvedState::default());
    let late = builder.build("registry:///orders?version=1.0", tx).await.unwrap();
    assert_eq!(sorted(&rx.borrow()), vec!["n1", "n2"]);
    assert_eq!(late.addresses().len(), 2);
}

#[tokio::test]
async fn test_moved_node_replaces_address() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.register(&service("1.0", &["n1", "n2"]), Duration::ZERO).await.unwrap();
    let builder = ResolverBuilder::with_config(registry.clone(), watch_config()).unwrap();
    let (tx, mut rx) = watch::channel(ResolvedState::default());
    let _resolver = builder.build("registry:///orders", tx).await.unwrap();

    let moved = Service::new("orders", "1.0").with_node(Node::new("orders-n1", "n9"));
    registry.register(&moved, Duration::ZERO).await.unwrap();
    wait_for(&mut rx, &["n2", "n9"]).await;
}

/// Memory registry that gains a node right after serving a snapshot.
struct LateRegistration {
    inner: MemoryRegistry,
}

impl Registry for LateRegistration {
    type Watcher = MemoryWatcher;

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
        let snapshot = self.inner.get_service(name).await?;
        self.inner.register(&service("1.0", &["n2"]), Duration::ZERO).await?;
        Ok(snapshot)
    }

    async fn list_services(&self) -> Result<Vec<Service>, RegistryError> {
        self.inner.list_services().await
    }

    async fn watch(&self, options: WatchOptions) -> Result<Self::Watcher, RegistryError> {
        self.inner.watch(options).await
    }

    async fn register(&self, service: &Service, ttl: Duration) -> Result<(), RegistryError> {
        self.inner.register(service, ttl).await
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        self.inner.deregister(service).await
    }
}

#[tokio::test]
async fn test_registration_during_snapshot_is_kept() {
    init_tracing();
    let inner = MemoryRegistry::new();
    inner.register(&service("1.0", &["n1"]), Duration::ZERO).await.unwrap();
    let registry = Arc::new(LateRegistration { inner });
    let builder = ResolverBuilder::with_config(registry.clone(), watch_config()).unwrap();

    let (tx, mut rx) = watch::channel(ResolvedState::default());
    let resolver = builder.build("registry:///orders", tx).await.unwrap();
    wait_for(&mut rx, &["n1", "n2"]).await;
    assert_eq!(resolver.addresses().len(), 2);
}

/// Registry whose watch stream is fed by the test.
struct ScriptedRegistry {
    snapshot: Vec<Service>,
    fetch_delay: Duration,
    fetches: AtomicUsize,
    watches: AtomicUsize,
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<WatchEvent, RegistryError>>>>,
}

impl ScriptedRegistry {
    fn new(snapshot: Vec<Service>, fetch_delay: Duration) -> (Arc<Self>, mpsc::UnboundedSender<Result<WatchEvent, RegistryError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            snapshot,
            fetch_delay,
            fetches: AtomicUsize::new(0),
            watches: AtomicUsize::new(0),
            events: Mutex::new(Some(rx)),
        };
        (Arc::new(registry), tx)
    }
}

struct ScriptedWatcher {
    events: mpsc::UnboundedReceiver<Result<WatchEvent, RegistryError>>,
}

impl Watcher for ScriptedWatcher {
    async fn next(&mut self) -> Result<WatchEvent, RegistryError> {
        self.events.recv().await.unwrap_or(Err(RegistryError::WatcherStopped))
    }

    fn stop(&mut self) {
        self.events.close();
    }
}

impl Registry for ScriptedRegistry {
    type Watcher = ScriptedWatcher;

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.fetch_delay).await;
        let found: Vec<Service> = self.snapshot.iter().filter(|s| s.name == name).cloned().collect();
        if found.is_empty() {
            return Err(RegistryError::NotFound(name.to_string().into()));
        }
        Ok(found)
    }

    async fn list_services(&self) -> Result<Vec<Service>, RegistryError> {
        Ok(self.snapshot.clone())
    }

    async fn watch(&self, _options: WatchOptions) -> Result<Self::Watcher, RegistryError> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        let events = self.events.lock().take();
        events
            .map(|events| ScriptedWatcher { events })
            .ok_or_else(|| RegistryError::Unavailable("watch already taken".into()))
    }

    async fn register(&self, _service: &Service, _ttl: Duration) -> Result<(), RegistryError> {
        Err(RegistryError::Unavailable("read-only".into()))
    }

    async fn deregister(&self, _service: &Service) -> Result<(), RegistryError> {
        Err(RegistryError::Unavailable("read-only".into()))
    }
}

#[tokio::test]
async fn test_concurrent_builds_share_one_watch_loop() {
    let (registry, _events) = ScriptedRegistry::new(vec![service("1.0", &["n1"])], Duration::from_millis(50));
    let builder = Arc::new(ResolverBuilder::with_config(registry.clone(), watch_config()).unwrap());

    let builds = (0..8).map(|_| {
        let builder = builder.clone();
        tokio::spawn(async move {
            let (tx, rx) = watch::channel(ResolvedState::default());
            let resolver = builder.build("registry:///orders", tx).await.unwrap();
            let addrs = sorted(&rx.borrow());
            (resolver, addrs)
        })
    });
    let resolvers = futures::future::join_all(builds).await;
    for result in &resolvers {
        let (_, addrs) = result.as_ref().unwrap();
        assert_eq!(addrs, &vec!["n1".to_string()]);
    }
    assert_eq!(registry.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(registry.watches.load(Ordering::SeqCst), 1);
    assert_eq!(builder.attached("orders"), 8);

    drop(resolvers);
    assert_eq!(builder.attached("orders"), 0);
    assert_eq!(builder.status("orders"), Some(ServiceStatus::Watching));
}

#[tokio::test]
async fn test_transient_errors_and_bad_events_are_skipped() {
    init_tracing();
    let (registry, events) = ScriptedRegistry::new(vec![service("1.0", &["n1"])], Duration::ZERO);
    let builder = ResolverBuilder::with_config(registry, watch_config()).unwrap();
    let (tx, mut rx) = watch::channel(ResolvedState::default());
    let _resolver = builder.build("registry:///orders", tx).await.unwrap();
    rx.borrow_and_update();

    events.send(Err(RegistryError::Watch("connection reset".into()))).unwrap();
    wait_status(&builder, "orders", ServiceStatus::Retrying).await;

    events.send(Ok(WatchEvent::new(Action::Other("rename".into()), service("1.0", &["x"])))).unwrap();
    let mut other = service("1.0", &["y"]);
    other.name = "payments".into();
    events.send(Ok(WatchEvent::new(Action::Create, other))).unwrap();
    events.send(Ok(WatchEvent::new(Action::Update, service("1.0", &["n2"])))).unwrap();

    assert_eq!(changed(&mut rx).await, vec!["n1", "n2"]);
    assert_eq!(builder.status("orders"), Some(ServiceStatus::Watching));
}

#[tokio::test]
async fn test_stopped_watch_keeps_last_known_nodes() {
    let (registry, events) = ScriptedRegistry::new(vec![service("1.0", &["n1"])], Duration::ZERO);
    let builder = ResolverBuilder::with_config(registry.clone(), watch_config()).unwrap();
    let (tx, mut rx) = watch::channel(ResolvedState::default());
    let _resolver = builder.build("registry:///orders", tx).await.unwrap();

    events.send(Ok(WatchEvent::new(Action::Update, service("1.0", &["n2"])))).unwrap();
    assert_eq!(changed(&mut rx).await, vec!["n1", "n2"]);

    drop(events);
    wait_status(&builder, "orders", ServiceStatus::Stopped).await;

    let (tx, rx) = watch::channel(ResolvedState::default());
    let late = builder.build("registry:///orders", tx).await.unwrap();
    assert_eq!(sorted(&rx.borrow()), vec!["n1", "n2"]);
    assert_eq!(late.addresses().len(), 2);
    assert_eq!(registry.watches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_service_is_not_found() {
    let (registry, _events) = ScriptedRegistry::new(Vec::new(), Duration::ZERO);
    let builder = ResolverBuilder::new(registry);
    let (tx, _rx) = watch::channel(ResolvedState::default());
    let result = builder.build("registry:///orders", tx).await;
    assert_matches!(result.err(), Some(ResolveError::Registry(RegistryError::NotFound(_))));
    assert_eq!(builder.attached("orders"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_registry_times_out() {
    let (registry, _events) = ScriptedRegistry::new(vec![service("1.0", &["n1"])], Duration::from_secs(60));
    let config = WatchConfig::default().with_fetch_timeout(Duration::from_secs(1));
    let builder = ResolverBuilder::with_config(registry, config).unwrap();
    let (tx, _rx) = watch::channel(ResolvedState::default());
    let result = builder.build("registry:///orders", tx).await;
    assert_matches!(result.err(), Some(ResolveError::Registry(RegistryError::Unavailable(_))));
    assert_eq!(builder.status("orders"), Some(ServiceStatus::Uninitialized));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_build_resets_loading() {
    let (registry, _events) = ScriptedRegistry::new(vec![service("1.0", &["n1"])], Duration::from_secs(60));
    let builder = ResolverBuilder::new(registry);
    let (tx, _rx) = watch::channel(ResolvedState::default());

    let mut build = Box::pin(builder.build("registry:///orders", tx));
    assert!(tokio::time::timeout(Duration::from_millis(500), &mut build).await.is_err());
    assert_eq!(builder.status("orders"), Some(ServiceStatus::Loading));

    drop(build);
    assert_eq!(builder.status("orders"), Some(ServiceStatus::Uninitialized));
    assert_eq!(builder.attached("orders"), 0);
}

#[tokio::test]
async fn test_watch_loop_is_rate_limited() {
    let interval = Duration::from_millis(100);
    let (registry, events) = ScriptedRegistry::new(vec![service("1.0", &["n1"])], Duration::ZERO);
    let config = WatchConfig::default().with_interval(interval).with_burst(1);
    let builder = ResolverBuilder::with_config(registry, config).unwrap();

    let started = std::time::Instant::now();
    let (tx, mut rx) = watch::channel(ResolvedState::default());
    let _resolver = builder.build("registry:///orders", tx).await.unwrap();
    for addr in ["n2", "n3", "n4", "n5"] {
        events.send(Ok(WatchEvent::new(Action::Update, service("1.0", &[addr])))).unwrap();
    }
    wait_for(&mut rx, &["n1", "n2", "n3", "n4", "n5"]).await;

    // one token per event after the first; the limiter clock is not tokio's
    assert!(started.elapsed() >= interval * 3 - Duration::from_millis(10), "elapsed {:?}", started.elapsed());
}
