// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Per-service node map and its watch loop.

use super::{ResolveError, ResolvedState, UpdateSink};
use crate::config::WatchConfig;
use crate::net::Address;
use crate::registry::{Action, Registry, RegistryError, Service, WatchEvent, WatchOptions, Watcher};
use faststr::FastStr;
use governor::{DefaultDirectRateLimiter, RateLimiter};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// No snapshot has been fetched yet, or the last attempt failed.
    Uninitialized,
    /// The initial snapshot is being fetched.
    Loading,
    /// The watch loop is consuming events.
    Watching,
    /// The last `next` call failed; the loop retries on the same watch handle.
    Retrying,
    /// The watch stream ended; the last-known nodes stay in effect.
    Stopped,
}

/// Version-partitioned nodes of one service name, shared by all resolvers of that name.
pub(crate) struct ServiceState {
    name: FastStr,
    // Held across the initial fetch so only one attach loads a given service.
    loading: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

struct Inner {
    status: ServiceStatus,
    watching: bool,
    nodes: BTreeMap<String, Vec<Address>>,
    attachments: BTreeMap<u64, Attachment>,
    next_index: u64,
}

struct Attachment {
    versions: Arc<[FastStr]>,
    sink: Arc<dyn UpdateSink>,
}

impl Inner {
    fn publish(&self) {
        for attachment in self.attachments.values() {
            attachment.sink.update_state(ResolvedState {
                addresses: select(&self.nodes, &attachment.versions),
            });
        }
    }
}

impl ServiceState {
    pub(crate) fn new(name: FastStr) -> Self {
        Self {
            name,
            loading: Default::default(),
            inner: Mutex::new(Inner {
                status: ServiceStatus::Uninitialized,
                watching: false,
                nodes: Default::default(),
                attachments: Default::default(),
                next_index: 0,
            }),
        }
    }

    pub(crate) fn name(&self) -> &FastStr {
        &self.name
    }

    pub(crate) fn status(&self) -> ServiceStatus {
        self.inner.lock().status
    }

    pub(crate) fn attached(&self) -> usize {
        self.inner.lock().attachments.len()
    }

    fn is_watching(&self) -> bool {
        self.inner.lock().watching
    }

    fn set_status(&self, status: ServiceStatus) {
        self.inner.lock().status = status;
    }

    /// Opens the watch, fetches the initial snapshot and starts the watch loop, once per state.
    ///
    /// The watch is opened first so changes made during the fetch are queued and replayed over
    /// the snapshot. A failure, or dropping the returned future, leaves the state uninitialized
    /// and a later attach loads it again.
    pub(crate) async fn ensure_loaded<R: Registry>(self: &Arc<Self>, registry: &R, config: &WatchConfig) -> Result<(), ResolveError> {
        if self.is_watching() {
            return Ok(());
        }
        let _loading = self.loading.lock().await;
        if self.is_watching() {
            return Ok(());
        }
        let quota = config.quota()?;
        let guard = LoadingGuard::new(self);
        let loaded = async {
            let watcher = with_timeout(config.fetch_timeout, "watch", registry.watch(WatchOptions::service(self.name.as_str()))).await?;
            let services = with_timeout(config.fetch_timeout, "get_service", registry.get_service(&self.name)).await?;
            Ok::<_, RegistryError>((services, watcher))
        }
        .await;
        let (services, watcher) = loaded?;
        guard.disarm();
        self.start(services);
        tokio::spawn(watch_loop(self.clone(), watcher, RateLimiter::direct(quota)));
        Ok(())
    }

    fn start(&self, services: Vec<Service>) {
        let mut inner = self.inner.lock();
        for service in services {
            let mut nodes = Vec::with_capacity(service.nodes.len());
            for node in &service.nodes {
                push_unique(&mut nodes, Address::from(node));
            }
            inner.nodes.insert(service.version, nodes);
        }
        inner.watching = true;
        inner.status = ServiceStatus::Watching;
        inner.publish();
    }

    /// Registers a sink, delivering the current filtered address set before returning.
    pub(crate) fn attach(&self, versions: Arc<[FastStr]>, sink: Arc<dyn UpdateSink>) -> u64 {
        let mut inner = self.inner.lock();
        let index = inner.next_index;
        inner.next_index += 1;
        sink.update_state(ResolvedState {
            addresses: select(&inner.nodes, &versions),
        });
        inner.attachments.insert(index, Attachment { versions, sink });
        index
    }

    pub(crate) fn detach(&self, index: u64) {
        self.inner.lock().attachments.remove(&index);
    }

    pub(crate) fn addresses(&self, versions: &[FastStr]) -> Vec<Address> {
        select(&self.inner.lock().nodes, versions)
    }

    /// Applies one event and pushes the result to every attachment.
    pub(crate) fn apply(&self, event: &WatchEvent) -> Result<(), ResolveError> {
        if event.service.name != self.name.as_str() {
            debug!("[MESHLINK] service {} ignores event of {}", self.name, event.service.name);
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.status = ServiceStatus::Watching;
        process(&mut inner.nodes, event)?;
        inner.publish();
        Ok(())
    }
}

/// Marks a state as loading and resets it to uninitialized unless disarmed.
struct LoadingGuard<'a> {
    state: &'a ServiceState,
    armed: bool,
}

impl<'a> LoadingGuard<'a> {
    fn new(state: &'a ServiceState) -> Self {
        state.set_status(ServiceStatus::Loading);
        Self { state, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.set_status(ServiceStatus::Uninitialized);
        }
    }
}

async fn with_timeout<T>(timeout: Duration, call: &'static str, fut: impl Future<Output = Result<T, RegistryError>>) -> Result<T, RegistryError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::Unavailable(FastStr::from_string(format!("{call} timed out after {timeout:?}")))),
    }
}

async fn watch_loop<W: Watcher>(state: Arc<ServiceState>, mut watcher: W, limiter: DefaultDirectRateLimiter) {
    info!("[MESHLINK] watching service {}", state.name());
    loop {
        limiter.until_ready().await;
        match watcher.next().await {
            Ok(event) => {
                if let Err(e) = state.apply(&event) {
                    warn!("[MESHLINK] service {} skips event: {}", state.name(), e);
                }
            },
            Err(e) if e.is_terminal() => {
                state.set_status(ServiceStatus::Stopped);
                watcher.stop();
                warn!("[MESHLINK] service {} watch stopped, keeping last known nodes", state.name());
                return;
            },
            Err(e) => {
                state.set_status(ServiceStatus::Retrying);
                warn!("[MESHLINK] service {} watch error: {}", state.name(), e);
            },
        }
    }
}

/// Applies `event` to the version map.
///
/// `create` and `update` merge: addresses the version already had are kept after the event's
/// nodes. `delete` removes only the listed addresses.
pub(crate) fn process(nodes: &mut BTreeMap<String, Vec<Address>>, event: &WatchEvent) -> Result<(), ResolveError> {
    let version = &event.service.version;
    match &event.action {
        Action::Create | Action::Update => {
            let mut next = Vec::with_capacity(event.service.nodes.len());
            for node in &event.service.nodes {
                push_unique(&mut next, Address::from(node));
            }
            if let Some(prev) = nodes.get(version) {
                for address in prev {
                    push_unique(&mut next, address.clone());
                }
            }
            nodes.insert(version.clone(), next);
            Ok(())
        },
        Action::Delete => {
            if let Some(current) = nodes.get_mut(version) {
                current.retain(|address| !event.service.nodes.iter().any(|n| n.address == address.addr()));
            }
            Ok(())
        },
        Action::Other(action) => Err(ResolveError::UnsupportedAction(FastStr::new(action))),
    }
}

/// Addresses of the requested versions, or of every version when none is requested.
fn select(nodes: &BTreeMap<String, Vec<Address>>, versions: &[FastStr]) -> Vec<Address> {
    let mut selected = Vec::new();
    if versions.is_empty() {
        for address in nodes.values().flatten() {
            push_unique(&mut selected, address.clone());
        }
    } else {
        for address in versions.iter().filter_map(|v| nodes.get(v.as_str())).flatten() {
            push_unique(&mut selected, address.clone());
        }
    }
    selected
}

fn push_unique(list: &mut Vec<Address>, address: Address) {
    if !list.contains(&address) {
        list.push(address);
    }
}
