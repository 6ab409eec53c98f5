// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! In-process registry.

use super::{Action, Registry, RegistryError, Service, WatchEvent, WatchOptions, Watcher};
use async_broadcast::{broadcast, InactiveReceiver, Receiver, RecvError, Sender};
use faststr::FastStr;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// [`MemoryRegistry`] keeps services in process memory and broadcasts every change to its watchers.
///
/// Clones share the same state. Dropping the last clone closes all watchers.
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    services: RwLock<BTreeMap<String, BTreeMap<String, Record>>>,
    events: Sender<WatchEvent>,
    _keepalive: InactiveReceiver<WatchEvent>,
}

struct Record {
    service: Service,
    expires: Vec<Option<Instant>>,
}

impl Record {
    fn live(&self, now: Instant) -> Service {
        let mut service = self.service.clone();
        service.nodes = self
            .service
            .nodes
            .iter()
            .zip(&self.expires)
            .filter(|(_, expires)| expires.map_or(true, |at| at > now))
            .map(|(node, _)| node.clone())
            .collect();
        service
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates an empty registry whose watchers buffer up to `capacity` events.
    ///
    /// A watcher that falls further behind loses the oldest events and gets a transient error.
    pub fn with_capacity(capacity: usize) -> Self {
        let (mut events, receiver) = broadcast(capacity.max(1));
        events.set_overflow(true);
        events.set_await_active(false);
        Self {
            inner: Arc::new(Inner {
                services: Default::default(),
                events,
                _keepalive: receiver.deactivate(),
            }),
        }
    }

    /// Removes nodes whose registration ttl has elapsed and broadcasts a `delete` per version.
    ///
    /// Returns the number of removed nodes.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut services = self.inner.services.write();
            for versions in services.values_mut() {
                for record in versions.values_mut() {
                    let mut removed = Service::new(record.service.name.clone(), record.service.version.clone());
                    let mut i = 0;
                    while i < record.expires.len() {
                        if record.expires[i].is_some_and(|at| at <= now) {
                            record.expires.remove(i);
                            removed.nodes.push(record.service.nodes.remove(i));
                        } else {
                            i += 1;
                        }
                    }
                    if !removed.nodes.is_empty() {
                        events.push(WatchEvent::new(Action::Delete, removed));
                    }
                }
                versions.retain(|_, record| !record.service.nodes.is_empty());
            }
            services.retain(|_, versions| !versions.is_empty());
        }
        let pruned = events.iter().map(|e| e.service.nodes.len()).sum();
        for event in events {
            self.publish(event);
        }
        pruned
    }

    fn publish(&self, event: WatchEvent) {
        debug!("[MESHLINK] memory registry {} {}@{}", event.action, event.service.name, event.service.version);
        // No active watcher is not an error; overflow drops the oldest event instead of failing.
        let _ = self.inner.events.try_broadcast(event);
    }
}

impl Registry for MemoryRegistry {
    type Watcher = MemoryWatcher;

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
        let now = Instant::now();
        let services = self.inner.services.read();
        let found: Vec<Service> = services
            .get(name)
            .into_iter()
            .flat_map(|versions| versions.values())
            .map(|record| record.live(now))
            .filter(|service| !service.nodes.is_empty())
            .collect();
        if found.is_empty() {
            return Err(RegistryError::NotFound(FastStr::new(name)));
        }
        Ok(found)
    }

    async fn list_services(&self) -> Result<Vec<Service>, RegistryError> {
        let now = Instant::now();
        let services = self.inner.services.read();
        Ok(services
            .values()
            .flat_map(|versions| versions.values())
            .map(|record| record.live(now))
            .filter(|service| !service.nodes.is_empty())
            .collect())
    }

    async fn watch(&self, options: WatchOptions) -> Result<Self::Watcher, RegistryError> {
        Ok(MemoryWatcher {
            receiver: self.inner.events.new_receiver(),
            options,
            stopped: false,
        })
    }

    async fn register(&self, service: &Service, ttl: Duration) -> Result<(), RegistryError> {
        if service.name.is_empty() {
            return Err(RegistryError::Invalid(FastStr::from_static_str("empty service name")));
        }
        if service.nodes.is_empty() {
            return Err(RegistryError::Invalid(FastStr::from_string(format!("{} has no node", service.name))));
        }
        let expires = if ttl.is_zero() { None } else { Some(Instant::now() + ttl) };
        let events = {
            let mut services = self.inner.services.write();
            let versions = services.entry(service.name.clone()).or_default();
            match versions.get_mut(&service.version) {
                None => {
                    versions.insert(
                        service.version.clone(),
                        Record {
                            service: service.clone(),
                            expires: vec![expires; service.nodes.len()],
                        },
                    );
                    vec![WatchEvent::new(Action::Create, service.clone())]
                },
                Some(record) => {
                    record.service.metadata = service.metadata.clone();
                    record.service.methods = service.methods.clone();
                    let mut changed = false;
                    // previous addresses of nodes that re-registered elsewhere
                    let mut moved = Service::new(service.name.clone(), service.version.clone());
                    for node in &service.nodes {
                        match record.service.nodes.iter().position(|n| n.id == node.id) {
                            Some(i) => {
                                if record.service.nodes[i].address != node.address {
                                    moved.nodes.push(record.service.nodes[i].clone());
                                    changed = true;
                                }
                                record.service.nodes[i] = node.clone();
                                record.expires[i] = expires;
                            },
                            None => {
                                record.service.nodes.push(node.clone());
                                record.expires.push(expires);
                                changed = true;
                            },
                        }
                    }
                    let mut events = Vec::with_capacity(2);
                    if !moved.nodes.is_empty() {
                        events.push(WatchEvent::new(Action::Delete, moved));
                    }
                    if changed {
                        events.push(WatchEvent::new(Action::Update, record.service.clone()));
                    }
                    events
                },
            }
        };
        for event in events {
            self.publish(event);
        }
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        let event = {
            let mut services = self.inner.services.write();
            let Some(versions) = services.get_mut(&service.name) else {
                return Ok(());
            };
            let Some(record) = versions.get_mut(&service.version) else {
                return Ok(());
            };
            let mut removed = Service::new(service.name.clone(), service.version.clone());
            let mut i = 0;
            while i < record.service.nodes.len() {
                if service.nodes.iter().any(|n| n.id == record.service.nodes[i].id) {
                    record.expires.remove(i);
                    removed.nodes.push(record.service.nodes.remove(i));
                } else {
                    i += 1;
                }
            }
            if record.service.nodes.is_empty() {
                versions.remove(&service.version);
            }
            if versions.is_empty() {
                services.remove(&service.name);
            }
            (!removed.nodes.is_empty()).then(|| WatchEvent::new(Action::Delete, removed))
        };
        if let Some(event) = event {
            self.publish(event);
        }
        Ok(())
    }
}

/// Watch handle of a [`MemoryRegistry`].
pub struct MemoryWatcher {
    receiver: Receiver<WatchEvent>,
    options: WatchOptions,
    stopped: bool,
}

impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<WatchEvent, RegistryError> {
        loop {
            if self.stopped {
                return Err(RegistryError::WatcherStopped);
            }
            match self.receiver.recv().await {
                Ok(event) if self.options.matches(&event.service.name) => return Ok(event),
                Ok(_) => continue,
                Err(RecvError::Overflowed(missed)) => {
                    return Err(RegistryError::Watch(FastStr::from_string(format!("watcher lagged, {missed} events dropped"))));
                },
                Err(RecvError::Closed) => {
                    self.stopped = true;
                    return Err(RegistryError::WatcherStopped);
                },
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
