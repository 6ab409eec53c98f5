// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Server-side registration of local services.

use super::{Node, Registry, RegistryError, Service};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// [`Registrar`] registers the services a process serves and remembers them so they can be
/// refreshed by a heartbeat and deregistered together on shutdown.
pub struct Registrar<R: Registry> {
    registry: Arc<R>,
    registered: Arc<Mutex<Vec<Service>>>,
}

impl<R: Registry> Clone for Registrar<R> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            registered: self.registered.clone(),
        }
    }
}

impl<R: Registry> Registrar<R> {
    /// Creates a registrar on top of `registry`.
    pub fn new(registry: Arc<R>) -> Self {
        Self {
            registry,
            registered: Default::default(),
        }
    }

    /// Registers one node of `name@version` listening on `address`.
    ///
    /// The node id is `{name}-{address}`. A zero `ttl` never expires.
    pub async fn register(&self, name: &str, version: &str, address: &str, ttl: Duration) -> Result<(), RegistryError> {
        let service = local_service(name, version, address);
        self.registry.register(&service, ttl).await?;
        info!("[MESHLINK] registered {}@{} at {}", name, version, address);
        let mut registered = self.registered.lock();
        if !registered.contains(&service) {
            registered.push(service);
        }
        Ok(())
    }

    /// Deregisters one previously registered node.
    pub async fn deregister(&self, name: &str, version: &str, address: &str) -> Result<(), RegistryError> {
        let service = local_service(name, version, address);
        self.registry.deregister(&service).await?;
        info!("[MESHLINK] deregistered {}@{} at {}", name, version, address);
        self.registered.lock().retain(|s| s != &service);
        Ok(())
    }

    /// Deregisters every remembered service. Failures are logged and do not stop the sweep.
    pub async fn deregister_all(&self) {
        let services = std::mem::take(&mut *self.registered.lock());
        for service in services {
            if let Err(e) = self.registry.deregister(&service).await {
                warn!("[MESHLINK] deregister {}@{} error: {}", service.name, service.version, e);
            }
        }
    }

    /// Services currently remembered by the registrar.
    pub fn registered(&self) -> Vec<Service> {
        self.registered.lock().clone()
    }

    /// Re-registers all remembered services with `ttl` every `interval`.
    ///
    /// The heartbeat stops when the returned handle is dropped.
    pub fn spawn_heartbeat(&self, interval: Duration, ttl: Duration) -> HeartbeatHandle {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for service in this.registered() {
                    if let Err(e) = this.registry.register(&service, ttl).await {
                        warn!("[MESHLINK] heartbeat {}@{} error: {}", service.name, service.version, e);
                    }
                }
            }
        });
        HeartbeatHandle { task }
    }
}

/// Handle of a heartbeat task spawned by [`Registrar::spawn_heartbeat`]; dropping it stops the task.
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stops the heartbeat.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn local_service(name: &str, version: &str, address: &str) -> Service {
    Service::new(name, version).with_node(Node::new(format!("{name}-{address}"), address))
}
