// Modifications Copyright Andeya Lee 2024
// Based on original source code from Volo Contributors licensed under MIT OR Apache-2.0
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Fixed service list registry.

use super::{Node, Registry, RegistryError, Service, WatchEvent, WatchOptions, Watcher};
use faststr::FastStr;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// [`FixedRegistry`] is a read-only [`Registry`] that serves a fixed list of services.
///
/// Its watchers never yield an event, so resolvers built on it keep the initial snapshot.
#[derive(Clone, Default)]
pub struct FixedRegistry {
    services: Arc<Vec<Service>>,
}

impl FixedRegistry {
    /// Creates a new [`FixedRegistry`].
    pub fn new(services: Vec<Service>) -> Self {
        Self { services: Arc::new(services) }
    }

    /// Creates a registry holding one version of one service, one node per address.
    pub fn from_addrs(name: &str, version: &str, addrs: Vec<SocketAddr>) -> Self {
        let service = addrs
            .into_iter()
            .fold(Service::new(name, version), |service, addr| service.with_node(Node::new(format!("{name}-{addr}"), addr.to_string())));
        Self::new(vec![service])
    }
}

impl From<Vec<Service>> for FixedRegistry {
    fn from(services: Vec<Service>) -> Self {
        Self::new(services)
    }
}

impl Registry for FixedRegistry {
    type Watcher = FixedWatcher;

    fn get_service(&self, name: &str) -> impl Future<Output = Result<Vec<Service>, RegistryError>> + Send {
        let found: Vec<Service> = self.services.iter().filter(|s| s.name == name && !s.nodes.is_empty()).cloned().collect();
        let name = FastStr::new(name);
        async move {
            if found.is_empty() {
                Err(RegistryError::NotFound(name))
            } else {
                Ok(found)
            }
        }
    }

    fn list_services(&self) -> impl Future<Output = Result<Vec<Service>, RegistryError>> + Send {
        let services = self.services.to_vec();
        async move { Ok(services) }
    }

    fn watch(&self, _options: WatchOptions) -> impl Future<Output = Result<Self::Watcher, RegistryError>> + Send {
        async move { Ok(FixedWatcher { stopped: false }) }
    }

    fn register(&self, _service: &Service, _ttl: Duration) -> impl Future<Output = Result<(), RegistryError>> + Send {
        async move { Err(RegistryError::Unavailable(FastStr::from_static_str("fixed registry is read-only"))) }
    }

    fn deregister(&self, _service: &Service) -> impl Future<Output = Result<(), RegistryError>> + Send {
        async move { Err(RegistryError::Unavailable(FastStr::from_static_str("fixed registry is read-only"))) }
    }
}

/// Watch handle of a [`FixedRegistry`]; it only ever reports being stopped.
pub struct FixedWatcher {
    stopped: bool,
}

impl Watcher for FixedWatcher {
    fn next(&mut self) -> impl Future<Output = Result<WatchEvent, RegistryError>> + Send {
        let stopped = self.stopped;
        async move {
            if stopped {
                return Err(RegistryError::WatcherStopped);
            }
            std::future::pending().await
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
