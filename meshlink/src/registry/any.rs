// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Closed set of registry backends chosen at construction time.

use super::{FixedRegistry, FixedWatcher, MemoryRegistry, MemoryWatcher, Registry, RegistryError, Service, WatchEvent, WatchOptions, Watcher};
use std::time::Duration;

/// [`AnyRegistry`] lets a caller pick a backend at runtime without boxing the capability.
#[derive(Clone)]
pub enum AnyRegistry {
    /// In-process registry.
    Memory(MemoryRegistry),
    /// Fixed service list.
    Fixed(FixedRegistry),
}

impl From<MemoryRegistry> for AnyRegistry {
    fn from(registry: MemoryRegistry) -> Self {
        AnyRegistry::Memory(registry)
    }
}

impl From<FixedRegistry> for AnyRegistry {
    fn from(registry: FixedRegistry) -> Self {
        AnyRegistry::Fixed(registry)
    }
}

impl Registry for AnyRegistry {
    type Watcher = AnyWatcher;

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
        match self {
            AnyRegistry::Memory(r) => r.get_service(name).await,
            AnyRegistry::Fixed(r) => r.get_service(name).await,
        }
    }

    async fn list_services(&self) -> Result<Vec<Service>, RegistryError> {
        match self {
            AnyRegistry::Memory(r) => r.list_services().await,
            AnyRegistry::Fixed(r) => r.list_services().await,
        }
    }

    async fn watch(&self, options: WatchOptions) -> Result<Self::Watcher, RegistryError> {
        match self {
            AnyRegistry::Memory(r) => r.watch(options).await.map(AnyWatcher::Memory),
            AnyRegistry::Fixed(r) => r.watch(options).await.map(AnyWatcher::Fixed),
        }
    }

    async fn register(&self, service: &Service, ttl: Duration) -> Result<(), RegistryError> {
        match self {
            AnyRegistry::Memory(r) => r.register(service, ttl).await,
            AnyRegistry::Fixed(r) => r.register(service, ttl).await,
        }
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        match self {
            AnyRegistry::Memory(r) => r.deregister(service).await,
            AnyRegistry::Fixed(r) => r.deregister(service).await,
        }
    }
}

/// Watch handle of an [`AnyRegistry`].
pub enum AnyWatcher {
    /// Watcher of a [`MemoryRegistry`].
    Memory(MemoryWatcher),
    /// Watcher of a [`FixedRegistry`].
    Fixed(FixedWatcher),
}

impl Watcher for AnyWatcher {
    async fn next(&mut self) -> Result<WatchEvent, RegistryError> {
        match self {
            AnyWatcher::Memory(w) => w.next().await,
            AnyWatcher::Fixed(w) => w.next().await,
        }
    }

    fn stop(&mut self) {
        match self {
            AnyWatcher::Memory(w) => w.stop(),
            AnyWatcher::Fixed(w) => w.stop(),
        }
    }
}
