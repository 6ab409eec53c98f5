// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Registry-driven name resolution.
//!
//! A [`ResolverBuilder`] keeps one watch loop per service name. Every [`Resolver`] built for that
//! name is an attachment on the shared state and receives the address set of the versions its
//! target asks for, first when it is built and again after each applied watch event.

use crate::config::{ConfigError, WatchConfig};
use crate::net::Address;
use crate::registry::{Registry, RegistryError, SCHEME};
use dashmap::DashMap;
use faststr::FastStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub use state::ServiceStatus;
pub use target::Target;

mod state;
mod target;

use state::ServiceState;

/// Address set delivered to an [`UpdateSink`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedState {
    /// Addresses of the selected versions, without duplicates.
    pub addresses: Vec<Address>,
}

/// [`UpdateSink`] receives the resolved address set of one [`Resolver`].
///
/// It is called while the service state is locked, so it must not block and must not call back
/// into the resolver.
pub trait UpdateSink: Send + Sync + 'static {
    /// Replaces the consumer's address set.
    fn update_state(&self, state: ResolvedState);
}

impl UpdateSink for tokio::sync::watch::Sender<ResolvedState> {
    fn update_state(&self, state: ResolvedState) {
        self.send_replace(state);
    }
}

impl UpdateSink for async_broadcast::Sender<ResolvedState> {
    fn update_state(&self, state: ResolvedState) {
        if self.try_broadcast(state).is_err() {
            debug!("[MESHLINK] resolved state dropped, no active receiver");
        }
    }
}

/// Errors reported by the resolver.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The registry failed to serve the initial snapshot or watch.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A watch event carried an action other than create, update or delete.
    #[error("unsupported watch action: {0}")]
    UnsupportedAction(FastStr),
    /// The watch settings are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// [`ResolverBuilder`] creates [`Resolver`]s for targets of the `registry` scheme.
pub struct ResolverBuilder<R: Registry> {
    registry: Arc<R>,
    config: WatchConfig,
    services: DashMap<FastStr, Arc<ServiceState>>,
}

impl<R: Registry> ResolverBuilder<R> {
    /// Creates a builder with the default [`WatchConfig`].
    pub fn new(registry: Arc<R>) -> Self {
        Self {
            registry,
            config: WatchConfig::default(),
            services: DashMap::new(),
        }
    }

    /// Creates a builder with custom watch settings.
    pub fn with_config(registry: Arc<R>, config: WatchConfig) -> Result<Self, ConfigError> {
        config.quota()?;
        Ok(Self {
            registry,
            config,
            services: DashMap::new(),
        })
    }

    /// The URI scheme this builder resolves.
    #[inline]
    pub fn scheme(&self) -> &'static str {
        SCHEME
    }

    /// The registry the builder reads from.
    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Resolves `target` and attaches `sink` to the state of its service.
    ///
    /// The first build of a service fetches its snapshot and starts the watch loop; later builds
    /// reuse both. `sink` has received the current address set when this returns.
    pub async fn build<S: UpdateSink>(&self, target: &str, sink: S) -> Result<Resolver, ResolveError> {
        let target = Target::parse(target);
        let state = self.service_state(&target.service);
        state.ensure_loaded(self.registry.as_ref(), &self.config).await?;
        let versions: Arc<[FastStr]> = target.versions.into();
        let index = state.attach(versions.clone(), Arc::new(sink));
        debug!("[MESHLINK] attached resolver {} to service {}", index, state.name());
        Ok(Resolver {
            state,
            versions,
            index,
            closed: AtomicBool::new(false),
        })
    }

    /// Status of the named service, if any resolver was ever built for it.
    pub fn status(&self, service: &str) -> Option<ServiceStatus> {
        self.services.get(service).map(|state| state.status())
    }

    /// Number of open resolvers attached to the named service.
    pub fn attached(&self, service: &str) -> usize {
        self.services.get(service).map_or(0, |state| state.attached())
    }

    fn service_state(&self, service: &FastStr) -> Arc<ServiceState> {
        self.services
            .entry(service.clone())
            .or_insert_with(|| Arc::new(ServiceState::new(service.clone())))
            .clone()
    }
}

/// One attachment on a service state. Dropping it closes it.
pub struct Resolver {
    state: Arc<ServiceState>,
    versions: Arc<[FastStr]>,
    index: u64,
    closed: AtomicBool,
}

impl Resolver {
    /// The resolved service name.
    pub fn service(&self) -> &str {
        self.state.name()
    }

    /// The requested versions; empty means every version.
    pub fn versions(&self) -> &[FastStr] {
        &self.versions
    }

    /// Attachment index, unique within the service.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Current address set of the requested versions.
    pub fn addresses(&self) -> Vec<Address> {
        self.state.addresses(&self.versions)
    }

    /// Updates are pushed by the watch loop, so this does nothing.
    pub fn resolve_now(&self) {}

    /// Stops updates to this resolver's sink. Other resolvers of the service are not affected.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.detach(self.index);
            debug!("[MESHLINK] closed resolver {} of service {}", self.index, self.state.name());
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("service", &self.service())
            .field("versions", &self.versions)
            .field("index", &self.index)
            .finish()
    }
}
