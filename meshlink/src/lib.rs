// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! meshlink is the runtime core of an RPC client: a per-address connection pool
//! and a registry-driven resolver that keeps version-partitioned address lists
//! in sync with a remote registry.
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod config;
pub mod net;
pub mod registry;
pub mod resolver;
pub mod transport;

pub use client::channel::{RpcDialer, RpcOptions};
pub use client::pool::{ConnectionPool, Dialer, PoolError, PooledConnection};
pub use config::{ConfigError, PoolConfig, WatchConfig};
pub use net::Address;
pub use registry::{AnyRegistry, MemoryRegistry, Registry, RegistryError, Service};
pub use resolver::{ResolveError, ResolvedState, Resolver, ResolverBuilder, UpdateSink};

/// re-public `tarpc` crate something.
pub use ::tarpc;
