// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Client side connections: a per-address pool and the tarpc dialer it is used with.

pub mod channel;
pub mod pool;
pub use channel::{RpcDialer, RpcOptions};
pub use core::RpcError;
pub use pool::{ConnectionPool, Dialer, PoolError, PooledConnection};

/// re-public tarpc some types.
pub mod core {
    pub use ::tarpc::client::*;
}
