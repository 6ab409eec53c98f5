// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Per-address pool of idle connections.

use crate::config::{ConfigError, PoolConfig};
use faststr::FastStr;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::Display;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Errors reported by the pool.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool settings are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Dialing the address failed. The pool does not retry.
    #[error("dial {address} failed: {reason}")]
    Dial {
        /// dialed address
        address: FastStr,
        /// cause reported by the dialer
        reason: FastStr,
    },
}

impl PoolError {
    /// Creates a [`PoolError::Dial`].
    pub fn dial(address: &str, reason: impl Display) -> Self {
        PoolError::Dial {
            address: FastStr::new(address),
            reason: FastStr::from_string(reason.to_string()),
        }
    }
}

/// [`Dialer`] opens the connections a [`ConnectionPool`] hands out.
pub trait Dialer: Send + Sync + 'static {
    /// The connection handle.
    type Conn: Send + 'static;
    /// Per-call dial settings.
    type Options: Send + Sync;

    /// Opens a new connection to `address`.
    fn dial(&self, address: &str, options: &Self::Options) -> impl Future<Output = Result<Self::Conn, PoolError>> + Send;

    /// Releases a connection the pool discards.
    fn close(&self, conn: Self::Conn) {
        drop(conn)
    }
}

struct PoolEntry<C> {
    conn: C,
    released: Instant,
}

/// [`ConnectionPool`] keeps up to `size` idle connections per address and reuses the most
/// recently released one while it is younger than `ttl`.
///
/// The pool never bounds the number of connections in use; callers dial concurrently.
pub struct ConnectionPool<D: Dialer> {
    dialer: D,
    config: PoolConfig,
    idle: Mutex<HashMap<FastStr, Vec<PoolEntry<D::Conn>>>>,
}

impl<D: Dialer> ConnectionPool<D> {
    /// Creates a pool.
    pub fn new(dialer: D, config: PoolConfig) -> Self {
        Self {
            dialer,
            config,
            idle: Default::default(),
        }
    }

    /// Creates a pool configured from the environment, see [`PoolConfig::from_env`].
    pub fn from_env(dialer: D) -> Result<Self, PoolError> {
        Ok(Self::new(dialer, PoolConfig::from_env()?))
    }

    /// The pool settings.
    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The underlying dialer.
    #[inline]
    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Returns a connection to `address` wrapped in a guard that releases it on drop.
    pub async fn get(&self, address: &str, options: &D::Options) -> Result<PooledConnection<'_, D>, PoolError> {
        let conn = self.checkout(address, options).await?;
        Ok(PooledConnection {
            pool: self,
            address: FastStr::new(address),
            conn: Some(conn),
            error: None,
        })
    }

    /// Takes the most recently released usable connection to `address`, or dials a new one.
    ///
    /// The caller must hand the connection back with [`ConnectionPool::put`].
    pub async fn checkout(&self, address: &str, options: &D::Options) -> Result<D::Conn, PoolError> {
        if let Some(conn) = self.take_idle(address) {
            debug!("[MESHLINK] reuse idle connection to {}", address);
            return Ok(conn);
        }
        let conn = self.dialer.dial(address, options).await?;
        debug!("[MESHLINK] dialed new connection to {}", address);
        Ok(conn)
    }

    fn take_idle(&self, address: &str) -> Option<D::Conn> {
        let mut stale = Vec::new();
        let fresh = {
            let mut idle = self.idle.lock();
            let entries = idle.get_mut(address)?;
            let mut fresh = None;
            while let Some(entry) = entries.pop() {
                if entry.released.elapsed() < self.config.ttl {
                    fresh = Some(entry.conn);
                    break;
                }
                // Entries are ordered by release time, so the rest are older still.
                stale.push(entry.conn);
                stale.extend(entries.drain(..).map(|e| e.conn));
            }
            if entries.is_empty() {
                idle.remove(address);
            }
            fresh
        };
        if !stale.is_empty() {
            debug!("[MESHLINK] evicted {} stale connections to {}", stale.len(), address);
        }
        for conn in stale {
            self.dialer.close(conn);
        }
        fresh
    }

    /// Returns a connection taken by [`ConnectionPool::checkout`].
    ///
    /// A connection that saw an error is closed. So is one that would push the idle list of
    /// `address` beyond `size`.
    pub fn put(&self, address: &str, conn: D::Conn, observed: Option<&(dyn Error + 'static)>) {
        if let Some(e) = observed {
            warn!("[MESHLINK] discard connection to {}: {}", address, e);
            self.dialer.close(conn);
            return;
        }
        if self.config.is_passthrough() {
            self.dialer.close(conn);
            return;
        }
        let rejected = {
            let mut idle = self.idle.lock();
            let entries = idle.entry(FastStr::new(address)).or_default();
            if entries.len() >= self.config.size {
                Some(conn)
            } else {
                entries.push(PoolEntry {
                    conn,
                    released: Instant::now(),
                });
                None
            }
        };
        if let Some(conn) = rejected {
            debug!("[MESHLINK] idle list of {} is full", address);
            self.dialer.close(conn);
        }
    }

    /// Number of idle connections kept for `address`.
    pub fn idle_count(&self, address: &str) -> usize {
        self.idle.lock().get(address).map_or(0, Vec::len)
    }

    /// Closes every idle connection.
    pub fn clear(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        for conn in idle.into_values().flatten().map(|e| e.conn) {
            self.dialer.close(conn);
        }
    }
}

impl<D: Dialer> Drop for ConnectionPool<D> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping the guard returns the connection exactly once. Call
/// [`PooledConnection::set_error`] first when the connection must not be reused.
pub struct PooledConnection<'a, D: Dialer> {
    pool: &'a ConnectionPool<D>,
    address: FastStr,
    conn: Option<D::Conn>,
    error: Option<Box<dyn Error + Send + Sync>>,
}

impl<'a, D: Dialer> PooledConnection<'a, D> {
    /// The address the connection is bound to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Marks the connection as failed; it is closed instead of being kept.
    pub fn set_error(&mut self, error: impl Into<Box<dyn Error + Send + Sync>>) {
        self.error = Some(error.into());
    }

    /// Returns the connection to the pool now.
    pub fn close(self) {}
}

impl<'a, D: Dialer> Deref for PooledConnection<'a, D> {
    type Target = D::Conn;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is taken only on drop"),
        }
    }
}

impl<'a, D: Dialer> DerefMut for PooledConnection<'a, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is taken only on drop"),
        }
    }
}

impl<'a, D: Dialer> std::fmt::Debug for PooledConnection<'a, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("address", &self.address)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<'a, D: Dialer> Drop for PooledConnection<'a, D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let observed = self.error.as_deref().map(|e| e as &(dyn Error + 'static));
            self.pool.put(&self.address, conn, observed);
        }
    }
}
