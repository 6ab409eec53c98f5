// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Routable address of one service instance.

use crate::registry::Node;
use faststr::FastStr;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// [`Address`] is an opaque `host:port` plus the metadata of the node it came from.
///
/// Two addresses are the same instance when their address strings match; metadata
/// is carried along for the consumer and never used for identity.
#[derive(Debug, Clone)]
pub struct Address {
    addr: FastStr,
    metadata: Arc<HashMap<String, String>>,
}

impl Address {
    /// Creates an address without metadata.
    #[inline]
    pub fn new(addr: impl Into<FastStr>) -> Self {
        Self {
            addr: addr.into(),
            metadata: Default::default(),
        }
    }

    /// Attaches metadata to the address.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    /// The `host:port` string.
    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Metadata copied from the registry node.
    #[inline]
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Address {}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr.hash(state)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.addr)
    }
}

impl From<&Node> for Address {
    fn from(node: &Node) -> Self {
        Self {
            addr: FastStr::new(&node.address),
            metadata: Arc::new(node.metadata.clone()),
        }
    }
}

impl From<&'static str> for Address {
    fn from(addr: &'static str) -> Self {
        Self::new(FastStr::from_static_str(addr))
    }
}
