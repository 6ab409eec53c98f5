// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Dial target parsing.

use crate::registry::{SCHEME, VERSION_SEPARATOR};
use faststr::FastStr;
use tracing::debug;
use url::Url;

const VERSION_KEY: &str = "version";

/// A parsed dial target: `scheme://[authority]/{service}[?version=v1|v2]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Service name resolved against the registry.
    pub service: FastStr,
    /// Requested versions; empty means every version.
    pub versions: Vec<FastStr>,
}

impl Target {
    /// Parses a dial target.
    ///
    /// Both a full URI and a bare endpoint (`orders?version=1.0`) are accepted. A query that
    /// cannot be decoded makes the whole endpoint the service name, without an error.
    pub fn parse(target: &str) -> Self {
        let parsed = if target.contains("://") {
            Url::parse(target)
        } else {
            Url::parse(&format!("{SCHEME}:///{target}"))
        };
        match parsed {
            Ok(url) => Self::from_url(&url),
            Err(e) => {
                debug!("[MESHLINK] target {} is not a uri ({}), using it as the service name", target, e);
                Self::literal(target)
            },
        }
    }

    fn from_url(url: &Url) -> Self {
        let endpoint = url.path().trim_start_matches('/');
        let Some(query) = url.query() else {
            return Self::literal(endpoint);
        };
        if endpoint.is_empty() || !is_well_escaped(query) {
            return Self::literal(&format!("{endpoint}?{query}"));
        }
        let versions = url
            .query_pairs()
            .find(|(key, _)| key == VERSION_KEY)
            .map(|(_, value)| {
                value
                    .split(VERSION_SEPARATOR)
                    .filter(|v| !v.is_empty())
                    .map(FastStr::new)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            service: FastStr::new(endpoint),
            versions,
        }
    }

    fn literal(endpoint: &str) -> Self {
        Self {
            service: FastStr::new(endpoint),
            versions: Vec::new(),
        }
    }
}

// `query_pairs` decodes leniently; a `%` must start a two digit hex escape.
fn is_well_escaped(query: &str) -> bool {
    query
        .split('%')
        .skip(1)
        .all(|rest| rest.len() >= 2 && rest.as_bytes()[..2].iter().all(u8::is_ascii_hexdigit))
}
