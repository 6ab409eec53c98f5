// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Registry capability consumed by the resolver.
//!
//! A backend only has to implement [`Registry`] and [`Watcher`]; the resolver depends on
//! nothing else. Backends shipped with the crate form a closed set wrapped by [`AnyRegistry`].

use faststr::FastStr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::time::Duration;

pub use any::{AnyRegistry, AnyWatcher};
pub use fixed::{FixedRegistry, FixedWatcher};
pub use memory::{MemoryRegistry, MemoryWatcher};
pub use registrar::{HeartbeatHandle, Registrar};

mod any;
mod fixed;
mod memory;
mod registrar;

/// Scheme of dial targets resolved by [`crate::resolver::ResolverBuilder`].
pub const SCHEME: &str = "registry";

/// Separator between versions in the `version` query parameter.
pub const VERSION_SEPARATOR: char = '|';

/// [`Registry`] is the capability a service-discovery backend provides.
pub trait Registry: Send + Sync + 'static {
    /// Watch handle returned by [`Registry::watch`].
    type Watcher: Watcher;

    /// Returns every version of the named service, or [`RegistryError::NotFound`].
    fn get_service(&self, name: &str) -> impl Future<Output = Result<Vec<Service>, RegistryError>> + Send;
    /// Returns all services known to the registry.
    fn list_services(&self) -> impl Future<Output = Result<Vec<Service>, RegistryError>> + Send;
    /// Opens a watch stream of incremental changes.
    fn watch(&self, options: WatchOptions) -> impl Future<Output = Result<Self::Watcher, RegistryError>> + Send;
    /// Registers the nodes of `service`. A zero `ttl` never expires.
    fn register(&self, service: &Service, ttl: Duration) -> impl Future<Output = Result<(), RegistryError>> + Send;
    /// Removes the nodes of `service`.
    fn deregister(&self, service: &Service) -> impl Future<Output = Result<(), RegistryError>> + Send;
}

/// [`Watcher`] yields the change events of one watch stream.
pub trait Watcher: Send + 'static {
    /// Waits for the next event.
    ///
    /// [`RegistryError::WatcherStopped`] is terminal; every other error is transient and the
    /// caller may call `next` again on the same handle.
    fn next(&mut self) -> impl Future<Output = Result<WatchEvent, RegistryError>> + Send;
    /// Stops the stream. Subsequent `next` calls return [`RegistryError::WatcherStopped`].
    fn stop(&mut self);
}

/// Errors reported by a registry backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry holds no node for the service.
    #[error("service not found: {0}")]
    NotFound(FastStr),
    /// The registry could not be reached or refused the call.
    #[error("registry unavailable: {0}")]
    Unavailable(FastStr),
    /// The watch stream is closed for good.
    #[error("watcher stopped")]
    WatcherStopped,
    /// A single `next` call failed; the stream is still usable.
    #[error("watch failed: {0}")]
    Watch(FastStr),
    /// The service passed to the registry is unusable.
    #[error("invalid service: {0}")]
    Invalid(FastStr),
}

impl RegistryError {
    /// Whether the error ends a watch stream.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistryError::WatcherStopped)
    }
}

/// A named, versioned group of endpoint instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// service name
    pub name: String,
    /// service version
    #[serde(default)]
    pub version: String,
    /// service metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Routing metadata, not used by the resolver.
    #[serde(default)]
    pub methods: Vec<Method>,
    /// running instances
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    /// Creates a service snapshot without nodes.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// Appends a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Appends a method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }
}

/// One running service instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// node id
    pub id: String,
    /// `host:port`
    pub address: String,
    /// node metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    /// Creates a node without metadata.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: Default::default(),
        }
    }
}

/// An RPC method and its HTTP bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    /// method name
    pub name: String,
    /// HTTP bindings
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

/// HTTP binding of a method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// HTTP verb
    pub method: String,
    /// path template
    pub path: String,
    /// whether a trailing `:verb` is part of the path
    #[serde(default)]
    pub assume_colon_verb: bool,
}

/// Action carried by a [`WatchEvent`].
///
/// Unknown actions are kept verbatim so the consumer can reject them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// A new version appeared.
    Create,
    /// Nodes were added to an existing version.
    Update,
    /// Nodes were removed.
    Delete,
    /// Anything else.
    Other(String),
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(&self) -> &str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Other(s) => s,
        }
    }
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        match value.as_str() {
            "create" => Action::Create,
            "update" => Action::Update,
            "delete" => Action::Delete,
            _ => Action::Other(value),
        }
    }
}

impl From<Action> for String {
    fn from(value: Action) -> Self {
        match value {
            Action::Other(s) => s,
            action => action.as_str().to_string(),
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental change of one (service, version) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// what happened
    pub action: Action,
    /// the affected snapshot
    pub service: Service,
}

impl WatchEvent {
    /// Creates an event.
    pub fn new(action: Action, service: Service) -> Self {
        Self { action, service }
    }
}

/// Filter for [`Registry::watch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Only watch this service; `None` watches everything.
    pub service: Option<String>,
}

impl WatchOptions {
    /// Watch a single service.
    pub fn service(name: impl Into<String>) -> Self {
        Self { service: Some(name.into()) }
    }

    /// Whether an event for `name` passes the filter.
    #[inline]
    pub fn matches(&self, name: &str) -> bool {
        self.service.as_deref().map_or(true, |s| s == name)
    }
}

/// Builds the dial target of a service, optionally pinned to a version.
///
/// # Example
/// ```
/// assert_eq!(meshlink::registry::new_target("orders", None), "registry:///orders");
/// assert_eq!(meshlink::registry::new_target("orders", Some("1.1")), "registry:///orders?version=1.1");
/// ```
pub fn new_target(service_name: &str, version: Option<&str>) -> String {
    match version {
        Some(version) if !version.is_empty() => format!("{SCHEME}:///{service_name}?version={version}"),
        _ => format!("{SCHEME}:///{service_name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, Node, Service, WatchEvent};

    #[test]
    fn test_watch_event_wire_shape() {
        let raw = r#"{
            "action": "update",
            "service": {
                "name": "orders",
                "version": "1.0",
                "methods": [{"name": "Create", "bindings": [{"method": "POST", "path": "/orders"}]}],
                "nodes": [{"id": "n1", "address": "10.0.0.1:9000", "metadata": {"zone": "a"}}]
            }
        }"#;
        let event: WatchEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.action, Action::Update);
        assert_eq!(event.service.name, "orders");
        assert_eq!(event.service.methods[0].bindings[0].path, "/orders");
        assert_eq!(event.service.nodes[0].metadata["zone"], "a");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "update");
        assert_eq!(json["service"]["nodes"][0]["address"], "10.0.0.1:9000");
    }

    #[test]
    fn test_unknown_action_is_kept() {
        let event: WatchEvent = serde_json::from_str(r#"{"action":"rename","service":{"name":"orders"}}"#).unwrap();
        assert_eq!(event.action, Action::Other("rename".into()));
        assert_eq!(serde_json::to_value(&event).unwrap()["action"], "rename");
    }

    #[test]
    fn test_service_builder() {
        let service = Service::new("orders", "1.0").with_node(Node::new("n1", "10.0.0.1:9000"));
        assert_eq!(service.nodes.len(), 1);
        assert!(service.methods.is_empty());
    }
}
