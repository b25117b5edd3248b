//! Namespace and instance registry.
//!
//! # Responsibilities
//! - Map namespace strings to component factories
//! - Keep the ordered list of live instances
//! - Index instances by their optional configuration-supplied id
//!
//! # Design Decisions
//! - Factories are plain function pointers registered at process init and
//!   looked up once at load time, never per request
//! - Duplicate namespaces and duplicate ids are fatal configuration errors
//!   raised at load time

use std::collections::HashMap;
use std::sync::Arc;

use crate::balancer::{Balancer, RoundRobin};
use crate::cluster::Cluster;
use crate::component::Component;
use crate::error::{Error, Result};
use crate::limiter::RateLimit;
use crate::logger::Logger;
use crate::routes::{HttpProxy, Redirect, Route, Serve};
use crate::server::HttpServer;
use crate::store::{MemoryStore, SharedStore, Store};
use crate::stream::{FileStream, LogStream, SharedStream, StdoutStream};

/// One raw configuration block: the JSON object carrying `namespace`,
/// an optional `id`, and namespace-specific fields.
pub type Block = serde_json::Map<String, serde_json::Value>;

/// Constructs a component from its configuration block.
pub type Factory = fn(&Block) -> Result<Arc<dyn Component>>;

/// Registry of component factories and live instances.
pub struct Registry {
    factories: HashMap<&'static str, Factory>,
    components: Vec<Arc<dyn Component>>,
    by_id: HashMap<String, Arc<dyn Component>>,
}

impl Registry {
    /// An empty registry with no namespaces. Mostly useful in tests.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            components: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// A registry with every built-in namespace registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let builtin: [(&'static str, Factory); 13] = [
            ("cluster", Cluster::factory),
            ("server.http", HttpServer::factory),
            ("route.proxy", HttpProxy::factory),
            ("route.redirect", Redirect::factory),
            ("route.serve", Serve::factory),
            ("balancer.round-robin", RoundRobin::factory),
            ("rate-limit", RateLimit::factory),
            ("store.memory", MemoryStore::factory),
            ("store.shared", SharedStore::factory),
            ("logger", Logger::factory),
            ("stream.file", FileStream::factory),
            ("stream.stdout", StdoutStream::factory),
            ("stream.shared", SharedStream::factory),
        ];
        for (namespace, factory) in builtin {
            registry
                .register(namespace, factory)
                .expect("built-in namespaces are distinct");
        }
        registry
    }

    /// Add a namespace -> factory mapping. Fails if the namespace exists.
    pub fn register(&mut self, namespace: &'static str, factory: Factory) -> Result<()> {
        if self.factories.contains_key(namespace) {
            return Err(Error::DuplicateNamespace(namespace.to_string()));
        }
        self.factories.insert(namespace, factory);
        Ok(())
    }

    /// Resolve a namespace to its factory.
    pub fn factory(&self, namespace: &str) -> Result<Factory> {
        self.factories
            .get(namespace)
            .copied()
            .ok_or_else(|| Error::UnknownNamespace(namespace.to_string()))
    }

    /// Append a constructed instance, indexing it by id when it has one.
    /// Fails if the id collides with an existing one.
    pub fn insert(&mut self, component: Arc<dyn Component>) -> Result<()> {
        if let Some(id) = component.id() {
            if self.by_id.contains_key(id) {
                return Err(Error::DuplicateId(id.to_string()));
            }
            self.by_id.insert(id.to_string(), component.clone());
        }
        self.components.push(component);
        Ok(())
    }

    /// All instances in construction (= configuration) order.
    pub fn components(&self) -> &[Arc<dyn Component>] {
        &self.components
    }

    /// Look up an instance by its configuration-supplied id.
    pub fn by_id(&self, id: &str) -> Option<Arc<dyn Component>> {
        self.by_id.get(id).cloned()
    }

    /// The ordered route list, as configured.
    pub fn routes(&self) -> Vec<Arc<dyn Route>> {
        self.components
            .iter()
            .filter_map(|c| c.clone().as_route())
            .collect()
    }

    pub fn logger(&self, id: &str) -> Result<Arc<Logger>> {
        self.by_id(id)
            .and_then(|c| c.as_logger())
            .ok_or(Error::UnresolvedReference { kind: "logger", id: id.to_string() })
    }

    pub fn rate_limit(&self, id: &str) -> Result<Arc<RateLimit>> {
        self.by_id(id)
            .and_then(|c| c.as_rate_limit())
            .ok_or(Error::UnresolvedReference { kind: "rate limiter", id: id.to_string() })
    }

    pub fn balancer(&self, id: &str) -> Result<Arc<dyn Balancer>> {
        self.by_id(id)
            .and_then(|c| c.as_balancer())
            .ok_or(Error::UnresolvedReference { kind: "balancer", id: id.to_string() })
    }

    pub fn store(&self, id: &str) -> Result<Arc<dyn Store>> {
        self.by_id(id)
            .and_then(|c| c.as_store())
            .ok_or(Error::UnresolvedReference { kind: "store", id: id.to_string() })
    }

    pub fn stream(&self, id: &str) -> Result<Arc<dyn LogStream>> {
        self.by_id(id)
            .and_then(|c| c.as_stream())
            .ok_or(Error::UnresolvedReference { kind: "stream", id: id.to_string() })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;

    struct Dummy {
        id: Option<String>,
    }

    #[async_trait::async_trait]
    impl Component for Dummy {
        fn namespace(&self) -> &'static str {
            "test.dummy"
        }
        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }
    }

    fn dummy_factory(block: &Block) -> Result<Arc<dyn Component>> {
        let id = block
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(Arc::new(Dummy { id }))
    }

    #[test]
    fn duplicate_namespace_is_rejected() {
        let mut registry = Registry::new();
        registry.register("test.dummy", dummy_factory).unwrap();
        let err = registry.register("test.dummy", dummy_factory).unwrap_err();
        assert!(matches!(err, Error::DuplicateNamespace(ns) if ns == "test.dummy"));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut registry = Registry::new();
        registry
            .insert(Arc::new(Dummy { id: Some("a".into()) }))
            .unwrap();
        let err = registry
            .insert(Arc::new(Dummy { id: Some("a".into()) }))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn distinct_ids_are_all_retrievable() {
        let mut registry = Registry::new();
        for name in ["a", "b", "c"] {
            registry
                .insert(Arc::new(Dummy { id: Some(name.into()) }))
                .unwrap();
        }
        assert_eq!(registry.components().len(), 3);
        for name in ["a", "b", "c"] {
            assert!(registry.by_id(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn unknown_namespace_fails_lookup() {
        let registry = Registry::new();
        assert!(matches!(
            registry.factory("nope"),
            Err(Error::UnknownNamespace(_))
        ));
    }
}
