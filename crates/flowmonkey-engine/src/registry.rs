//! Flow and handler registries
//!
//! Both registries are process-scoped and write-once after bootstrap:
//! registration happens during startup, lookups happen on the hot path.
//! Duplicate registration (same flow id + version, same handler type) is
//! rejected.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use flowmonkey_core::{Flow, HandlerDescriptor, StepHandler};

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Flow id + version already registered
    #[error("flow already registered: {0}@{1}")]
    DuplicateFlow(String, String),

    /// Handler type already registered
    #[error("handler already registered: {0}")]
    DuplicateHandler(String),

    /// Version string is not `major.minor.patch`
    #[error("invalid version string: {0}")]
    InvalidVersion(String),
}

/// Semver sort key
type VersionKey = (u64, u64, u64);

/// Parse a `major.minor.patch` version string
fn parse_version(version: &str) -> Option<VersionKey> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// Versioned flow registry
///
/// Flows are immutable once registered; `get` without a version pin returns
/// the highest registered version.
#[derive(Default)]
pub struct FlowRegistry {
    flows: RwLock<HashMap<String, BTreeMap<VersionKey, Flow>>>,
}

impl FlowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow; the `(id, version)` pair must be new
    pub fn register(&self, flow: Flow) -> Result<(), RegistryError> {
        let key = parse_version(&flow.version)
            .ok_or_else(|| RegistryError::InvalidVersion(flow.version.clone()))?;

        let mut flows = self.flows.write();
        let versions = flows.entry(flow.id.clone()).or_default();
        if versions.contains_key(&key) {
            return Err(RegistryError::DuplicateFlow(flow.id, flow.version));
        }

        info!(flow_id = %flow.id, version = %flow.version, "registered flow");
        versions.insert(key, flow);
        Ok(())
    }

    /// Look up a flow; `None` version means the latest
    pub fn get(&self, flow_id: &str, version: Option<&str>) -> Option<Flow> {
        let flows = self.flows.read();
        let versions = flows.get(flow_id)?;
        match version {
            Some(version) => versions.get(&parse_version(version)?).cloned(),
            None => versions.values().next_back().cloned(),
        }
    }

    /// The highest registered version of a flow
    pub fn latest_of(&self, flow_id: &str) -> Option<Flow> {
        self.get(flow_id, None)
    }

    /// All registered version strings of a flow, ascending
    pub fn versions(&self, flow_id: &str) -> Vec<String> {
        let flows = self.flows.read();
        flows
            .get(flow_id)
            .map(|versions| versions.values().map(|f| f.version.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of registered `(id, version)` pairs
    pub fn len(&self) -> usize {
        self.flows.read().values().map(BTreeMap::len).sum()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.flows.read().is_empty()
    }
}

/// Handler registry keyed by step type
///
/// The descriptor is captured at register time; the engine consults it to
/// decide between in-tick and job-backed execution.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, (HandlerDescriptor, Arc<dyn StepHandler>)>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its descriptor's step type
    pub fn register(&self, handler: Arc<dyn StepHandler>) -> Result<(), RegistryError> {
        let descriptor = handler.descriptor();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&descriptor.step_type) {
            return Err(RegistryError::DuplicateHandler(descriptor.step_type));
        }

        info!(step_type = %descriptor.step_type, stateful = descriptor.stateful, "registered handler");
        handlers.insert(descriptor.step_type.clone(), (descriptor, handler));
        Ok(())
    }

    /// Look up a handler with its descriptor
    pub fn get(&self, step_type: &str) -> Option<(HandlerDescriptor, Arc<dyn StepHandler>)> {
        self.handlers.read().get(step_type).cloned()
    }

    /// Whether a step type is registered
    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.read().contains_key(step_type)
    }

    /// Descriptors of every registered handler
    pub fn list(&self) -> Vec<HandlerDescriptor> {
        let mut descriptors: Vec<HandlerDescriptor> = self
            .handlers
            .read()
            .values()
            .map(|(descriptor, _)| descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.step_type.cmp(&b.step_type));
        descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowmonkey_core::{HandlerParams, StepOutcome};
    use serde_json::json;

    fn flow(id: &str, version: &str) -> Flow {
        serde_json::from_value(json!({
            "id": id,
            "version": version,
            "initialStepId": "only",
            "steps": {
                "only": {"id": "only", "type": "noop"}
            }
        }))
        .unwrap()
    }

    struct Noop;

    #[async_trait]
    impl StepHandler for Noop {
        fn descriptor(&self) -> HandlerDescriptor {
            HandlerDescriptor::new("noop")
        }

        async fn execute(&self, _params: HandlerParams) -> StepOutcome {
            StepOutcome::success(json!(null))
        }
    }

    #[test]
    fn test_register_and_get_latest() {
        let registry = FlowRegistry::new();
        registry.register(flow("hello", "1.0.0")).unwrap();
        registry.register(flow("hello", "1.2.0")).unwrap();
        registry.register(flow("hello", "1.10.0")).unwrap();

        // Numeric ordering, not lexicographic
        let latest = registry.latest_of("hello").unwrap();
        assert_eq!(latest.version, "1.10.0");

        let pinned = registry.get("hello", Some("1.2.0")).unwrap();
        assert_eq!(pinned.version, "1.2.0");

        assert!(registry.get("hello", Some("9.9.9")).is_none());
        assert!(registry.get("unknown", None).is_none());
    }

    #[test]
    fn test_duplicate_flow_rejected() {
        let registry = FlowRegistry::new();
        registry.register(flow("hello", "1.0.0")).unwrap();

        let result = registry.register(flow("hello", "1.0.0"));
        assert!(matches!(result, Err(RegistryError::DuplicateFlow(_, _))));
    }

    #[test]
    fn test_invalid_version_rejected() {
        let registry = FlowRegistry::new();
        let result = registry.register(flow("hello", "not-semver"));
        assert!(matches!(result, Err(RegistryError::InvalidVersion(_))));

        let result = registry.register(flow("hello", "1.0.0.0"));
        assert!(matches!(result, Err(RegistryError::InvalidVersion(_))));
    }

    #[test]
    fn test_versions_ascending() {
        let registry = FlowRegistry::new();
        registry.register(flow("hello", "2.0.0")).unwrap();
        registry.register(flow("hello", "1.0.0")).unwrap();

        assert_eq!(registry.versions("hello"), vec!["1.0.0", "2.0.0"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_handler_registry() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(Noop)).unwrap();

        assert!(registry.contains("noop"));
        assert!(!registry.contains("unknown"));

        let (descriptor, _) = registry.get("noop").unwrap();
        assert_eq!(descriptor.step_type, "noop");
        assert!(!descriptor.stateful);

        let result = registry.register(Arc::new(Noop));
        assert!(matches!(result, Err(RegistryError::DuplicateHandler(_))));

        assert_eq!(registry.list().len(), 1);
    }
}
