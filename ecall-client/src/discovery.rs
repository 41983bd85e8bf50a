//! Node-list providers.
//!
//! The client asks its provider for a fresh node list on every call and treats
//! the answer as a snapshot for that one routing decision. Providers that talk
//! to a registry refresh on their own schedule; [`StaticNodes`] is an
//! in-memory table for fixed deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;

use ecall_common::error::{RpcError, ERROR_SERVICE_NOT_FOUND};
use ecall_common::types::Node;
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("service {0} not found")]
    NotFound(String),

    #[error("node provider unavailable: {0}")]
    Unavailable(String),
}

impl From<DiscoveryError> for RpcError {
    fn from(err: DiscoveryError) -> Self {
        RpcError::system(ERROR_SERVICE_NOT_FOUND, err.to_string())
    }
}

/// Source of candidate nodes per service.
pub trait NodeProvider: Send + Sync + 'static {
    fn nodes(&self, service: &str) -> Result<Vec<Arc<Node>>, DiscoveryError>;
}

/// Fixed node lists keyed by service name.
#[derive(Default)]
pub struct StaticNodes {
    services: RwLock<HashMap<String, Vec<Arc<Node>>>>,
}

impl StaticNodes {
    pub fn new() -> Self {
        StaticNodes::default()
    }

    /// Builder form of [`StaticNodes::set_nodes`].
    pub fn with_service(self, service: &str, nodes: Vec<Node>) -> Self {
        self.set_nodes(service, nodes);
        self
    }

    /// Replaces the node list of `service`.
    ///
    /// Nodes already known (same ip, port and weight) keep their `Arc`, so
    /// in-flight counters survive a refresh.
    pub fn set_nodes(&self, service: &str, nodes: Vec<Node>) {
        let mut services = self.services.write();
        let previous = services.remove(service).unwrap_or_default();
        let refreshed = nodes
            .into_iter()
            .map(|node| {
                previous
                    .iter()
                    .find(|known| known.as_ref() == &node)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(node))
            })
            .collect();
        services.insert(service.to_string(), refreshed);
    }

    pub fn remove_service(&self, service: &str) -> bool {
        self.services.write().remove(service).is_some()
    }
}

impl NodeProvider for StaticNodes {
    fn nodes(&self, service: &str) -> Result<Vec<Arc<Node>>, DiscoveryError> {
        self.services
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(service.to_string()))
    }
}
