use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::error::{Result, RssError};

pub const DEFAULT_DATA_CENTER: &str = "dc1";
pub const DEFAULT_CLUSTER: &str = "default";

// ---------------------------------------------------------------------------
// ServerDetail
// ---------------------------------------------------------------------------

/// Address of one shuffle server as published to a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerDetail {
    // ---
    pub server_id: String,
    pub host: String,
    pub port: u16,
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Server discovery.  Clients only ever *resolve* through it; how servers
/// are tracked is up to the implementation.
pub trait ServiceRegistry: Send + Sync {
    // ---
    fn register_server(&self, data_center: &str, cluster: &str, server: ServerDetail) -> Result<()>;

    /// Servers known for `(data_center, cluster)`.  An empty list is an error:
    /// a writer has nowhere to send data.
    fn get_servers(&self, data_center: &str, cluster: &str) -> Result<Vec<ServerDetail>>;
}

// ---------------------------------------------------------------------------
// InMemoryServiceRegistry
// ---------------------------------------------------------------------------

/// Process-local registry for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryServiceRegistry {
    servers: RwLock<HashMap<(String, String), Vec<ServerDetail>>>,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceRegistry for InMemoryServiceRegistry {
    // ---
    fn register_server(&self, data_center: &str, cluster: &str, server: ServerDetail) -> Result<()> {
        // ---
        let mut servers = self
            .servers
            .write()
            .map_err(|_| RssError::Transport("service registry lock poisoned".into()))?;
        let list = servers
            .entry((data_center.to_string(), cluster.to_string()))
            .or_default();
        // Re-registration replaces the previous address of the same server.
        list.retain(|s| s.server_id != server.server_id);
        tracing::info!(data_center, cluster, server_id = %server.server_id, "server registered");
        list.push(server);
        Ok(())
    }

    fn get_servers(&self, data_center: &str, cluster: &str) -> Result<Vec<ServerDetail>> {
        // ---
        let servers = self
            .servers
            .read()
            .map_err(|_| RssError::Transport("service registry lock poisoned".into()))?;
        match servers.get(&(data_center.to_string(), cluster.to_string())) {
            Some(list) if !list.is_empty() => Ok(list.clone()),
            _ => Err(RssError::Transport(format!(
                "no shuffle server registered for {data_center}/{cluster}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StandaloneServiceRegistry
// ---------------------------------------------------------------------------

/// A single, statically configured server.  Registration is a no-op.
#[derive(Debug, Clone)]
pub struct StandaloneServiceRegistry {
    server: ServerDetail,
}

impl StandaloneServiceRegistry {
    pub fn new(server: ServerDetail) -> Self {
        Self { server }
    }
}

impl ServiceRegistry for StandaloneServiceRegistry {
    // ---
    fn register_server(&self, _data_center: &str, _cluster: &str, _server: ServerDetail) -> Result<()> {
        Ok(())
    }

    fn get_servers(&self, _data_center: &str, _cluster: &str) -> Result<Vec<ServerDetail>> {
        Ok(vec![self.server.clone()])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
