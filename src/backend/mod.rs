//! Backend servers and the per-service backend registry
//!
//! A [`Server`] is shared process-wide and carries the status a monitor
//! reports for it (role, running flag, replication lag). Each service builds
//! a [`BackendRegistry`] over the servers it routes to.

mod registry;

pub use registry::{normalize_weights, Backend, BackendRegistry, RegistryError, WEIGHT_SCALE};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::warn;

use crate::config::{ServerConfig, ServerRole};

/// Monitored status of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStatus {
    pub role: ServerRole,
    pub running: bool,
    /// Replication lag, if the server is a replica and the lag is known
    pub replication_lag: Option<Duration>,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            role: ServerRole::Unknown,
            running: true,
            replication_lag: None,
        }
    }
}

/// A backend database server
#[derive(Debug)]
pub struct Server {
    name: String,
    host: String,
    port: u16,
    parameters: HashMap<String, String>,
    status: RwLock<ServerStatus>,
    /// Open connections across every service
    connections: AtomicUsize,
    /// Statements currently awaiting a reply
    operations: AtomicUsize,
}

impl Server {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, role: ServerRole) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            parameters: HashMap::new(),
            status: RwLock::new(ServerStatus {
                role,
                ..ServerStatus::default()
            }),
            connections: AtomicUsize::new(0),
            operations: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let mut server = Self::new(&config.name, &config.host, config.port, config.role);
        server.parameters = config.parameters.clone();
        server
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ServerStatus) {
        *self.status.write() = status;
    }

    pub fn set_role(&self, role: ServerRole) {
        self.status.write().role = role;
    }

    pub fn set_running(&self, running: bool) {
        self.status.write().running = running;
    }

    pub fn set_replication_lag(&self, lag: Option<Duration>) {
        self.status.write().replication_lag = lag;
    }

    pub fn is_running(&self) -> bool {
        self.status.read().running
    }

    pub fn is_primary(&self) -> bool {
        let status = self.status.read();
        status.running && status.role == ServerRole::Primary
    }

    pub fn is_replica(&self) -> bool {
        let status = self.status.read();
        status.running && status.role == ServerRole::Replica
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn connection_closed(&self) {
        if !saturating_decrement(&self.connections) {
            warn!(server = %self.name, "Server connection count already zero");
        }
    }

    pub(crate) fn operation_started(&self) {
        self.operations.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn operation_finished(&self) {
        saturating_decrement(&self.operations);
    }
}

/// Decrement without wrapping; returns false if the counter was already zero
pub(crate) fn saturating_decrement(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}

/// Lookup of servers by name
pub trait ServerDirectory: Send + Sync {
    fn find_server_by_name(&self, name: &str) -> Option<Arc<Server>>;
}

/// Server directory built from the `[[servers]]` configuration table
#[derive(Debug, Default)]
pub struct Directory {
    servers: RwLock<HashMap<String, Arc<Server>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(servers: &[ServerConfig]) -> Self {
        let directory = Self::new();
        for config in servers {
            directory.insert(Arc::new(Server::from_config(config)));
        }
        directory
    }

    /// Add or replace a server
    pub fn insert(&self, server: Arc<Server>) {
        self.servers.write().insert(server.name().to_string(), server);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }
}

impl ServerDirectory for Directory {
    fn find_server_by_name(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_lookup() {
        let configs = vec![
            ServerConfig {
                name: "db1".into(),
                host: "10.0.0.1".into(),
                port: 3306,
                role: ServerRole::Primary,
                parameters: HashMap::new(),
            },
            ServerConfig {
                name: "db2".into(),
                host: "10.0.0.2".into(),
                port: 3307,
                role: ServerRole::Replica,
                parameters: HashMap::from([("serversize".to_string(), "20".to_string())]),
            },
        ];
        let directory = Directory::from_config(&configs);
        assert_eq!(directory.len(), 2);

        let db2 = directory.find_server_by_name("db2").unwrap();
        assert_eq!(db2.addr(), "10.0.0.2:3307");
        assert!(db2.is_replica());
        assert_eq!(db2.parameter("serversize"), Some("20"));

        assert!(directory.find_server_by_name("db3").is_none());
    }

    #[test]
    fn test_status_updates() {
        let server = Server::new("db1", "localhost", 3306, ServerRole::Replica);
        assert!(server.is_replica());
        assert!(!server.is_primary());

        server.set_role(ServerRole::Primary);
        assert!(server.is_primary());

        server.set_running(false);
        assert!(!server.is_primary());
        assert!(!server.is_running());
    }

    #[test]
    fn test_connection_counters_never_wrap() {
        let server = Server::new("db1", "localhost", 3306, ServerRole::Primary);
        server.connection_opened();
        server.connection_closed();
        server.connection_closed();
        assert_eq!(server.connections(), 0);

        server.operation_finished();
        assert_eq!(server.operations(), 0);
    }
}
