use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Backend servers known to the proxy
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Read/write split services (one listener each)
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub pipe_pool: PipePoolConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ============================================================================
// Servers
// ============================================================================

/// A backend database server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Unique server name, referenced by services
    pub name: String,
    /// Hostname or IP
    pub host: String,
    /// Port number
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Role reported for this server until a monitor updates it
    #[serde(default)]
    pub role: ServerRole,
    /// Free-form server parameters (e.g. the weighting parameter named by `weightby`)
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

fn default_server_port() -> u16 {
    3306
}

/// Replication role of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    #[serde(alias = "master")]
    Primary,
    #[serde(alias = "slave")]
    Replica,
    #[default]
    Unknown,
}

impl ServerConfig {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Services
// ============================================================================

/// A read/write split service: a listener plus the servers it routes to
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name (used in logs and metrics)
    pub name: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Names of the servers this service routes to, in configuration order
    #[serde(default)]
    pub servers: Vec<String>,
    /// Server parameter used to weight read routing
    #[serde(default)]
    pub weightby: Option<String>,
    /// Comma-separated `key=value` overrides for `router`
    #[serde(default)]
    pub router_options: Option<String>,
    #[serde(default)]
    pub router: RouterSettings,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    4006
}

impl ServiceConfig {
    /// Service with default listener and router settings
    pub fn new(name: impl Into<String>, servers: Vec<String>) -> Self {
        Self {
            name: name.into(),
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            servers,
            weightby: None,
            router_options: None,
            router: RouterSettings::default(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

/// How replicas are ranked when connecting and when routing reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionCriterion {
    /// Fewest connections to the server across all services
    LeastGlobalConnections,
    /// Fewest connections opened by this service
    #[default]
    LeastRouterConnections,
    /// Smallest replication lag
    LeastBehindPrimary,
    /// Fewest statements currently awaiting a reply
    LeastCurrentOperations,
    /// Random pick proportional to the normalized weight
    WeightedRandom,
}

impl std::str::FromStr for SelectionCriterion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "least_global_connections" => Ok(Self::LeastGlobalConnections),
            "least_router_connections" => Ok(Self::LeastRouterConnections),
            "least_behind_primary" | "least_behind_master" => Ok(Self::LeastBehindPrimary),
            "least_current_operations" => Ok(Self::LeastCurrentOperations),
            "weighted_random" => Ok(Self::WeightedRandom),
            other => Err(format!("unknown selection criterion '{}'", other)),
        }
    }
}

/// Router settings for a service
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSettings {
    /// Minimum number of backends (primary + replicas) a session needs
    #[serde(default = "default_min_backends")]
    pub min_backends: usize,
    /// Maximum number of replicas a session connects to
    #[serde(default = "default_max_replicas")]
    pub max_replicas: usize,
    #[serde(default)]
    pub selection_criterion: SelectionCriterion,
    /// Replicas lagging more than this are not used for reads
    #[serde(default)]
    pub max_replica_lag_ms: Option<u64>,
    /// Timeout for establishing a backend connection (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Consecutive reconnects of one backend slot before the session gives up on it
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_min_backends() -> usize {
    2
}

fn default_max_replicas() -> usize {
    1
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            min_backends: default_min_backends(),
            max_replicas: default_max_replicas(),
            selection_criterion: SelectionCriterion::default(),
            max_replica_lag_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

// ============================================================================
// Pipe pool / metrics
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PipePoolConfig {
    /// Number of pipes shared by all sessions
    #[serde(default = "default_pipe_pool_size")]
    pub size: usize,
}

fn default_pipe_pool_size() -> usize {
    32
}

impl Default for PipePoolConfig {
    fn default() -> Self {
        Self {
            size: default_pipe_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9104".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}
