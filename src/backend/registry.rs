use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::{saturating_decrement, Server, ServerDirectory};
use crate::config::ServiceConfig;

/// Sum of normalized weights
pub const WEIGHT_SCALE: u32 = 1000;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown server: {0}")]
    UnknownServer(String),
}

/// A server as seen by one service
#[derive(Debug)]
pub struct Backend {
    server: Arc<Server>,
    /// Position in the service's server list
    index: usize,
    /// Normalized read weight (0 excludes the backend from read routing)
    weight: u32,
    /// Connections opened to this backend by the service's sessions
    conn_count: AtomicUsize,
    valid: AtomicBool,
}

impl Backend {
    pub fn new(server: Arc<Server>, index: usize, weight: u32) -> Self {
        Self {
            server,
            index,
            weight,
            conn_count: AtomicUsize::new(0),
            valid: AtomicBool::new(true),
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn name(&self) -> &str {
        self.server.name()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn conn_count(&self) -> usize {
        self.conn_count.load(Ordering::Relaxed)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    /// Valid and the server is running
    pub fn is_usable(&self) -> bool {
        self.is_valid() && self.server.is_running()
    }

    pub fn can_be_primary(&self) -> bool {
        self.is_valid() && self.server.is_primary()
    }

    /// Usable as a read replica: weight 0 opts out
    pub fn can_be_replica(&self) -> bool {
        self.is_valid() && self.weight > 0 && self.server.is_replica()
    }

    pub(crate) fn connection_opened(&self) {
        self.conn_count.fetch_add(1, Ordering::SeqCst);
        self.server.connection_opened();
    }

    pub(crate) fn connection_closed(&self) {
        if !saturating_decrement(&self.conn_count) {
            warn!(backend = %self.name(), "Backend connection count already zero");
        }
        self.server.connection_closed();
    }
}

/// Backends of one service, in configuration order
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<Backend>>,
}

impl BackendRegistry {
    /// Resolve the service's servers and compute their read weights
    pub fn build(
        service: &ServiceConfig,
        directory: &dyn ServerDirectory,
    ) -> Result<Self, RegistryError> {
        let servers = service
            .servers
            .iter()
            .map(|name| {
                directory
                    .find_server_by_name(name)
                    .ok_or_else(|| RegistryError::UnknownServer(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::from_servers(servers, service.weightby.as_deref()))
    }

    pub fn from_servers(servers: Vec<Arc<Server>>, weightby: Option<&str>) -> Self {
        let weights = match weightby {
            Some(param) => {
                let raw: Vec<Option<i64>> = servers
                    .iter()
                    .map(|s| s.parameter(param).and_then(|v| v.trim().parse().ok()))
                    .collect();
                normalize_weights(&raw)
            }
            None => vec![WEIGHT_SCALE; servers.len()],
        };

        let backends = servers
            .into_iter()
            .zip(weights)
            .enumerate()
            .map(|(index, (server, weight))| {
                debug!(backend = %server.name(), weight = weight, "Registered backend");
                Arc::new(Backend::new(server, index, weight))
            })
            .collect();

        Self { backends }
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Backend>> {
        self.backends.get(index)
    }

    pub fn find(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Normalize raw server weights onto a 0..=1000 scale
///
/// Missing, invalid or non-positive values get weight 0. When no value is
/// positive every backend gets the full weight. Positive values are scaled
/// proportionally, rounded so that they sum to exactly [`WEIGHT_SCALE`], and
/// never drop below 1.
pub fn normalize_weights(raw: &[Option<i64>]) -> Vec<u32> {
    let total: i128 = raw
        .iter()
        .flatten()
        .filter(|w| **w > 0)
        .map(|w| *w as i128)
        .sum();

    if total <= 0 {
        return vec![WEIGHT_SCALE; raw.len()];
    }

    let scale = WEIGHT_SCALE as i128;
    let mut weights = vec![0u32; raw.len()];
    let mut remainders = Vec::new();

    for (i, w) in raw.iter().enumerate() {
        if let Some(w) = w.filter(|w| *w > 0) {
            let scaled = w as i128 * scale;
            weights[i] = (scaled / total) as u32;
            remainders.push((scaled % total, i));
        }
    }

    // Largest remainder gets the leftover points
    let assigned: u32 = weights.iter().sum();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, i) in remainders.iter().take((WEIGHT_SCALE - assigned) as usize) {
        weights[*i] += 1;
    }

    let starved: Vec<usize> = remainders
        .iter()
        .map(|(_, i)| *i)
        .filter(|i| weights[*i] == 0)
        .collect();
    for i in starved {
        if let Some(richest) = (0..weights.len()).max_by_key(|j| (weights[*j], std::cmp::Reverse(*j))) {
            if weights[richest] > 1 {
                weights[richest] -= 1;
                weights[i] = 1;
            }
        }
    }

    weights
}
