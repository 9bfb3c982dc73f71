//! Router instance: one per service
//!
//! Owns the backend registry and the arena of live sessions, and hands every
//! new session an immutable snapshot of the service's router settings.

mod rw_split;
mod selector;

pub use rw_split::{RouteTarget, RwSplitter, StatementInfo};
pub use selector::{
    selector_for, within_lag, BackendSelector, LeastLoadSelector, WeightedRandomSelector,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{BackendRegistry, RegistryError, ServerDirectory};
use crate::classifier::{Classifier, SqlClassifier};
use crate::config::{ConfigError, RouterSettings, ServiceConfig};
use crate::metrics::metrics;
use crate::session::{RouterSession, SessionContext, SessionError};
use crate::transport::{Endpoint, PipePool};

/// Handle of a session in the instance arena
pub type SessionId = u64;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Router settings snapshot; sessions keep the one they were opened with
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bumped on every reconfiguration
    pub version: u64,
    pub settings: RouterSettings,
}

impl RouterConfig {
    pub fn new(settings: RouterSettings) -> Self {
        Self {
            version: 1,
            settings,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.connect_timeout_ms)
    }

    pub fn max_replica_lag(&self) -> Option<Duration> {
        self.settings.max_replica_lag_ms.map(Duration::from_millis)
    }
}

/// Aggregate counters of one router instance
#[derive(Debug, Default)]
pub struct RouterStats {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    open_failures: AtomicU64,
    routed_primary: AtomicU64,
    routed_replica: AtomicU64,
    routed_named: AtomicU64,
    session_commands: AtomicU64,
    failovers: AtomicU64,
    failed_failovers: AtomicU64,
}

/// Plain copy of [`RouterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub open_failures: u64,
    pub routed_primary: u64,
    pub routed_replica: u64,
    pub routed_named: u64,
    pub session_commands: u64,
    pub failovers: u64,
    pub failed_failovers: u64,
}

impl RouterStats {
    pub(crate) fn record_open(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        metrics().record_session_opened();
    }

    pub(crate) fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
        metrics().session_open_failures.inc();
    }

    pub(crate) fn record_close(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        metrics().record_session_closed();
    }

    pub(crate) fn record_route(&self, target: &str) {
        let counter = match target {
            "replica" => &self.routed_replica,
            "named" => &self.routed_named,
            _ => &self.routed_primary,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics().record_route(target);
    }

    pub(crate) fn record_session_command(&self) {
        self.session_commands.fetch_add(1, Ordering::Relaxed);
        metrics().session_commands_total.inc();
    }

    pub(crate) fn record_failover(&self, result: &str) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
        if result == "failed" {
            self.failed_failovers.fetch_add(1, Ordering::Relaxed);
        }
        metrics().record_failover(result);
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            routed_primary: self.routed_primary.load(Ordering::Relaxed),
            routed_replica: self.routed_replica.load(Ordering::Relaxed),
            routed_named: self.routed_named.load(Ordering::Relaxed),
            session_commands: self.session_commands.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            failed_failovers: self.failed_failovers.load(Ordering::Relaxed),
        }
    }
}

struct InstanceInner {
    config: Arc<RouterConfig>,
    registry: Arc<BackendRegistry>,
    selector: Arc<dyn BackendSelector>,
    sessions: HashMap<SessionId, Arc<RouterSession>>,
}

/// Read/write split router of one service
pub struct RouterInstance {
    name: String,
    inner: RwLock<InstanceInner>,
    directory: Arc<dyn ServerDirectory>,
    classifier: Arc<dyn Classifier>,
    pipes: Arc<PipePool>,
    stats: Arc<RouterStats>,
    next_id: AtomicU64,
}

impl RouterInstance {
    /// Build the router of `service` over the servers in `directory`
    pub fn new(
        service: &ServiceConfig,
        directory: Arc<dyn ServerDirectory>,
        pipes: Arc<PipePool>,
    ) -> Result<Self, RouterError> {
        let settings = service.effective_router()?;
        let registry = BackendRegistry::build(service, directory.as_ref())?;
        Ok(Self::from_parts(&service.name, settings, registry, directory, pipes))
    }

    pub fn from_parts(
        name: &str,
        settings: RouterSettings,
        registry: BackendRegistry,
        directory: Arc<dyn ServerDirectory>,
        pipes: Arc<PipePool>,
    ) -> Self {
        info!(
            service = %name,
            backends = registry.len(),
            criterion = ?settings.selection_criterion,
            "Router instance created"
        );
        Self {
            name: name.to_string(),
            inner: RwLock::new(InstanceInner {
                selector: Arc::from(selector_for(settings.selection_criterion)),
                config: Arc::new(RouterConfig::new(settings)),
                registry: Arc::new(registry),
                sessions: HashMap::new(),
            }),
            directory,
            classifier: Arc::new(SqlClassifier::new()),
            pipes,
            stats: Arc::new(RouterStats::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Use a custom statement classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Open and register a session for an accepted client
    pub async fn open_session(&self, client: Arc<Endpoint>) -> Result<Arc<RouterSession>, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = {
            let inner = self.inner.read();
            SessionContext {
                config: inner.config.clone(),
                registry: inner.registry.clone(),
                selector: inner.selector.clone(),
                classifier: self.classifier.clone(),
                directory: self.directory.clone(),
                pipes: self.pipes.clone(),
                stats: self.stats.clone(),
            }
        };

        let session = match RouterSession::open(id, ctx, client).await {
            Ok(session) => session,
            Err(e) => {
                warn!(service = %self.name, session_id = id, error = %e, "Failed to open session");
                self.stats.record_open_failure();
                return Err(e);
            }
        };

        self.inner.write().sessions.insert(id, session.clone());
        self.stats.record_open();
        session.start().await;
        Ok(session)
    }

    /// Remove a closed session from the arena
    ///
    /// Refuses (and logs) sessions that are still open.
    pub fn free_session(&self, session: &RouterSession) -> bool {
        if !session.is_closed() {
            warn!(service = %self.name, session_id = session.id(), "Refusing to free an open session");
            return false;
        }
        self.inner.write().sessions.remove(&session.id()).is_some()
    }

    /// Adopt new settings and servers; running sessions keep their snapshot
    pub fn reconfigure(&self, service: &ServiceConfig) -> Result<u64, RouterError> {
        let settings = service.effective_router()?;
        let registry = BackendRegistry::build(service, self.directory.as_ref())?;

        let mut inner = self.inner.write();
        let version = inner.config.version + 1;
        inner.selector = Arc::from(selector_for(settings.selection_criterion));
        inner.config = Arc::new(RouterConfig { version, settings });
        inner.registry = Arc::new(registry);
        info!(service = %self.name, version = version, "Router reconfigured");
        Ok(version)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> Arc<RouterConfig> {
        self.inner.read().config.clone()
    }

    pub fn registry(&self) -> Arc<BackendRegistry> {
        self.inner.read().registry.clone()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<RouterSession>> {
        self.inner.read().sessions.get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pipes(&self) -> &Arc<PipePool> {
        &self.pipes
    }
}
