//! Router sessions
//!
//! A [`RouterSession`] is the per-client aggregate: one [`BackendRef`] per
//! backend of the service, the session-command log and the transaction state
//! used to pick a backend for every client statement. Replies never pass
//! through the session; each in-use backend has a pump task that splices
//! them straight to the client.

mod backend_ref;
mod failover;
mod sescmd;
mod state;

pub use backend_ref::{BackendRef, RefState};
pub use sescmd::{
    replay_pending, replay_until, CommandSink, ReplayCursor, SessionCommand, SessionCommandLog,
};
pub use state::{ClientState, SessionState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, BackendRegistry, Server, ServerDirectory};
use crate::classifier::Classifier;
use crate::protocol::Packet;
use crate::router::{
    within_lag, BackendSelector, RouteTarget, RouterConfig, RouterStats, RwSplitter, SessionId,
    StatementInfo,
};
use crate::transport::{Endpoint, PipePool, TransportError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not enough backends: {available} available, {required} required")]
    NotEnoughBackends { required: usize, available: usize },

    #[error("No primary backend available")]
    NoPrimary,

    #[error("Session closed")]
    Closed,

    #[error("Session is not ready to route")]
    NotReady,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Everything a session needs from its router instance, captured at open time
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<RouterConfig>,
    pub registry: Arc<BackendRegistry>,
    pub selector: Arc<dyn BackendSelector>,
    pub classifier: Arc<dyn Classifier>,
    pub directory: Arc<dyn ServerDirectory>,
    pub pipes: Arc<PipePool>,
    pub stats: Arc<RouterStats>,
}

struct SessionInner {
    /// One per registry slot, indexed like the registry
    refs: Vec<BackendRef>,
    primary: usize,
    log: SessionCommandLog,
    client_state: ClientState,
    closed: bool,
}

/// Point-in-time view of a session, for logging and tests
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub primary: String,
    /// In-use replicas
    pub replicas: Vec<String>,
    pub log_len: u64,
    /// Replay cursor of every in-use backend
    pub cursors: Vec<(String, u64)>,
    pub in_transaction: bool,
    pub database: Option<String>,
}

/// Per-client read/write split session
pub struct RouterSession {
    id: SessionId,
    ctx: SessionContext,
    client: Arc<Endpoint>,
    inner: Mutex<SessionInner>,
    state: watch::Sender<SessionState>,
    closed: AtomicBool,
}

/// Resolve, connect and wait for the connection to be established
async fn connect_server(server: &Server, timeout: Duration) -> Result<Arc<Endpoint>, TransportError> {
    let addr = Endpoint::resolve(server.host(), server.port()).await?;
    let endpoint = Endpoint::connect(addr)?;
    endpoint.established(timeout).await?;
    Ok(endpoint)
}

async fn connect_all(
    backends: &[Arc<Backend>],
    timeout: Duration,
) -> Vec<Result<Arc<Endpoint>, TransportError>> {
    join_all(backends.iter().map(|b| connect_server(b.server(), timeout))).await
}

impl RouterSession {
    /// Connect a primary and up to `max_replicas` replicas for a new client
    ///
    /// Nothing is left connected when this fails. The session is returned in
    /// `Setup`; [`RouterSession::start`] makes it route.
    pub async fn open(
        id: SessionId,
        ctx: SessionContext,
        client: Arc<Endpoint>,
    ) -> Result<Arc<Self>, SessionError> {
        let settings = &ctx.config.settings;
        let registry = ctx.registry.clone();

        if registry.len() < settings.min_backends {
            return Err(SessionError::NotEnoughBackends {
                required: settings.min_backends,
                available: registry.len(),
            });
        }

        let primary = registry
            .backends()
            .iter()
            .find(|b| b.can_be_primary())
            .cloned()
            .ok_or(SessionError::NoPrimary)?;

        let max_lag = ctx.config.max_replica_lag();
        let candidates: Vec<Arc<Backend>> = registry
            .backends()
            .iter()
            .filter(|b| b.index() != primary.index() && b.can_be_replica() && within_lag(b, max_lag))
            .cloned()
            .collect();
        let mut candidates = ctx.selector.rank(candidates).into_iter();
        let timeout = ctx.config.connect_timeout();

        let first: Vec<Arc<Backend>> = candidates.by_ref().take(settings.max_replicas).collect();
        let (primary_result, first_results) = tokio::join!(
            connect_server(primary.server(), timeout),
            connect_all(&first, timeout)
        );

        let primary_endpoint = match primary_result {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(session_id = id, backend = %primary.name(), error = %e, "Primary connect failed");
                first_results.iter().flatten().for_each(|ep| {
                    ep.close();
                });
                return Err(SessionError::NoPrimary);
            }
        };

        // replace failed replicas with the next-ranked candidates until none are left
        let mut replicas: Vec<(Arc<Backend>, Arc<Endpoint>)> = Vec::new();
        let mut round: Vec<_> = first.into_iter().zip(first_results).collect();
        loop {
            let mut failed = 0;
            for (backend, result) in round {
                match result {
                    Ok(endpoint) => replicas.push((backend, endpoint)),
                    Err(e) => {
                        warn!(session_id = id, backend = %backend.name(), error = %e, "Replica connect failed");
                        failed += 1;
                    }
                }
            }
            if failed == 0 {
                break;
            }
            let retry: Vec<Arc<Backend>> = candidates.by_ref().take(failed).collect();
            if retry.is_empty() {
                break;
            }
            let results = connect_all(&retry, timeout).await;
            round = retry.into_iter().zip(results).collect();
        }

        let connected = 1 + replicas.len();
        if connected < settings.min_backends {
            primary_endpoint.close();
            replicas.iter().for_each(|(_, ep)| {
                ep.close();
            });
            return Err(SessionError::NotEnoughBackends {
                required: settings.min_backends,
                available: connected,
            });
        }

        let mut refs: Vec<BackendRef> = registry.backends().iter().cloned().map(BackendRef::new).collect();
        refs[primary.index()].mark_in_use(primary_endpoint);
        for (backend, endpoint) in replicas {
            refs[backend.index()].mark_in_use(endpoint);
        }

        info!(
            session_id = id,
            primary = %primary.name(),
            replicas = connected - 1,
            config_version = ctx.config.version,
            "Session opened"
        );

        let (state, _) = watch::channel(SessionState::Setup);
        Ok(Arc::new(Self {
            id,
            ctx,
            client,
            inner: Mutex::new(SessionInner {
                refs,
                primary: primary.index(),
                log: SessionCommandLog::new(),
                client_state: ClientState::new(),
                closed: false,
            }),
            state,
            closed: AtomicBool::new(false),
        }))
    }

    /// Start relaying replies and accept backend events
    pub async fn start(self: &Arc<Self>) {
        {
            let inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            for (slot, r) in inner.refs.iter().enumerate() {
                if let Some(endpoint) = r.endpoint() {
                    self.spawn_pump(slot, r.generation(), endpoint.clone());
                }
            }
        }
        self.transition(SessionState::RouterReady);
    }

    /// Send a client packet to the backend it belongs on
    ///
    /// Returns the number of bytes written to the backend.
    #[instrument(skip_all, fields(session_id = self.id))]
    pub async fn route(&self, packet: &Packet) -> Result<usize, SessionError> {
        let payload = &packet.payload;
        let classifier = &self.ctx.classifier;
        let session_mutating = classifier.is_session_mutating(payload);
        let info = StatementInfo {
            session_mutating,
            read_only: !session_mutating && classifier.classify_read_only(payload),
            hint: classifier.route_hint(payload),
        };
        let effect = classifier.transaction_effect(payload);
        let database = classifier.database_change(payload);

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(SessionError::Closed);
        }
        if self.state() != SessionState::RouterReady {
            return Err(SessionError::NotReady);
        }

        let target = RwSplitter::route(&info, inner.client_state.is_in_transaction());
        inner.client_state.apply(effect);
        if let Some(db) = database {
            inner.client_state.change_database(db);
        }

        let seq = if session_mutating {
            let seq = inner.log.append(payload.clone());
            self.ctx.stats.record_session_command();
            Some(seq)
        } else {
            None
        };

        let (slot, label) = self.pick_slot(&inner, &target);
        let SessionInner { refs, log, .. } = &mut *inner;
        let r = &mut refs[slot];
        let endpoint = r.endpoint().cloned().ok_or(SessionError::NoPrimary)?;

        match seq {
            Some(seq) => {
                replay_until(log, &mut r.cursor, seq - 1, &*endpoint).await?;
            }
            None => {
                replay_pending(log, &mut r.cursor, &*endpoint).await?;
            }
        }

        let sent = endpoint.write_packet(packet).await?;
        if sent == 0 {
            return Err(TransportError::Closed.into());
        }
        if let Some(seq) = seq {
            r.cursor.advance_to(seq);
        }
        r.mark_waiting();

        self.ctx.stats.record_route(label);
        debug!(
            backend = %r.backend().name(),
            target = label,
            bytes = sent,
            "Routed statement"
        );
        Ok(sent)
    }

    fn pick_slot(&self, inner: &SessionInner, target: &RouteTarget) -> (usize, &'static str) {
        match target {
            RouteTarget::Primary => (inner.primary, RouteTarget::Primary.label()),
            RouteTarget::Replica => match self.best_replica(inner) {
                Some(slot) => (slot, target.label()),
                None => {
                    debug!(session_id = self.id, "No usable replica, reading from primary");
                    (inner.primary, RouteTarget::Primary.label())
                }
            },
            RouteTarget::Named(name) => {
                let slot = inner
                    .refs
                    .iter()
                    .position(|r| r.is_in_use() && r.backend().name() == name);
                match slot {
                    Some(slot) => (slot, target.label()),
                    None => {
                        if self.ctx.directory.find_server_by_name(name).is_none() {
                            warn!(session_id = self.id, server = %name, "Routing hint names an unknown server");
                        } else {
                            debug!(session_id = self.id, server = %name, "Hinted server not connected, using primary");
                        }
                        (inner.primary, RouteTarget::Primary.label())
                    }
                }
            }
        }
    }

    /// Best in-use replica by the configured criterion
    fn best_replica(&self, inner: &SessionInner) -> Option<usize> {
        let max_lag = self.ctx.config.max_replica_lag();
        let candidates: Vec<Arc<Backend>> = inner
            .refs
            .iter()
            .enumerate()
            .filter(|(slot, r)| {
                *slot != inner.primary
                    && r.is_in_use()
                    && r.backend().can_be_replica()
                    && within_lag(r.backend(), max_lag)
            })
            .map(|(_, r)| r.backend().clone())
            .collect();

        self.ctx.selector.select(candidates).map(|b| b.index())
    }

    /// Close every backend connection; false if already closed
    pub async fn close(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return false;
        }
        self.shutdown_locked(&mut inner);
        info!(session_id = self.id, "Session closed");
        true
    }

    fn shutdown_locked(&self, inner: &mut SessionInner) {
        inner.closed = true;
        self.closed.store(true, Ordering::Release);
        self.transition(SessionState::Stopping);

        for r in inner.refs.iter_mut() {
            if let Some(endpoint) = r.mark_closed() {
                endpoint.close();
            }
        }
        self.ctx.stats.record_close();
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                moved = true;
            }
            moved
        });
        if !moved {
            debug!(session_id = self.id, to = ?next, "Session state unchanged");
        }
        moved
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        let name = |slot: usize| inner.refs[slot].backend().name().to_string();

        SessionSnapshot {
            state: self.state(),
            primary: name(inner.primary),
            replicas: inner
                .refs
                .iter()
                .enumerate()
                .filter(|(slot, r)| *slot != inner.primary && r.is_in_use())
                .map(|(slot, _)| name(slot))
                .collect(),
            log_len: inner.log.len(),
            cursors: inner
                .refs
                .iter()
                .filter(|r| r.is_in_use())
                .map(|r| (r.backend().name().to_string(), r.cursor().position()))
                .collect(),
            in_transaction: inner.client_state.is_in_transaction(),
            database: inner.client_state.database.clone(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client(&self) -> &Arc<Endpoint> {
        &self.client
    }

    pub fn config(&self) -> &Arc<RouterConfig> {
        &self.ctx.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RouterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterSession")
            .field("id", &self.id)
            .field("client", &self.client.peer_addr())
            .field("state", &self.state())
            .finish()
    }
}
