//! Backend pumps and failover
//!
//! Each in-use backend connection has a pump task that relays replies to the
//! client. When the connection hangs up or fails, the pump hands the event to
//! the session, which replaces that one connection and keeps routing.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{replay_pending, RouterSession, SessionInner, SessionState};
use crate::backend::{Backend, Server};
use crate::protocol::ErrPacket;
use crate::transport::{Endpoint, RelayOutcome, TransportError};

/// Something went wrong with one backend connection
#[derive(Debug)]
pub(crate) enum BackendEvent {
    /// The backend closed the connection
    Hangup,
    /// The connection never got established
    ConnectFailed(TransportError),
    Error(TransportError),
}

impl fmt::Display for BackendEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendEvent::Hangup => write!(f, "hangup"),
            BackendEvent::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            BackendEvent::Error(e) => write!(f, "{}", e),
        }
    }
}

/// How a failover ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailoverResult {
    /// A new connection took over
    Replaced,
    /// A replica was lost for good; the session keeps running on the rest
    Degraded,
    /// The session had to stop
    Failed,
}

impl FailoverResult {
    pub(crate) fn label(self) -> &'static str {
        match self {
            FailoverResult::Replaced => "replaced",
            FailoverResult::Degraded => "degraded",
            FailoverResult::Failed => "failed",
        }
    }
}

/// Relay replies from one backend connection until it closes or fails
async fn pump(session: Arc<RouterSession>, slot: usize, generation: u64, endpoint: Arc<Endpoint>) {
    let timeout = session.ctx.config.connect_timeout();
    if let Err(e) = endpoint.established(timeout).await {
        session
            .handle_backend_event(slot, generation, BackendEvent::ConnectFailed(e))
            .await;
        return;
    }

    loop {
        match endpoint.relay_to(&session.client, &session.ctx.pipes).await {
            Ok(RelayOutcome::Relayed { complete: true, .. }) => session.reply_finished(slot, generation),
            Ok(RelayOutcome::Relayed { complete: false, .. }) => {}
            Ok(RelayOutcome::Discarded { error: Some(err) }) => {
                warn!(
                    session_id = session.id,
                    backend = %endpoint.peer_addr(),
                    code = err.error_code,
                    message = %err.error_message,
                    "Replayed session command failed"
                );
            }
            Ok(RelayOutcome::Discarded { error: None }) => {}
            Ok(RelayOutcome::Closed) => return,
            Ok(RelayOutcome::Eof) => {
                session
                    .handle_backend_event(slot, generation, BackendEvent::Hangup)
                    .await;
                return;
            }
            Err(e) if !e.is_local() => {
                debug!(session_id = session.id, error = %e, "Client gone, closing session");
                session.close().await;
                session.client.close();
                return;
            }
            Err(e) => {
                session
                    .handle_backend_event(slot, generation, BackendEvent::Error(e))
                    .await;
                return;
            }
        }
    }
}

impl RouterSession {
    pub(crate) fn spawn_pump(self: &Arc<Self>, slot: usize, generation: u64, endpoint: Arc<Endpoint>) {
        tokio::spawn(pump(self.clone(), slot, generation, endpoint));
    }

    /// The last packet of a reply reached the client: the statement is answered
    ///
    /// Never waits for the session lock inline; a router holding it may be
    /// blocked writing to this very backend.
    fn reply_finished(self: &Arc<Self>, slot: usize, generation: u64) {
        if let Ok(mut inner) = self.inner.try_lock() {
            note_reply(&mut inner, slot, generation);
            return;
        }

        let session = self.clone();
        tokio::spawn(async move {
            let mut inner = session.inner.lock().await;
            note_reply(&mut inner, slot, generation);
        });
    }

    /// React to a failed backend connection
    ///
    /// Waits until setup is finished, ignores events from connections that
    /// were already replaced, and otherwise reconnects that one slot. The
    /// session stops when the primary cannot be replaced, when fewer than
    /// `min_backends` connections would remain, or when the client already
    /// holds part of a reply it can never get the rest of.
    pub(crate) async fn handle_backend_event(
        self: &Arc<Self>,
        slot: usize,
        generation: u64,
        event: BackendEvent,
    ) {
        let mut ready = self.state.subscribe();
        let state = match ready.wait_for(|s| *s != SessionState::Setup).await {
            Ok(state) => *state,
            Err(_) => return,
        };
        if state != SessionState::RouterReady {
            debug!(session_id = self.id, event = %event, "Backend event after session stopped");
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        let Some(r) = inner.refs.get(slot) else {
            return;
        };
        if r.generation() != generation || !r.is_in_use() {
            debug!(session_id = self.id, slot = slot, event = %event, "Stale backend event ignored");
            return;
        }
        if let Some(endpoint) = r.endpoint() {
            if endpoint.is_closed() && !matches!(event, BackendEvent::ConnectFailed(_)) {
                debug!(
                    session_id = self.id,
                    backend = %endpoint.peer_addr(),
                    socket_error = ?endpoint.socket_error(),
                    "Backend event on closed endpoint ignored"
                );
                return;
            }
        }

        let is_primary = slot == inner.primary;
        let r = &mut inner.refs[slot];
        let was_waiting = r.is_waiting();
        let mid_reply = r.endpoint().is_some_and(|e| e.reply_in_progress());
        let attempts = r.reconnect_attempts();
        let failed = r.backend().clone();
        if let Some(endpoint) = r.mark_closed() {
            endpoint.close();
        }

        warn!(
            session_id = self.id,
            backend = %failed.name(),
            role = if is_primary { "primary" } else { "replica" },
            event = %event,
            attempts = attempts,
            "Backend connection lost"
        );

        if mid_reply {
            error!(session_id = self.id, backend = %failed.name(), "Reply cut off, closing client");
            self.shutdown_locked(&mut inner);
            self.client.close();
            self.ctx.stats.record_failover(FailoverResult::Failed.label());
            return;
        }

        let max_attempts = self.ctx.config.settings.max_reconnect_attempts;
        // a server that refused a fresh connection is not retried right away
        let retry_same = !matches!(event, BackendEvent::ConnectFailed(_));
        let replacement = if attempts >= max_attempts {
            Err(format!("{} failed after {} reconnect attempts", failed.name(), attempts))
        } else {
            self.replace_backend(&mut inner, slot, attempts + 1, retry_same).await
        };

        let result = match replacement {
            Ok(new_slot) => {
                if is_primary {
                    inner.primary = new_slot;
                }
                let backend = inner.refs[new_slot].backend().name().to_string();
                info!(session_id = self.id, failed = %failed.name(), backend = %backend, "Backend replaced");
                FailoverResult::Replaced
            }
            Err(reason) => {
                let in_use = inner.refs.iter().filter(|r| r.is_in_use()).count();
                let min_backends = self.ctx.config.settings.min_backends;
                if is_primary || in_use < min_backends.max(1) {
                    error!(
                        session_id = self.id,
                        reason = %reason,
                        in_use = in_use,
                        min_backends = min_backends,
                        "No replacement backend, stopping session"
                    );
                    self.stop(&mut inner, &reason).await;
                    FailoverResult::Failed
                } else {
                    warn!(session_id = self.id, reason = %reason, in_use = in_use, "Continuing without replica");
                    FailoverResult::Degraded
                }
            }
        };
        self.ctx.stats.record_failover(result.label());

        if was_waiting && result != FailoverResult::Failed {
            let packet = ErrPacket::server_lost(&event.to_string()).encode(1);
            if let Err(e) = self.client.write_packet(&packet).await {
                debug!(session_id = self.id, error = %e, "Failed to report lost statement");
            }
        }
    }

    /// Connect a replacement for `slot` and return the slot now serving its role
    ///
    /// Unless `retry_same` is false, the same server is tried first,
    /// re-resolved through the server directory. A replica may then be
    /// replaced by any unused replica, the primary only by a server currently
    /// marked primary.
    async fn replace_backend(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        slot: usize,
        attempts: u32,
        retry_same: bool,
    ) -> Result<usize, String> {
        let is_primary = slot == inner.primary;
        let failed = inner.refs[slot].backend().clone();
        let mut candidates: Vec<(Arc<Backend>, Arc<Server>)> = Vec::new();

        let same = if retry_same {
            self.ctx.directory.find_server_by_name(failed.name())
        } else {
            None
        };
        if let Some(server) = same {
            let fits = if is_primary {
                failed.is_valid() && server.is_primary()
            } else {
                failed.is_valid() && failed.weight() > 0 && server.is_replica()
            };
            if fits {
                candidates.push((failed.clone(), server));
            }
        }

        let unused = |b: &Arc<Backend>| b.index() != slot && !inner.refs[b.index()].is_in_use();
        if is_primary {
            candidates.extend(
                self.ctx
                    .registry
                    .backends()
                    .iter()
                    .filter(|b| unused(b) && b.can_be_primary())
                    .map(|b| (b.clone(), b.server().clone())),
            );
        } else {
            let max_lag = self.ctx.config.max_replica_lag();
            let others: Vec<Arc<Backend>> = self
                .ctx
                .registry
                .backends()
                .iter()
                .filter(|b| unused(b) && b.can_be_replica() && super::within_lag(b, max_lag))
                .cloned()
                .collect();
            candidates.extend(
                self.ctx
                    .selector
                    .rank(others)
                    .into_iter()
                    .map(|b| {
                        let server = b.server().clone();
                        (b, server)
                    }),
            );
        }

        for (backend, server) in candidates {
            match self.attach(inner, backend.index(), &server, attempts).await {
                Ok(()) => return Ok(backend.index()),
                Err(e) => {
                    warn!(session_id = self.id, backend = %backend.name(), error = %e, "Replacement connect failed");
                }
            }
        }

        Err(if is_primary {
            format!("no primary available to replace {}", failed.name())
        } else {
            format!("no replica available to replace {}", failed.name())
        })
    }

    /// Start connecting `server` into `slot` and queue the session-command replay
    ///
    /// The pump waits for the connection; replayed commands and any routed
    /// statement sit in the delay queue until then.
    async fn attach(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        slot: usize,
        server: &Server,
        attempts: u32,
    ) -> Result<(), TransportError> {
        let addr = Endpoint::resolve(server.host(), server.port()).await?;
        let endpoint = Endpoint::connect(addr)?;

        let SessionInner { refs, log, .. } = inner;
        let r = &mut refs[slot];
        let Some(generation) = r.mark_in_use(endpoint.clone()) else {
            endpoint.close();
            return Err(TransportError::Closed);
        };
        r.set_reconnect_attempts(attempts);

        if let Err(e) = replay_pending(log, &mut r.cursor, &*endpoint).await {
            r.mark_closed();
            endpoint.close();
            return Err(e);
        }

        self.spawn_pump(slot, generation, endpoint);
        Ok(())
    }

    /// Unrecoverable failure: close everything and tell the client it may retry
    async fn stop(&self, inner: &mut SessionInner, reason: &str) {
        self.shutdown_locked(inner);

        let packet = ErrPacket::connection_killed(reason).encode(1);
        if let Err(e) = self.client.write_packet(&packet).await {
            debug!(session_id = self.id, error = %e, "Failed to notify client");
        }
        self.client.close();
    }
}

fn note_reply(inner: &mut SessionInner, slot: usize, generation: u64) {
    if let Some(r) = inner.refs.get_mut(slot) {
        if r.generation() == generation {
            r.clear_waiting();
            r.set_reconnect_attempts(0);
        }
    }
}
