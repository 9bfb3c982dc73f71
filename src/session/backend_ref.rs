use std::sync::Arc;

use tracing::warn;

use super::sescmd::ReplayCursor;
use crate::backend::Backend;
use crate::transport::Endpoint;

/// Connection state of one backend slot
#[derive(Debug, Clone)]
pub enum RefState {
    /// Never connected in this session
    Unused,
    InUse {
        endpoint: Arc<Endpoint>,
        /// Client statements still awaiting their reply
        waiting: u32,
    },
    Closed,
}

/// A session's view of one backend: its connection, replay cursor and generation
#[derive(Debug)]
pub struct BackendRef {
    backend: Arc<Backend>,
    state: RefState,
    pub(crate) cursor: ReplayCursor,
    /// Bumped on every new connection; stale events carry an old value
    generation: u64,
    /// Consecutive reconnects without a successful reply
    reconnect_attempts: u32,
}

impl BackendRef {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self {
            backend,
            state: RefState::Unused,
            cursor: ReplayCursor::default(),
            generation: 0,
            reconnect_attempts: 0,
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn state(&self) -> &RefState {
        &self.state
    }

    pub fn endpoint(&self) -> Option<&Arc<Endpoint>> {
        match &self.state {
            RefState::InUse { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self.state, RefState::InUse { .. })
    }

    pub fn is_waiting(&self) -> bool {
        self.pending_replies() > 0
    }

    pub fn pending_replies(&self) -> u32 {
        match self.state {
            RefState::InUse { waiting, .. } => waiting,
            _ => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, RefState::Closed)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cursor(&self) -> ReplayCursor {
        self.cursor
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub(crate) fn set_reconnect_attempts(&mut self, attempts: u32) {
        self.reconnect_attempts = attempts;
    }

    /// Attach a fresh connection; returns the new generation
    ///
    /// The cursor restarts at zero so the connection is replayed the whole log.
    pub fn mark_in_use(&mut self, endpoint: Arc<Endpoint>) -> Option<u64> {
        if self.is_in_use() {
            warn!(backend = %self.backend.name(), "Backend reference already in use");
            return None;
        }

        self.backend.connection_opened();
        self.state = RefState::InUse {
            endpoint,
            waiting: 0,
        };
        self.cursor.reset();
        self.generation += 1;
        Some(self.generation)
    }

    /// A client statement was written; false if there is no connection
    pub fn mark_waiting(&mut self) -> bool {
        match &mut self.state {
            RefState::InUse { waiting, .. } => {
                *waiting += 1;
                self.backend.server().operation_started();
                true
            }
            _ => false,
        }
    }

    /// The oldest pending statement got its whole reply
    pub fn clear_waiting(&mut self) -> bool {
        match &mut self.state {
            RefState::InUse { waiting, .. } if *waiting > 0 => {
                *waiting -= 1;
                self.backend.server().operation_finished();
                true
            }
            _ => false,
        }
    }

    /// Detach the connection and release its counters exactly once
    ///
    /// Returns the endpoint so the caller can close it; `None` if the
    /// reference held no connection.
    pub fn mark_closed(&mut self) -> Option<Arc<Endpoint>> {
        if !self.is_in_use() {
            return None;
        }

        while self.clear_waiting() {}
        match std::mem::replace(&mut self.state, RefState::Closed) {
            RefState::InUse { endpoint, .. } => {
                self.backend.connection_closed();
                Some(endpoint)
            }
            _ => None,
        }
    }
}
