//! Session-command log and per-backend replay
//!
//! Statements that change session state (SET, USE, COM_INIT_DB) must reach
//! every backend a session talks to. They are appended here once and replayed
//! lazily: a backend connection catches up on everything it has not seen yet
//! before it receives its next client statement.

use std::future::Future;

use bytes::Bytes;
use tracing::debug;

use crate::metrics::metrics;
use crate::protocol::Packet;
use crate::transport::{Endpoint, TransportError};

/// One logged session command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    /// 1-based position in the log
    pub seq: u64,
    /// Client packet payload (command byte + body)
    pub payload: Bytes,
}

/// Append-only log of session commands
#[derive(Debug, Default)]
pub struct SessionCommandLog {
    commands: Vec<SessionCommand>,
}

impl SessionCommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command and return its sequence number
    pub fn append(&mut self, payload: Bytes) -> u64 {
        let seq = self.len() + 1;
        self.commands.push(SessionCommand { seq, payload });
        seq
    }

    pub fn len(&self) -> u64 {
        self.commands.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn get(&self, seq: u64) -> Option<&SessionCommand> {
        seq.checked_sub(1)
            .and_then(|i| self.commands.get(i as usize))
    }

    /// Commands with `after < seq <= upto`
    pub fn range(&self, after: u64, upto: u64) -> &[SessionCommand] {
        let end = upto.min(self.len()) as usize;
        let start = (after as usize).min(end);
        &self.commands[start..end]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionCommand> {
        self.commands.iter()
    }
}

/// Last sequence number a backend connection has received
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayCursor(u64);

impl ReplayCursor {
    pub fn position(&self) -> u64 {
        self.0
    }

    pub fn advance_to(&mut self, seq: u64) {
        debug_assert!(seq >= self.0, "replay cursor moved backwards");
        self.0 = self.0.max(seq);
    }

    /// The connection has seen every logged command
    pub fn is_current(&self, log: &SessionCommandLog) -> bool {
        self.0 == log.len()
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Destination of replayed commands
pub trait CommandSink: Sync {
    fn send_command(
        &self,
        command: &SessionCommand,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl CommandSink for Endpoint {
    /// The backend's reply to a replayed command is swallowed, never relayed
    fn send_command(
        &self,
        command: &SessionCommand,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let packet = Packet::new(0, command.payload.clone());
        async move {
            self.expect_discard(1);
            match self.write_packet(&packet).await? {
                0 => Err(TransportError::Closed),
                _ => Ok(()),
            }
        }
    }
}

/// Send every command in `(cursor, upto]` in order, advancing the cursor after each send
pub async fn replay_until<S: CommandSink + ?Sized>(
    log: &SessionCommandLog,
    cursor: &mut ReplayCursor,
    upto: u64,
    sink: &S,
) -> Result<usize, TransportError> {
    let mut sent = 0;
    for command in log.range(cursor.position(), upto) {
        sink.send_command(command).await?;
        cursor.advance_to(command.seq);
        sent += 1;
    }

    if sent > 0 {
        metrics().replays_total.inc_by(sent as u64);
        debug!(replayed = sent, cursor = cursor.position(), "Replayed session commands");
    }
    Ok(sent)
}

/// Bring a connection fully up to date with the log
pub async fn replay_pending<S: CommandSink + ?Sized>(
    log: &SessionCommandLog,
    cursor: &mut ReplayCursor,
    sink: &S,
) -> Result<usize, TransportError> {
    replay_until(log, cursor, log.len(), sink).await
}
