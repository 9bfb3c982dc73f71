use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use nix::errno::Errno;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};

use super::{PipeGuard, PipePool, TransportError, SPLICE_MAX_BYTES};
use crate::backend::saturating_decrement;
use crate::metrics::metrics;
use crate::protocol::packet::payload_len;
use crate::protocol::reply::INSPECT_LEN;
use crate::protocol::{is_err_packet, ErrPacket, Packet, ReplyTracker, PACKET_HEADER_SIZE};

/// SO_SNDBUF / SO_RCVBUF for backend sockets
pub const BACKEND_SOCKET_BUFFER: usize = 128 * 1024;

/// Chunk size when a peer is not ready for splicing
const BUFFERED_RELAY_CHUNK: usize = 16 * 1024;

static ENDPOINT_IDS: AtomicU64 = AtomicU64::new(1);

/// Endpoint lifecycle
///
/// `Init -> Connecting -> Ready <-> Relaying -> Closing -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Init,
    Connecting,
    Ready,
    Relaying,
    Closing,
    Closed,
}

impl EndpointState {
    pub fn can_transition_to(self, next: EndpointState) -> bool {
        use EndpointState::*;
        matches!(
            (self, next),
            (Init, Connecting | Ready | Closing | Closed)
                | (Connecting, Ready | Closing | Closed)
                | (Ready, Relaying | Closing)
                | (Relaying, Ready | Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_open(self) -> bool {
        !matches!(self, EndpointState::Closing | EndpointState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Client,
    Backend,
}

/// Result of one relay step
#[derive(Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Bytes moved to the peer; `complete` once the last packet of a reply went through
    Relayed { bytes: usize, complete: bool },
    /// A reply to a replayed session command was swallowed
    Discarded { error: Option<ErrPacket> },
    /// The remote side closed the connection
    Eof,
    /// The endpoint was closed locally
    Closed,
}

#[derive(Debug)]
struct EndpointInner {
    state: EndpointState,
    /// Bytes written before the connection was established
    delay_queue: BytesMut,
    relay: RelayCursor,
}

/// Where the relay is inside the reply stream
#[derive(Debug, Default)]
struct RelayCursor {
    tracker: ReplyTracker,
    /// Payload bytes of the current packet not yet relayed
    remaining: usize,
    /// The current packet is the last one of its reply
    ends_reply: bool,
}

impl RelayCursor {
    fn in_reply(&self) -> bool {
        self.remaining > 0 || self.tracker.in_reply()
    }
}

/// One TCP connection (client or backend) and its state machine
#[derive(Debug)]
pub struct Endpoint {
    id: u64,
    kind: EndpointKind,
    peer_addr: SocketAddr,
    stream: TcpStream,
    inner: Mutex<EndpointInner>,
    /// Serializes writers so packets never interleave on the wire
    write_lock: tokio::sync::Mutex<()>,
    /// Replies still owed for replayed session commands
    discard: AtomicUsize,
    cancel: CancellationToken,
    relayed: AtomicU64,
}

impl Endpoint {
    fn new(kind: EndpointKind, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            id: ENDPOINT_IDS.fetch_add(1, Ordering::Relaxed),
            kind,
            peer_addr,
            stream,
            inner: Mutex::new(EndpointInner {
                state: EndpointState::Init,
                delay_queue: BytesMut::new(),
                relay: RelayCursor::default(),
            }),
            write_lock: tokio::sync::Mutex::new(()),
            discard: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            relayed: AtomicU64::new(0),
        }
    }

    /// Wrap an accepted client socket
    pub fn accepted(stream: TcpStream) -> io::Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let endpoint = Self::new(EndpointKind::Client, stream, peer_addr);
        endpoint.transition(EndpointState::Ready);
        Ok(Arc::new(endpoint))
    }

    pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TransportError::Resolve(format!("{}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{}:{}", host, port)))
    }

    /// Start a non-blocking connect to a backend
    ///
    /// Returns in `Connecting` when the kernel reports `EINPROGRESS`; call
    /// [`Endpoint::established`] to wait for completion. Any other connect
    /// error is reported immediately.
    pub fn connect(addr: SocketAddr) -> Result<Arc<Self>, TransportError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_send_buffer_size(BACKEND_SOCKET_BUFFER)?;
        socket.set_recv_buffer_size(BACKEND_SOCKET_BUFFER)?;
        socket.set_nodelay(true)?;
        socket.set_nonblocking(true)?;

        let next = match socket.connect(&addr.into()) {
            Ok(()) => EndpointState::Ready,
            Err(e) if e.raw_os_error() == Some(Errno::EINPROGRESS as i32) => EndpointState::Connecting,
            Err(e) => {
                debug!(backend = %addr, error = %e, "Backend connect failed");
                return Err(TransportError::Connect { addr, source: e });
            }
        };

        let stream = TcpStream::from_std(std::net::TcpStream::from(socket))?;
        let endpoint = Self::new(EndpointKind::Backend, stream, addr);
        endpoint.transition(next);
        debug!(endpoint = endpoint.id, backend = %addr, state = ?next, "Backend connect started");
        Ok(Arc::new(endpoint))
    }

    /// Wait for the connect to finish, then flush the delay queue
    pub async fn established(&self, timeout: Duration) -> Result<(), TransportError> {
        if self.state() == EndpointState::Connecting {
            let addr = self.peer_addr;
            match tokio::time::timeout(timeout, self.stream.writable()).await {
                Err(_) => {
                    self.close();
                    return Err(TransportError::ConnectTimeout(addr));
                }
                Ok(Err(e)) => {
                    self.close();
                    return Err(TransportError::Connect { addr, source: e });
                }
                Ok(Ok(())) => {}
            }
            if let Some(e) = self.stream.take_error()? {
                self.close();
                return Err(TransportError::Connect { addr, source: e });
            }
        }

        self.flush_delay_queue().await
    }

    async fn flush_delay_queue(&self) -> Result<(), TransportError> {
        let _writer = self.write_lock.lock().await;
        loop {
            let pending = {
                let mut inner = self.inner.lock();
                if !inner.state.is_open() {
                    return Err(TransportError::Closed);
                }
                if inner.delay_queue.is_empty() {
                    if inner.state == EndpointState::Connecting {
                        self.transition_locked(&mut inner, EndpointState::Ready);
                    }
                    return Ok(());
                }
                inner.delay_queue.split().freeze()
            };
            trace!(endpoint = self.id, bytes = pending.len(), "Flushing delay queue");
            self.write_all_raw(&pending).await?;
        }
    }

    /// Write bytes, queueing them while the connection is still being established
    ///
    /// Writing to a closing or closed endpoint is ignored and reports 0 bytes.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                EndpointState::Init | EndpointState::Connecting => {
                    inner.delay_queue.extend_from_slice(bytes);
                    return Ok(bytes.len());
                }
                EndpointState::Closing | EndpointState::Closed => {
                    warn!(
                        endpoint = self.id,
                        peer = %self.peer_addr,
                        bytes = bytes.len(),
                        "Write to closed endpoint ignored"
                    );
                    return Ok(0);
                }
                EndpointState::Ready | EndpointState::Relaying => {}
            }
        }

        let _writer = self.write_lock.lock().await;
        self.write_all_raw(bytes).await?;
        Ok(bytes.len())
    }

    pub async fn write_packet(&self, packet: &Packet) -> Result<usize, TransportError> {
        self.write(&packet.to_bytes()).await
    }

    /// Read one complete packet; `None` on a clean EOF
    pub async fn read_packet(&self) -> Result<Option<Packet>, TransportError> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        if !self.read_exact(&mut header).await? {
            return Ok(None);
        }

        let mut payload = vec![0u8; payload_len(&header)];
        if !payload.is_empty() && !self.read_exact(&mut payload).await? {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        Ok(Some(Packet::new(header[3], payload)))
    }

    /// Move the next stretch of the reply stream to `peer`
    ///
    /// Packet headers and the first bytes of every payload are read to track
    /// reply boundaries; the rest of a payload goes socket -> pipe -> peer
    /// socket with `splice`, borrowing the pipe only while data is in flight.
    /// While replies to replayed session commands are still owed they are
    /// read and dropped instead.
    pub async fn relay_to(
        &self,
        peer: &Endpoint,
        pipes: &PipePool,
    ) -> Result<RelayOutcome, TransportError> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(RelayOutcome::Closed),
                ready = self.stream.readable() => ready?,
            }

            let (remaining, in_reply) = {
                let inner = self.inner.lock();
                (inner.relay.remaining, inner.relay.in_reply())
            };
            if !in_reply && self.discard.load(Ordering::Acquire) > 0 {
                return self.discard_reply().await;
            }

            let peer_ready = match peer.state() {
                EndpointState::Closing | EndpointState::Closed => {
                    return Err(TransportError::Peer(io::ErrorKind::BrokenPipe.into()));
                }
                EndpointState::Init | EndpointState::Connecting => false,
                EndpointState::Ready | EndpointState::Relaying => true,
            };

            if remaining == 0 {
                return self.relay_packet_head(peer).await;
            }

            let want = remaining.min(SPLICE_MAX_BYTES);
            let n = if peer_ready {
                let mut pipe = pipes.acquire().await?;
                let n = match self
                    .stream
                    .try_io(Interest::READABLE, || pipe.fill_from(&self.stream, want))
                {
                    Ok(0) => return Ok(RelayOutcome::Eof),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                };

                self.transition(EndpointState::Relaying);
                let drained = peer.drain_pipe(&mut pipe).await;
                self.end_relay();
                drained.map_err(TransportError::Peer)?;
                n
            } else {
                let mut buf = vec![0u8; want.min(BUFFERED_RELAY_CHUNK)];
                let n = match self.stream.try_read(&mut buf) {
                    Ok(0) => return Ok(RelayOutcome::Eof),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                };
                peer.write(&buf[..n]).await.map_err(peer_error)?;
                n
            };

            let complete = {
                let mut inner = self.inner.lock();
                inner.relay.remaining -= n;
                inner.relay.remaining == 0 && inner.relay.ends_reply
            };
            return Ok(self.relayed(peer, n, complete));
        }
    }

    /// Forward a packet header plus the payload bytes that classify it
    async fn relay_packet_head(&self, peer: &Endpoint) -> Result<RelayOutcome, TransportError> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        if !self.read_exact(&mut header).await? {
            return Ok(RelayOutcome::Eof);
        }

        let len = payload_len(&header);
        let inspect = len.min(INSPECT_LEN);
        let mut head = vec![0u8; PACKET_HEADER_SIZE + inspect];
        head[..PACKET_HEADER_SIZE].copy_from_slice(&header);
        if inspect > 0 && !self.read_exact(&mut head[PACKET_HEADER_SIZE..]).await? {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        let complete = {
            let mut inner = self.inner.lock();
            let relay = &mut inner.relay;
            relay.ends_reply = relay.tracker.on_packet(len, &head[PACKET_HEADER_SIZE..]);
            relay.remaining = len - inspect;
            relay.ends_reply && relay.remaining == 0
        };

        self.transition(EndpointState::Relaying);
        let written = peer.write(&head).await;
        self.end_relay();
        written.map_err(peer_error)?;
        Ok(self.relayed(peer, head.len(), complete))
    }

    fn relayed(&self, peer: &Endpoint, bytes: usize, complete: bool) -> RelayOutcome {
        self.relayed.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics().relayed_bytes_total.inc_by(bytes as u64);
        trace!(endpoint = self.id, peer = peer.id, bytes = bytes, complete = complete, "Relayed");
        RelayOutcome::Relayed { bytes, complete }
    }

    async fn drain_pipe(&self, pipe: &mut PipeGuard<'_>) -> io::Result<()> {
        let _writer = self.write_lock.lock().await;
        while pipe.buffered() > 0 {
            self.stream.writable().await?;
            match self
                .stream
                .try_io(Interest::WRITABLE, || pipe.drain_into(&self.stream))
            {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read and drop one whole reply, result sets and multi-results included
    async fn discard_reply(&self) -> Result<RelayOutcome, TransportError> {
        let mut tracker = ReplyTracker::new();
        let mut error = None;
        loop {
            let Some(packet) = self.read_packet().await? else {
                return Ok(RelayOutcome::Eof);
            };
            if error.is_none() && is_err_packet(&packet.payload) {
                error = ErrPacket::parse(&packet.payload);
            }
            if tracker.on_packet(packet.payload.len(), &packet.payload) {
                break;
            }
        }
        saturating_decrement(&self.discard);
        Ok(RelayOutcome::Discarded { error })
    }

    /// Close the connection; returns false if it was already closing or closed
    pub fn close(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_open() {
                return false;
            }
            self.transition_locked(&mut inner, EndpointState::Closing);
            inner.delay_queue.clear();
        }

        self.cancel.cancel();
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!(endpoint = self.id, error = %e, "Socket shutdown failed");
            }
        }

        self.transition(EndpointState::Closed);
        debug!(endpoint = self.id, peer = %self.peer_addr, kind = ?self.kind, "Endpoint closed");
        true
    }

    /// Expect `n` more replies that must not reach the client
    pub fn expect_discard(&self, n: usize) {
        self.discard.fetch_add(n, Ordering::AcqRel);
    }

    pub fn pending_discards(&self) -> usize {
        self.discard.load(Ordering::Acquire)
    }

    /// Pending socket error (SO_ERROR), if any
    pub fn socket_error(&self) -> Option<io::Error> {
        self.stream.take_error().ok().flatten()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> EndpointState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EndpointState::Ready | EndpointState::Relaying)
    }

    pub fn is_closed(&self) -> bool {
        !self.state().is_open()
    }

    /// Part of a reply has been relayed but not its last packet
    pub fn reply_in_progress(&self) -> bool {
        self.inner.lock().relay.in_reply()
    }

    /// Total bytes relayed from this endpoint to its peers
    pub fn relayed_bytes(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    fn transition(&self, next: EndpointState) -> bool {
        let mut inner = self.inner.lock();
        self.transition_locked(&mut inner, next)
    }

    fn transition_locked(&self, inner: &mut EndpointInner, next: EndpointState) -> bool {
        if inner.state.can_transition_to(next) {
            trace!(endpoint = self.id, from = ?inner.state, to = ?next, "Endpoint state");
            inner.state = next;
            true
        } else {
            warn!(
                endpoint = self.id,
                from = ?inner.state,
                to = ?next,
                "Invalid endpoint state transition ignored"
            );
            false
        }
    }

    fn end_relay(&self) {
        let mut inner = self.inner.lock();
        if inner.state == EndpointState::Relaying {
            inner.state = EndpointState::Ready;
        }
    }

    async fn write_all_raw(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Fill `buf` completely; false on EOF before the first byte
    async fn read_exact(&self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            self.stream.readable().await?;
            match self.stream.try_read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

fn peer_error(e: TransportError) -> TransportError {
    match e {
        TransportError::Io(e) => TransportError::Peer(e),
        other => TransportError::Peer(io::Error::new(io::ErrorKind::Other, other)),
    }
}
