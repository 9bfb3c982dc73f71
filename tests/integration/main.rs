//! Integration test entry point
//!
//! Every test runs the proxy in-process against mock backends that speak just
//! enough of the MySQL packet framing: each received command is recorded per
//! connection and answered with an OK packet.
//!
//! Run with: cargo test --test integration

mod failover;
mod replay;
mod session;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use athena_rwsplit::backend::{Directory, Server};
use athena_rwsplit::config::{RouterSettings, ServerRole, ServiceConfig};
use athena_rwsplit::protocol::{OkPacket, Packet, PacketCodec};
use athena_rwsplit::proxy;
use athena_rwsplit::router::RouterInstance;
use athena_rwsplit::transport::PipePool;

/// Statements containing this marker are received but never answered
pub const NO_REPLY: &str = "SLEEP";

/// Statements containing this marker get the first packet of a result set,
/// then the backend hangs up
pub const HANGUP_MID_REPLY: &str = "HANGUP";

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A fake backend server
pub struct MockBackend {
    name: String,
    port: u16,
    accepted: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    /// Payloads received, one list per accepted connection
    received: Arc<Mutex<Vec<Vec<Bytes>>>>,
    /// Cancelled to drop every open connection
    connections: Arc<Mutex<CancellationToken>>,
    listener: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MockBackend {
    pub async fn start(name: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let backend = Self {
            name: name.to_string(),
            port,
            accepted: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(Mutex::new(CancellationToken::new())),
            listener: CancellationToken::new(),
            accept_task: Mutex::new(None),
        };

        let accepted = backend.accepted.clone();
        let active = backend.active.clone();
        let received = backend.received.clone();
        let connections = backend.connections.clone();
        let stop = backend.listener.clone();
        let task = tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = stop.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => return,
                    },
                };

                let conn = {
                    let mut received = received.lock();
                    received.push(Vec::new());
                    received.len() - 1
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                active.fetch_add(1, Ordering::SeqCst);

                let kill = connections.lock().clone();
                let received = received.clone();
                let active = active.clone();
                tokio::spawn(async move {
                    serve_connection(stream, conn, received, kill).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        *backend.accept_task.lock() = Some(task);

        backend
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Statements received on connection `conn`, as SQL text
    pub fn statements(&self, conn: usize) -> Vec<String> {
        self.received
            .lock()
            .get(conn)
            .map(|payloads| payloads.iter().map(|p| sql_of(p)).collect())
            .unwrap_or_default()
    }

    /// Statements received across every connection
    pub fn all_statements(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .flatten()
            .map(|p| sql_of(p))
            .collect()
    }

    /// Drop every open connection; the listener keeps accepting
    pub fn kill_connections(&self) {
        let mut token = self.connections.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Stop listening and drop every connection
    ///
    /// Returns once the listening socket is closed; later connects are refused.
    pub async fn stop(&self) {
        self.listener.cancel();
        self.kill_connections();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    conn: usize,
    received: Arc<Mutex<Vec<Vec<Bytes>>>>,
    kill: CancellationToken,
) {
    let mut framed = Framed::new(stream, PacketCodec);
    loop {
        let packet = tokio::select! {
            _ = kill.cancelled() => return,
            packet = framed.next() => match packet {
                Some(Ok(packet)) => packet,
                _ => return,
            },
        };

        let sql = sql_of(&packet.payload);
        received.lock()[conn].push(packet.payload.clone());
        if sql.contains(NO_REPLY) {
            continue;
        }
        if sql.contains(HANGUP_MID_REPLY) {
            // column count of a one-column result set
            let _ = framed.send(Packet::new(packet.sequence_id.wrapping_add(1), vec![1u8])).await;
            return;
        }
        let reply = OkPacket::new().encode(packet.sequence_id.wrapping_add(1));
        if framed.send(reply).await.is_err() {
            return;
        }
    }
}

fn sql_of(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload.get(1..).unwrap_or_default()).into_owned()
}

/// A proxy service listening on an ephemeral port
pub struct TestProxy {
    pub instance: Arc<RouterInstance>,
    pub addr: std::net::SocketAddr,
    shutdown: CancellationToken,
}

impl TestProxy {
    /// Route over `backends`; the first one is the primary
    pub async fn start(backends: &[&MockBackend], settings: RouterSettings) -> Self {
        let directory = Directory::new();
        for (i, backend) in backends.iter().enumerate() {
            let role = if i == 0 {
                ServerRole::Primary
            } else {
                ServerRole::Replica
            };
            directory.insert(Arc::new(Server::new(backend.name(), "127.0.0.1", backend.port(), role)));
        }

        let mut service = ServiceConfig::new(
            "rw",
            backends.iter().map(|b| b.name().to_string()).collect(),
        );
        service.router = settings;

        let pipes = Arc::new(PipePool::new(4).unwrap());
        let instance = Arc::new(RouterInstance::new(&service, Arc::new(directory), pipes).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(proxy::serve(listener, instance.clone(), shutdown.clone()));

        Self {
            instance,
            addr,
            shutdown,
        }
    }

    pub async fn connect(&self) -> TestClient {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        TestClient {
            framed: Framed::new(stream, PacketCodec),
        }
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A MySQL client reduced to sending commands and reading single-packet replies
pub struct TestClient {
    framed: Framed<TcpStream, PacketCodec>,
}

impl TestClient {
    pub async fn send(&mut self, packet: Packet) {
        self.framed.send(packet).await.unwrap();
    }

    /// Next packet from the proxy, or None on EOF
    pub async fn recv(&mut self) -> Option<Packet> {
        tokio::time::timeout(WAIT_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a reply")
            .map(|p| p.unwrap())
    }

    /// Send a COM_QUERY and wait for its reply
    pub async fn query(&mut self, sql: &str) -> Packet {
        self.send(Packet::query(sql)).await;
        self.recv().await.expect("connection closed before reply")
    }

    /// No packet arrives within `wait`
    pub async fn assert_silent(&mut self, wait: Duration) {
        let next = tokio::time::timeout(wait, self.framed.next()).await;
        assert!(next.is_err(), "unexpected packet: {:?}", next);
    }
}

/// Router settings with a short connect timeout
pub fn settings(min_backends: usize, max_replicas: usize) -> RouterSettings {
    RouterSettings {
        min_backends,
        max_replicas,
        connect_timeout_ms: 1000,
        ..RouterSettings::default()
    }
}

/// Poll `condition` until it holds or the wait times out
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
