//! Session open, routing and close

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use athena_rwsplit::protocol::{is_ok_packet, Command, ErrPacket, Packet};
use athena_rwsplit::session::SessionState;
use athena_rwsplit::transport::Endpoint;

use crate::{settings, wait_until, MockBackend, TestProxy};

#[tokio::test]
async fn test_open_connects_primary_and_replicas() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let db3 = MockBackend::start("db3").await;
    let proxy = TestProxy::start(&[&db1, &db2, &db3], settings(2, 2)).await;

    let mut client = proxy.connect().await;
    let reply = client.query("SELECT 1").await;
    assert!(is_ok_packet(&reply.payload));

    assert_eq!(db1.accepted(), 1);
    assert_eq!(db2.accepted(), 1);
    assert_eq!(db3.accepted(), 1);

    let session = proxy.instance.session(1).expect("session registered");
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.state, SessionState::RouterReady);
    assert_eq!(snapshot.primary, "db1");
    assert_eq!(snapshot.replicas.len(), 2);
}

#[tokio::test]
async fn test_max_replicas_limits_connections() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let db3 = MockBackend::start("db3").await;
    let proxy = TestProxy::start(&[&db1, &db2, &db3], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SELECT 1").await;

    assert_eq!(db1.accepted(), 1);
    assert_eq!(db2.accepted() + db3.accepted(), 1);
}

#[tokio::test]
async fn test_unreachable_replica_is_skipped() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let db3 = MockBackend::start("db3").await;
    db2.stop().await;
    let proxy = TestProxy::start(&[&db1, &db2, &db3], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SELECT 1").await;

    assert_eq!(db3.accepted(), 1);
    assert_eq!(db3.all_statements(), vec!["SELECT 1"]);
}

#[tokio::test]
async fn test_not_enough_backends() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    db2.stop().await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    let reply = client.recv().await.expect("error packet");
    let err = ErrPacket::parse(&reply.payload).expect("ERR packet");
    assert_eq!(err.error_code, 2003);
    assert_eq!(reply.sequence_id, 0);
    assert!(client.recv().await.is_none());

    // the primary connection made during setup is not kept
    wait_until("primary connection closed", || db1.active() == 0).await;
    assert_eq!(proxy.instance.session_count(), 0);
    let stats = proxy.instance.stats();
    assert_eq!(stats.sessions_opened, 0);
    assert_eq!(stats.open_failures, 1);
}

#[tokio::test]
async fn test_reads_go_to_replica_writes_to_primary() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SELECT * FROM t").await;
    client.query("INSERT INTO t VALUES (1)").await;
    client.query("SELECT * FROM t FOR UPDATE").await;
    client.query("SHOW TABLES").await;

    assert_eq!(db1.statements(0), vec!["INSERT INTO t VALUES (1)", "SELECT * FROM t FOR UPDATE"]);
    assert_eq!(db2.statements(0), vec!["SELECT * FROM t", "SHOW TABLES"]);

    let stats = proxy.instance.stats();
    assert_eq!(stats.routed_primary, 2);
    assert_eq!(stats.routed_replica, 2);
}

#[tokio::test]
async fn test_transaction_pins_primary() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("BEGIN").await;
    client.query("SELECT 1").await;
    client.query("COMMIT").await;
    client.query("SELECT 2").await;

    assert_eq!(db1.statements(0), vec!["BEGIN", "SELECT 1", "COMMIT"]);
    assert_eq!(db2.statements(0), vec!["SELECT 2"]);
}

#[tokio::test]
async fn test_route_hints() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let db3 = MockBackend::start("db3").await;
    let proxy = TestProxy::start(&[&db1, &db2, &db3], settings(3, 2)).await;

    let mut client = proxy.connect().await;
    client.query("SELECT 1 /* route to master */").await;
    client.query("SELECT 2 /* route to server db3 */").await;
    client.query("SELECT 3 /* route to server nosuch */").await;

    assert_eq!(db1.statements(0), vec!["SELECT 1 /* route to master */", "SELECT 3 /* route to server nosuch */"]);
    assert_eq!(db3.statements(0), vec!["SELECT 2 /* route to server db3 */"]);
    assert!(db2.all_statements().is_empty());
}

#[tokio::test]
async fn test_one_reply_per_statement() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    for sql in ["SET @a = 1", "SELECT @a", "SET NAMES utf8mb4", "SELECT 2"] {
        let reply = client.query(sql).await;
        assert!(is_ok_packet(&reply.payload), "{} got {:?}", sql, reply);
        assert_eq!(reply.sequence_id, 1);
    }
    client.assert_silent(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_quit_closes_session() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SELECT 1").await;
    client.send(Packet::new(0, vec![Command::Quit as u8])).await;
    assert!(client.recv().await.is_none());

    wait_until("session freed", || proxy.instance.session_count() == 0).await;
    wait_until("backends closed", || db1.active() == 0 && db2.active() == 0).await;
    let stats = proxy.instance.stats();
    assert_eq!(stats.sessions_opened, 1);
    assert_eq!(stats.sessions_closed, 1);
}

#[tokio::test]
async fn test_client_disconnect_closes_session() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SELECT 1").await;
    drop(client);

    wait_until("session freed", || proxy.instance.session_count() == 0).await;
    wait_until("backends closed", || db1.active() == 0 && db2.active() == 0).await;
}

async fn client_endpoint() -> (Arc<Endpoint>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    (Endpoint::accepted(stream).unwrap(), peer)
}

#[tokio::test]
async fn test_close_is_idempotent_and_free_requires_close() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let (client, _peer) = client_endpoint().await;
    let session = proxy.instance.open_session(client).await.unwrap();
    assert_eq!(session.state(), SessionState::RouterReady);
    assert_eq!(proxy.instance.session_count(), 1);

    assert!(!proxy.instance.free_session(&session));
    assert_eq!(proxy.instance.session_count(), 1);

    assert!(session.close().await);
    assert!(!session.close().await);
    assert_eq!(session.state(), SessionState::Stopping);
    assert!(session.route(&Packet::query("SELECT 1")).await.is_err());

    assert!(proxy.instance.free_session(&session));
    assert!(!proxy.instance.free_session(&session));
    assert_eq!(proxy.instance.session_count(), 0);
    assert_eq!(proxy.instance.stats().sessions_closed, 1);

    wait_until("backends closed", || db1.active() == 0 && db2.active() == 0).await;
}

#[tokio::test]
async fn test_reconfigure_keeps_running_session_snapshot() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let (client, _peer) = client_endpoint().await;
    let session = proxy.instance.open_session(client).await.unwrap();

    let mut service = athena_rwsplit::config::ServiceConfig::new("rw", vec!["db1".into(), "db2".into()]);
    service.router = settings(1, 1);
    assert_eq!(proxy.instance.reconfigure(&service).unwrap(), 2);

    assert_eq!(session.config().version, 1);
    assert_eq!(session.config().settings.min_backends, 2);
    assert_eq!(proxy.instance.config().settings.min_backends, 1);
    session.close().await;
}
