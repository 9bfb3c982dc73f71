//! Backend loss and replacement

use std::time::Duration;

use athena_rwsplit::protocol::{is_ok_packet, ErrPacket, Packet};
use athena_rwsplit::session::{RouterSession, SessionState};

use crate::{settings, wait_until, MockBackend, TestProxy, HANGUP_MID_REPLY, NO_REPLY};

async fn wait_for_replicas(session: &RouterSession, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if session.snapshot().await.replicas.len() == count {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {} replicas", count);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_replica_reconnects_and_replays() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SET @a = 1").await;
    client.query("SELECT 1").await;
    assert_eq!(db2.statements(0), vec!["SET @a = 1", "SELECT 1"]);

    db2.kill_connections();
    wait_until("replica reconnect", || db2.accepted() == 2).await;
    wait_until("replay on new connection", || db2.statements(1) == vec!["SET @a = 1"]).await;

    let reply = client.query("SELECT 2").await;
    assert!(is_ok_packet(&reply.payload));
    assert_eq!(db2.statements(1), vec!["SET @a = 1", "SELECT 2"]);
    // the replayed command's reply never reaches the client
    client.assert_silent(Duration::from_millis(100)).await;

    // the primary is untouched
    assert_eq!(db1.accepted(), 1);
    assert_eq!(db1.statements(0), vec!["SET @a = 1"]);
    assert_eq!(proxy.instance.stats().failovers, 1);
}

#[tokio::test]
async fn test_primary_reconnects_to_same_server() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SET NAMES utf8mb4").await;

    db1.kill_connections();
    wait_until("primary reconnect", || db1.accepted() == 2).await;

    client.query("INSERT INTO t VALUES (1)").await;
    assert_eq!(db1.statements(1), vec!["SET NAMES utf8mb4", "INSERT INTO t VALUES (1)"]);
    assert_eq!(db2.accepted(), 1);

    let session = proxy.instance.session(1).unwrap();
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.state, SessionState::RouterReady);
    assert_eq!(snapshot.primary, "db1");
}

#[tokio::test]
async fn test_lost_statement_is_reported() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    let slow = format!("SELECT {}(10)", NO_REPLY);
    client.send(athena_rwsplit::protocol::Packet::query(&slow)).await;
    wait_until("slow query received", || db2.statements(0) == vec![slow.clone()]).await;

    db2.kill_connections();
    let reply = client.recv().await.expect("error for the lost statement");
    let err = ErrPacket::parse(&reply.payload).expect("ERR packet");
    assert_eq!(err.error_code, 2013);
    assert_eq!(reply.sequence_id, 1);

    // the session carries on with a new replica connection
    wait_until("replica reconnect", || db2.accepted() == 2).await;
    let reply = client.query("SELECT 3").await;
    assert!(is_ok_packet(&reply.payload));
    assert_eq!(db2.statements(1), vec!["SELECT 3"]);
}

#[tokio::test]
async fn test_lost_replica_degrades_session() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(1, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SELECT 1").await;
    assert_eq!(db2.statements(0), vec!["SELECT 1"]);

    db2.stop().await;
    let session = proxy.instance.session(1).unwrap();
    wait_for_replicas(&session, 0).await;

    // reads fall back to the primary
    let reply = client.query("SELECT 2").await;
    assert!(is_ok_packet(&reply.payload));
    assert_eq!(db1.statements(0), vec!["SELECT 2"]);
    assert_eq!(session.state(), SessionState::RouterReady);

    let stats = proxy.instance.stats();
    assert!(stats.failovers >= 1);
    assert_eq!(stats.failed_failovers, 0);
}

#[tokio::test]
async fn test_lost_replica_below_min_backends_stops_session() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SELECT 1").await;
    assert_eq!(db2.statements(0), vec!["SELECT 1"]);

    // only the primary would be left, one short of min_backends
    db2.stop().await;
    let reply = client.recv().await.expect("error before disconnect");
    let err = ErrPacket::parse(&reply.payload).expect("ERR packet");
    assert_eq!(err.error_code, 1927);
    assert!(client.recv().await.is_none());

    wait_until("session freed", || proxy.instance.session_count() == 0).await;
    wait_until("primary closed", || db1.active() == 0).await;
    let stats = proxy.instance.stats();
    assert_eq!(stats.failed_failovers, 1);
    assert_eq!(stats.sessions_closed, 1);
}

#[tokio::test]
async fn test_backend_lost_mid_reply_disconnects_client() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SELECT 1").await;

    let sql = format!("SELECT {}()", HANGUP_MID_REPLY);
    client.send(Packet::query(&sql)).await;
    let first = client.recv().await.expect("start of the result set");
    assert_eq!(&first.payload[..], &[1u8]);

    // the rest of the reply is gone; nothing may be spliced after it
    assert!(client.recv().await.is_none());
    assert_eq!(db2.statements(0), vec!["SELECT 1".to_string(), sql]);

    wait_until("session freed", || proxy.instance.session_count() == 0).await;
    wait_until("backends closed", || db1.active() == 0).await;
    assert_eq!(db2.accepted(), 1);
    assert_eq!(proxy.instance.stats().failed_failovers, 1);
}

#[tokio::test]
async fn test_lost_primary_stops_session() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("INSERT INTO t VALUES (1)").await;

    db1.stop().await;
    let reply = client.recv().await.expect("error before disconnect");
    let err = ErrPacket::parse(&reply.payload).expect("ERR packet");
    assert_eq!(err.error_code, 1927);
    assert_eq!(err.sql_state, "70100");
    assert!(client.recv().await.is_none());

    wait_until("session freed", || proxy.instance.session_count() == 0).await;
    wait_until("replica closed", || db2.active() == 0).await;
    let stats = proxy.instance.stats();
    assert_eq!(stats.failed_failovers, 1);
    assert_eq!(stats.sessions_closed, 1);
}

#[tokio::test]
async fn test_replica_replaced_by_another_replica() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let db3 = MockBackend::start("db3").await;
    let proxy = TestProxy::start(&[&db1, &db2, &db3], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SET @a = 1").await;
    client.query("SELECT 1").await;
    // equal load: the first replica in configuration order wins
    assert_eq!(db2.statements(0), vec!["SET @a = 1", "SELECT 1"]);
    assert_eq!(db3.accepted(), 0);

    db2.stop().await;
    wait_until("spare replica connected", || db3.accepted() == 1).await;

    let reply = client.query("SELECT 2").await;
    assert!(is_ok_packet(&reply.payload));
    assert_eq!(db3.statements(0), vec!["SET @a = 1", "SELECT 2"]);
}
