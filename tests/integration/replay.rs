//! Session-command replay onto replicas

use athena_rwsplit::protocol::{is_ok_packet, Packet};

use crate::{settings, MockBackend, TestProxy};

#[tokio::test]
async fn test_replica_receives_session_commands_before_query() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SET @a = 1").await;
    client.query("SET @b = 2").await;
    client.query("SET NAMES utf8mb4").await;
    let reply = client.query("SELECT @a, @b").await;
    assert!(is_ok_packet(&reply.payload));

    assert_eq!(
        db1.statements(0),
        vec!["SET @a = 1", "SET @b = 2", "SET NAMES utf8mb4"]
    );
    assert_eq!(
        db2.statements(0),
        vec!["SET @a = 1", "SET @b = 2", "SET NAMES utf8mb4", "SELECT @a, @b"]
    );
}

#[tokio::test]
async fn test_session_commands_replayed_once() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SET @a = 1").await;
    client.query("SELECT 1").await;
    client.query("SELECT 2").await;
    client.query("USE shop").await;
    client.query("SELECT 3").await;

    assert_eq!(
        db2.statements(0),
        vec!["SET @a = 1", "SELECT 1", "SELECT 2", "USE shop", "SELECT 3"]
    );

    let session = proxy.instance.session(1).unwrap();
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.log_len, 2);
    for (backend, position) in &snapshot.cursors {
        assert_eq!(*position, 2, "cursor of {}", backend);
    }
    assert_eq!(proxy.instance.stats().session_commands, 2);
}

#[tokio::test]
async fn test_unused_replica_catches_up_lazily() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let db3 = MockBackend::start("db3").await;
    let proxy = TestProxy::start(&[&db1, &db2, &db3], settings(3, 2)).await;

    let mut client = proxy.connect().await;
    client.query("SET @a = 1").await;
    client.query("SELECT 1 /* route to server db3 */").await;

    // db2 has not served anything yet, so nothing was replayed to it
    assert!(db2.all_statements().is_empty());
    assert_eq!(db3.statements(0), vec!["SET @a = 1", "SELECT 1 /* route to server db3 */"]);

    let session = proxy.instance.session(1).unwrap();
    let cursors = session.snapshot().await.cursors;
    let position = |name: &str| cursors.iter().find(|(b, _)| b == name).map(|(_, p)| *p);
    assert_eq!(position("db1"), Some(1));
    assert_eq!(position("db2"), Some(0));
    assert_eq!(position("db3"), Some(1));
}

#[tokio::test]
async fn test_init_db_is_a_session_command() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    let mut init_db = vec![0x02];
    init_db.extend_from_slice(b"shop");
    client.send(Packet::new(0, init_db)).await;
    client.recv().await.expect("reply to COM_INIT_DB");
    client.query("SELECT 1").await;

    assert_eq!(db1.statements(0), vec!["shop"]);
    assert_eq!(db2.statements(0), vec!["shop", "SELECT 1"]);

    let session = proxy.instance.session(1).unwrap();
    assert_eq!(session.snapshot().await.database.as_deref(), Some("shop"));
}

#[tokio::test]
async fn test_use_statement_changes_database() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let proxy = TestProxy::start(&[&db1, &db2], settings(2, 1)).await;

    let mut client = proxy.connect().await;
    client.query("SELECT 1").await;
    let session = proxy.instance.session(1).unwrap();
    assert_eq!(session.snapshot().await.database, None);

    client.query("USE shop").await;
    assert_eq!(session.snapshot().await.database.as_deref(), Some("shop"));

    client.query("use `orders`;").await;
    assert_eq!(session.snapshot().await.database.as_deref(), Some("orders"));
    assert_eq!(db1.statements(0), vec!["USE shop", "use `orders`;"]);
}

#[tokio::test]
async fn test_replicas_see_identical_replay() {
    let db1 = MockBackend::start("db1").await;
    let db2 = MockBackend::start("db2").await;
    let db3 = MockBackend::start("db3").await;
    let proxy = TestProxy::start(&[&db1, &db2, &db3], settings(3, 2)).await;

    let mut client = proxy.connect().await;
    client.query("SET @a = 1").await;
    client.query("SET SESSION sql_mode = 'ANSI'").await;
    client.query("SELECT 1 /* route to server db2 */").await;
    client.query("SELECT 1 /* route to server db3 */").await;

    let replayed = |statements: Vec<String>| statements[..2].to_vec();
    assert_eq!(replayed(db2.statements(0)), replayed(db3.statements(0)));
    assert_eq!(replayed(db2.statements(0)), db1.statements(0));
}
