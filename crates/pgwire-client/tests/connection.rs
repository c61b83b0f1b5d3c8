//! Connection driver tests against the mock server.
//!
//! ```bash
//! cargo test -p pgwire-client --test connection
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use pgwire_client::{Config, Connection, DbErrorCode, Error, TransactionStatus};
use pgwire_testing::{AuthMode, MockEvent, MockPgServer, MockResponse};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config_for(server: &MockPgServer) -> Config {
    init_tracing();
    Config::new()
        .host(server.host())
        .port(server.port())
        .user("app")
        .database("orders")
}

async fn wait_for(server: &MockPgServer, pred: impl Fn(&[MockEvent]) -> bool) -> bool {
    for _ in 0..100 {
        if pred(&server.events()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// =============================================================================
// Connect & Authentication
// =============================================================================

#[tokio::test]
async fn test_connect_trust() {
    let server = MockPgServer::builder()
        .with_server_version("16.4")
        .build()
        .await
        .unwrap();

    let conn = Connection::open(config_for(&server)).await.unwrap();

    assert!(conn.is_healthy());
    assert!(conn.backend_pid().is_some());
    assert_eq!(conn.parameter("server_version"), Some("16.4"));
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[tokio::test]
async fn test_connect_is_noop_when_healthy() {
    let server = MockPgServer::builder().build().await.unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();
    let pid = conn.backend_pid();

    conn.connect().await.unwrap();

    assert_eq!(conn.backend_pid(), pid);
    assert_eq!(server.accepted_count(), 1);
}

#[tokio::test]
async fn test_cleartext_password() {
    let server = MockPgServer::builder()
        .with_auth(AuthMode::Cleartext("hunter2".into()))
        .build()
        .await
        .unwrap();

    let conn = Connection::open(config_for(&server).password("hunter2")).await;
    assert!(conn.unwrap().is_healthy());

    let err = Connection::open(config_for(&server).password("wrong"))
        .await
        .unwrap_err();
    match err {
        Error::Connection(msg) => assert!(msg.contains("password authentication failed")),
        other => panic!("expected connection error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_md5_password() {
    let server = MockPgServer::builder()
        .with_auth(AuthMode::Md5("s3cret".into()))
        .build()
        .await
        .unwrap();

    let conn = Connection::open(config_for(&server).password("s3cret")).await;
    assert!(conn.unwrap().is_healthy());
}

#[tokio::test]
async fn test_scram_password() {
    let server = MockPgServer::builder()
        .with_auth(AuthMode::ScramSha256("correct horse".into()))
        .build()
        .await
        .unwrap();

    let mut conn = Connection::open(config_for(&server).password("correct horse"))
        .await
        .unwrap();
    assert!(conn.is_healthy());
    let ok = conn.exec_params("SELECT 1", &[], TIMEOUT).await.unwrap();
    assert_eq!(ok.rows[0][0].as_str(), Some("1"));

    let err = Connection::open(config_for(&server).password("battery staple"))
        .await
        .unwrap_err();
    match err {
        Error::Connection(msg) => assert!(msg.contains("password authentication failed")),
        other => panic!("expected connection error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rejected_connect_carries_server_message() {
    let server = MockPgServer::builder()
        .with_auth(AuthMode::Reject)
        .build()
        .await
        .unwrap();

    for _ in 0..5 {
        let err = Connection::open(config_for(&server)).await.unwrap_err();
        assert!(err.is_infrastructure());
        match err {
            Error::Connection(msg) => assert!(
                msg.contains("password authentication failed"),
                "server message lost: {msg}"
            ),
            other => panic!("expected connection error, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_missing_password_fails_connect() {
    let server = MockPgServer::builder()
        .with_auth(AuthMode::Md5("s3cret".into()))
        .build()
        .await
        .unwrap();

    let err = Connection::open(config_for(&server)).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert!(err.is_infrastructure());
}

#[tokio::test]
async fn test_connect_refused() {
    let server = MockPgServer::builder().build().await.unwrap();
    let config = config_for(&server);
    drop(server);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut conn = Connection::new(config);
    assert!(matches!(conn.connect().await, Err(Error::Connection(_))));
    assert!(!conn.is_healthy());
}

#[tokio::test]
async fn test_connect_step_timeout() {
    let server = MockPgServer::builder()
        .with_startup_delay(Duration::from_secs(2))
        .build()
        .await
        .unwrap();

    let config = config_for(&server).connect_timeout(Duration::from_millis(100));
    let started = std::time::Instant::now();
    let err = Connection::open(config).await.unwrap_err();

    assert!(matches!(err, Error::Connection(_)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test]
async fn test_exec_params_returns_rows() {
    let server = MockPgServer::builder()
        .with_response(
            "SELECT id, email FROM users WHERE org = $1",
            MockResponse::custom(|_, params| {
                assert_eq!(params, [Some("acme".to_string())]);
                MockResponse::Rows {
                    columns: vec!["id".into(), "email".into()],
                    rows: vec![
                        vec![Some("1".into()), Some("a@acme.io".into())],
                        vec![Some("2".into()), None],
                    ],
                }
            }),
        )
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();

    let result = conn
        .exec_params(
            "SELECT id, email FROM users WHERE org = $1",
            &[Some("acme")],
            TIMEOUT,
        )
        .await
        .unwrap();

    assert_eq!(result.column_names, vec!["id", "email"]);
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.command_tag, "SELECT 2");
    assert_eq!(result.get::<i64>(0, "id").unwrap(), 1);
    assert!(result.rows[1][1].is_null);
    assert_eq!(result.get::<Option<String>>(1, "email").unwrap(), None);
}

#[tokio::test]
async fn test_command_tag_rows_affected() {
    let server = MockPgServer::builder()
        .with_response(
            "UPDATE users SET active = false",
            MockResponse::command("UPDATE 7"),
        )
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();

    let result = conn
        .exec_params("UPDATE users SET active = false", &[], TIMEOUT)
        .await
        .unwrap();

    assert!(result.is_empty());
    assert_eq!(result.rows_affected(), Some(7));
}

#[tokio::test]
async fn test_unique_violation_keeps_connection() {
    let server = MockPgServer::builder()
        .with_response(
            "INSERT INTO users (email) VALUES ($1)",
            MockResponse::error("23505", "duplicate key value violates unique constraint"),
        )
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();
    let pid = conn.backend_pid();

    let err = conn
        .exec_params("INSERT INTO users (email) VALUES ($1)", &[Some("a@b.c")], TIMEOUT)
        .await
        .unwrap_err();

    assert_eq!(err.db_code(), Some(DbErrorCode::UniqueViolation));
    assert!(!err.is_infrastructure());
    assert!(conn.is_healthy());

    let ok = conn.exec_params("SELECT 1", &[], TIMEOUT).await.unwrap();
    assert_eq!(ok.rows[0][0].as_str(), Some("1"));
    assert_eq!(conn.backend_pid(), pid);
}

#[tokio::test]
async fn test_ping() {
    let server = MockPgServer::builder().build().await.unwrap();
    let mut conn = Connection::new(config_for(&server));

    // Connects on demand.
    assert!(conn.ping().await);
    assert!(conn.is_healthy());

    server.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!conn.ping().await);
    assert!(!conn.is_healthy());
}

// =============================================================================
// Infrastructure Failures
// =============================================================================

#[tokio::test]
async fn test_timeout_closes_and_cancels() {
    let server = MockPgServer::builder()
        .with_response("SELECT pg_sleep(60)", MockResponse::Hang)
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();
    let pid = conn.backend_pid().unwrap();

    let err = conn
        .exec_params("SELECT pg_sleep(60)", &[], Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(err.is_infrastructure());
    assert!(!conn.is_healthy());
    assert!(
        wait_for(&server, |events| events.contains(&MockEvent::Cancel { process_id: pid })).await,
        "cancel request not observed"
    );

    // The next call reconnects to a fresh backend.
    conn.exec_params("SELECT 1", &[], TIMEOUT).await.unwrap();
    assert_ne!(conn.backend_pid(), Some(pid));
}

#[tokio::test]
async fn test_fatal_error_closes_connection() {
    let server = MockPgServer::builder()
        .with_response(
            "SELECT 2",
            MockResponse::fatal("57P01", "terminating connection due to administrator command"),
        )
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();

    let err = conn.exec_params("SELECT 2", &[], TIMEOUT).await.unwrap_err();

    assert!(err.is_infrastructure());
    assert!(err.is_sqlstate("57P01"));
    assert!(!conn.is_healthy());
}

#[tokio::test]
async fn test_row_wider_than_description_closes_connection() {
    let server = MockPgServer::builder()
        .with_response(
            "SELECT id FROM users",
            MockResponse::Rows {
                columns: vec!["id".into()],
                rows: vec![vec![Some("1".into()), Some("extra".into())]],
            },
        )
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();

    let err = conn
        .exec_params("SELECT id FROM users", &[], TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Protocol(_)));
    assert!(err.is_infrastructure());
    assert!(!conn.is_healthy());
}

#[tokio::test]
async fn test_disconnect_mid_query() {
    let server = MockPgServer::builder()
        .with_response("SELECT 3", MockResponse::Disconnect)
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();

    let err = conn.exec_params("SELECT 3", &[], TIMEOUT).await.unwrap_err();

    assert!(err.is_infrastructure());
    assert!(!conn.is_healthy());
}

// =============================================================================
// Prepared Statements
// =============================================================================

#[tokio::test]
async fn test_prepared_statement_is_parsed_once() {
    let server = MockPgServer::builder()
        .with_response(
            "SELECT name FROM users WHERE id = $1",
            MockResponse::scalar("name", "alice"),
        )
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();

    for _ in 0..3 {
        let result = conn
            .exec_prepared(
                "user_name",
                "SELECT name FROM users WHERE id = $1",
                &[Some("1")],
                TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(result.get::<String>(0, "name").unwrap(), "alice");
    }

    assert_eq!(server.parse_count("user_name"), 1);
    assert_eq!(conn.statement_cache().len(), 1);
}

#[tokio::test]
async fn test_already_prepared_counts_as_success() {
    let sql = "SELECT count(*) FROM orders";
    let server = MockPgServer::builder()
        .with_prepared("order_count", sql)
        .with_response(sql, MockResponse::scalar("count", "12"))
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();

    let result = conn
        .exec_prepared("order_count", sql, &[], TIMEOUT)
        .await
        .unwrap();

    assert_eq!(result.get::<i64>(0, "count").unwrap(), 12);
    assert!(conn.statement_cache().peek("order_count").is_some());
    assert!(conn.is_healthy());
}

#[tokio::test]
async fn test_missing_statement_is_reprepared() {
    let sql = "SELECT total FROM orders WHERE id = $1";
    let server = MockPgServer::builder()
        .with_response(sql, MockResponse::scalar("total", "9.50"))
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();

    conn.exec_prepared("order_total", sql, &[Some("1")], TIMEOUT)
        .await
        .unwrap();
    server.forget_prepared();

    let result = conn
        .exec_prepared("order_total", sql, &[Some("1")], TIMEOUT)
        .await
        .unwrap();

    assert_eq!(result.get::<f64>(0, "total").unwrap(), 9.5);
    assert_eq!(server.parse_count("order_total"), 2);
    assert!(conn.is_healthy());
}

#[tokio::test]
async fn test_missing_statement_is_retried_only_once() {
    let sql = "SELECT status FROM orders WHERE id = $1";
    let server = MockPgServer::builder()
        .with_lost_statement("order_status")
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();

    let err = conn
        .exec_prepared("order_status", sql, &[Some("1")], TIMEOUT)
        .await
        .unwrap_err();

    assert!(err.is_sqlstate("26000"));
    assert!(!err.is_infrastructure());
    assert_eq!(server.parse_count("order_status"), 2);
    assert!(
        !server
            .events()
            .iter()
            .any(|e| matches!(e, MockEvent::Execute { sql: s, .. } if s == sql))
    );
    assert!(conn.is_healthy());
}

#[tokio::test]
async fn test_evicted_statement_is_closed() {
    let server = MockPgServer::builder().build().await.unwrap();
    let config = config_for(&server).statement_cache_size(1);
    let mut conn = Connection::open(config).await.unwrap();

    conn.exec_prepared("a", "SELECT 'a'", &[], TIMEOUT).await.unwrap();
    conn.exec_prepared("b", "SELECT 'b'", &[], TIMEOUT).await.unwrap();
    conn.exec_prepared("a", "SELECT 'a'", &[], TIMEOUT).await.unwrap();

    let events = server.events();
    let close_a = events
        .iter()
        .position(|e| *e == MockEvent::Close { name: "a".into() })
        .expect("evicted statement closed");
    let reparse_a = events
        .iter()
        .rposition(|e| matches!(e, MockEvent::Parse { name, .. } if name == "a"))
        .unwrap();
    assert!(close_a < reparse_a);
    assert_eq!(server.parse_count("a"), 2);
    assert_eq!(conn.statement_cache().len(), 1);
}

#[tokio::test]
async fn test_reconnect_clears_statement_cache() {
    let sql = "SELECT 42";
    let server = MockPgServer::builder()
        .with_response("SELECT pg_sleep(60)", MockResponse::Hang)
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();
    conn.exec_prepared("answer", sql, &[], TIMEOUT).await.unwrap();

    let _ = conn
        .exec_params("SELECT pg_sleep(60)", &[], Duration::from_millis(50))
        .await;
    assert!(conn.statement_cache().is_empty());

    conn.exec_prepared("answer", sql, &[], TIMEOUT).await.unwrap();
    assert_eq!(server.parse_count("answer"), 2);
}

// =============================================================================
// Transaction Control
// =============================================================================

#[tokio::test]
async fn test_transaction_status_tracking() {
    let server = MockPgServer::builder()
        .with_response(
            "INSERT INTO ledger VALUES ($1)",
            MockResponse::error("23502", "null value in column violates not-null constraint"),
        )
        .build()
        .await
        .unwrap();
    let mut conn = Connection::open(config_for(&server)).await.unwrap();

    conn.begin(TIMEOUT).await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::InTransaction);
    conn.commit(TIMEOUT).await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

    conn.begin(TIMEOUT).await.unwrap();
    let err = conn
        .exec_params("INSERT INTO ledger VALUES ($1)", &[None], TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.db_code(), Some(DbErrorCode::NotNullViolation));
    assert_eq!(conn.transaction_status(), TransactionStatus::Failed);

    conn.rollback(TIMEOUT).await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[tokio::test]
async fn test_drop_sends_terminate() {
    let server = MockPgServer::builder().build().await.unwrap();
    let conn = Connection::open(config_for(&server)).await.unwrap();
    drop(conn);

    assert!(wait_for(&server, |events| events.contains(&MockEvent::Terminate)).await);
}
