//! Integration tests for end-to-end WebSocket synchronization.
//!
//! These tests start a real server and connect real clients,
//! verifying the full query/mutate/notify pipeline.

use serde_json::{json, Map, Value};
use shoal_core::{ChangeKind, Record, StoreError};
use shoal_sync::client::{ConnectionState, RemoteStore};
use shoal_sync::server::{ServerConfig, SyncServer};
use std::time::Duration;
use tokio::time::timeout;

fn record(pairs: &[(&str, Value)]) -> Record {
    Record::new(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_clients_per_collection: 10,
        broadcast_capacity: 64,
        storage_path: None,
    }
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let server = SyncServer::new(test_config(port));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

#[tokio::test]
async fn test_client_connects() {
    let port = start_test_server().await;
    let client = RemoteStore::connect(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_query_empty_collection() {
    let port = start_test_server().await;
    let client = RemoteStore::connect(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    let records = client.query("ideas", None, None).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_insert_then_query() {
    let port = start_test_server().await;
    let client = RemoteStore::connect(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    client
        .insert("ideas", record(&[("text", json!("idea1"))]))
        .await
        .unwrap();

    let records = client.query("ideas", None, None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("text"), Some(&json!("idea1")));
    // Server stamped created_at on insert
    assert!(records[0].created_at().is_some());
}

#[tokio::test]
async fn test_query_projection_and_limit_over_wire() {
    let port = start_test_server().await;
    let client = RemoteStore::connect(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    for i in 0..4 {
        let mut rec = record(&[("text", json!(format!("idea{i}"))), ("votes", json!(i))]);
        rec.fields.insert("created_at".into(), json!(100 + i));
        client.insert("ideas", rec).await.unwrap();
    }

    let selection = vec!["text".to_string()];
    let records = client
        .query("ideas", Some(&selection), Some(2))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].get("text"), Some(&json!("idea3")));
    assert!(records[0].get("votes").is_none());
}

#[tokio::test]
async fn test_change_notification_fan_out() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let writer = RemoteStore::connect(&url).await.unwrap();
    let watcher = RemoteStore::connect(&url).await.unwrap();

    writer.subscribe_collection("ideas").await.unwrap();
    watcher.subscribe_collection("ideas").await.unwrap();
    let mut writer_rx = writer.subscribe();
    let mut watcher_rx = watcher.subscribe();
    // Let the subscriptions register server-side
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rec = record(&[("text", json!("idea1"))]);
    let id = rec.id;
    writer.insert("ideas", rec).await.unwrap();

    // The watcher receives the change...
    let event = timeout(Duration::from_secs(2), watcher_rx.recv())
        .await
        .expect("timed out waiting for change")
        .unwrap();
    assert_eq!(event.collection, "ideas");
    assert_eq!(event.kind, ChangeKind::Insert);
    assert_eq!(event.id, id);

    // ...and so does the writer: own changes are delivered back
    let event = timeout(Duration::from_secs(2), writer_rx.recv())
        .await
        .expect("timed out waiting for own change")
        .unwrap();
    assert_eq!(event.id, id);
}

#[tokio::test]
async fn test_subscription_scoped_to_collection() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let writer = RemoteStore::connect(&url).await.unwrap();
    let watcher = RemoteStore::connect(&url).await.unwrap();

    watcher.subscribe_collection("clients").await.unwrap();
    let mut watcher_rx = watcher.subscribe();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A mutation in a different collection must not reach the watcher
    writer
        .insert("ideas", record(&[("text", json!("elsewhere"))]))
        .await
        .unwrap();

    let result = timeout(Duration::from_millis(200), watcher_rx.recv()).await;
    assert!(result.is_err(), "expected no notification, got {result:?}");
}

#[tokio::test]
async fn test_update_and_delete_round_trip() {
    let port = start_test_server().await;
    let client = RemoteStore::connect(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    let rec = record(&[("text", json!("draft")), ("votes", json!(0))]);
    let id = rec.id;
    client.insert("ideas", rec).await.unwrap();

    let mut partial = Map::new();
    partial.insert("votes".into(), json!(9));
    client.update("ideas", id, partial).await.unwrap();

    let records = client.query("ideas", None, None).await.unwrap();
    assert_eq!(records[0].get("votes"), Some(&json!(9)));
    assert_eq!(records[0].get("text"), Some(&json!("draft")));

    client.delete("ideas", id).await.unwrap();
    let records = client.query("ideas", None, None).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_mutation_errors_surface() {
    let port = start_test_server().await;
    let client = RemoteStore::connect(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    let missing = uuid::Uuid::new_v4();
    let err = client
        .update("ideas", missing, Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Backend(_)));
    assert!(err.to_string().contains("not found"));

    let err = client.delete("ideas", missing).await.unwrap_err();
    assert!(matches!(err, StoreError::Backend(_)));
}

#[tokio::test]
async fn test_persistence_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");

    // First server run: write a record (snapshots persist on every
    // mutation), then tear everything down so the RocksDB lock releases
    let port = free_port().await;
    {
        let config = ServerConfig {
            storage_path: Some(db_path.clone()),
            ..test_config(port)
        };
        let server = SyncServer::new(config);
        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = RemoteStore::connect(format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap();
        client
            .insert("ideas", record(&[("text", json!("durable"))]))
            .await
            .unwrap();

        // Close the connection and let its handler task exit before
        // stopping the accept loop, so every store handle is dropped
        drop(client);
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();
        let _ = handle.await;
    }

    // Second server run on a fresh port, same storage
    let port2 = free_port().await;
    let config = ServerConfig {
        storage_path: Some(db_path),
        ..test_config(port2)
    };
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = RemoteStore::connect(format!("ws://127.0.0.1:{port2}"))
        .await
        .unwrap();
    let records = client.query("ideas", None, None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("text"), Some(&json!("durable")));
}

#[tokio::test]
async fn test_duplicate_insert_rejected_over_wire() {
    let port = start_test_server().await;
    let client = RemoteStore::connect(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    let rec = record(&[("text", json!("once"))]);
    let dup = Record::with_id(rec.id, Map::new());

    client.insert("ideas", rec).await.unwrap();
    let err = client.insert("ideas", dup).await.unwrap_err();
    assert!(err.to_string().contains("duplicate"));
}
