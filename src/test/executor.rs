use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bson::{doc, Bson, Document, Timestamp};
use pretty_assertions::assert_eq;

use super::{hello_reply, mongos_hello_reply, MockServer};
use crate::{
    concern::{Acknowledgment, WriteConcern},
    error::ErrorKind,
    options::InsertOneOptions,
};

#[tokio::test]
async fn insert_one_round_trip() {
    let server = MockServer::new(|command| {
        if command.contains_key("insert") {
            doc! { "ok": 1, "n": 1 }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    let result = collection
        .insert_one(doc! { "_id": 42 }, None)
        .await
        .unwrap();
    assert_eq!(result.inserted_id, Bson::Int32(42));

    let commands = server.received_commands();
    let insert = commands
        .iter()
        .find(|c| c.contains_key("insert"))
        .expect("insert command sent");
    assert_eq!(insert.get_str("insert"), Ok("coll"));
    assert_eq!(insert.get_str("$db"), Ok("db"));
    // An implicit session rode along.
    assert!(insert.contains_key("lsid"));
    // Eligible single-document writes get a transaction number for retryability.
    assert!(insert.contains_key("txnNumber"));

    client.shutdown().await;
}

#[tokio::test]
async fn retryable_write_reuses_txn_number_on_not_master() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_handler = attempts.clone();

    let server = MockServer::new(move |command| {
        if command.contains_key("insert") {
            if attempts_in_handler.fetch_add(1, Ordering::SeqCst) == 0 {
                doc! {
                    "ok": 0,
                    "code": 10107,
                    "codeName": "NotWritablePrimary",
                    "errmsg": "not master",
                    "errorLabels": ["RetryableWriteError"],
                }
            } else {
                doc! { "ok": 1, "n": 1 }
            }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    collection
        .insert_one(doc! { "_id": 1 }, None)
        .await
        .expect("retry should succeed");

    // At most one retry: exactly two attempts total.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let commands = server.received_commands();
    let inserts: Vec<&Document> = commands
        .iter()
        .filter(|c| c.contains_key("insert"))
        .collect();
    assert_eq!(inserts.len(), 2);

    // The retry reuses the same transaction number so the server can deduplicate.
    let first_txn = inserts[0].get_i64("txnNumber").unwrap();
    let second_txn = inserts[1].get_i64("txnNumber").unwrap();
    assert_eq!(first_txn, second_txn);

    client.shutdown().await;
}

#[tokio::test]
async fn non_retryable_error_surfaces_after_one_attempt() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_handler = attempts.clone();

    let server = MockServer::new(move |command| {
        if command.contains_key("insert") {
            attempts_in_handler.fetch_add(1, Ordering::SeqCst);
            doc! { "ok": 0, "code": 11000, "codeName": "DuplicateKey", "errmsg": "duplicate key" }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    let error = collection
        .insert_one(doc! { "_id": 1 }, None)
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(11000));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn multi_document_writes_are_not_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_handler = attempts.clone();

    let server = MockServer::new(move |command| {
        if command.contains_key("update") {
            attempts_in_handler.fetch_add(1, Ordering::SeqCst);
            doc! {
                "ok": 0,
                "code": 10107,
                "codeName": "NotWritablePrimary",
                "errmsg": "not master",
                "errorLabels": ["RetryableWriteError"],
            }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    let error = collection
        .update_many(doc! {}, doc! { "$set": { "a": 1 } }, None)
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(10107));

    // updateMany is not retryable; exactly one attempt.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let commands = server.received_commands();
    let update = commands.iter().find(|c| c.contains_key("update")).unwrap();
    assert!(!update.contains_key("txnNumber"));

    client.shutdown().await;
}

#[tokio::test]
async fn cluster_time_gossip_is_monotonic() {
    let earlier = Timestamp {
        time: 100,
        increment: 1,
    };
    let later = Timestamp {
        time: 200,
        increment: 1,
    };

    let call_count = Arc::new(AtomicUsize::new(0));
    let call_count_in_handler = call_count.clone();
    let server = MockServer::new(move |command| {
        if command.contains_key("ping") {
            // The later cluster time arrives first; the earlier one must not regress the
            // stored value.
            let time = if call_count_in_handler.fetch_add(1, Ordering::SeqCst) == 0 {
                later
            } else {
                earlier
            };
            doc! {
                "ok": 1,
                "$clusterTime": { "clusterTime": time, "signature": { "keyId": 0i64 } },
            }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let db = client.database("admin");
    db.run_command(doc! { "ping": 1 }, None).await.unwrap();
    db.run_command(doc! { "ping": 1 }, None).await.unwrap();

    let stored = client.topology().cluster_time().expect("gossiped time");
    assert_eq!(stored.cluster_time, later);

    // Outgoing commands after gossip carry the stored cluster time.
    db.run_command(doc! { "ping": 1 }, None).await.unwrap();
    let commands = server.received_commands();
    let last_ping = commands
        .iter()
        .filter(|c| c.contains_key("ping"))
        .last()
        .unwrap();
    let sent = last_ping
        .get_document("$clusterTime")
        .expect("$clusterTime appended");
    assert_eq!(sent.get_timestamp("clusterTime"), Ok(later));

    client.shutdown().await;
}

#[tokio::test]
async fn pooled_connections_are_reused_across_operations() {
    let server = MockServer::new(|command| {
        if command.contains_key("ping") {
            doc! { "ok": 1 }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let db = client.database("admin");
    db.run_command(doc! { "ping": 1 }, None).await.unwrap();
    db.run_command(doc! { "ping": 1 }, None).await.unwrap();

    // One stream for the monitor, one pooled application connection for both commands.
    assert_eq!(server.connection_count(), 2);

    let state = client.topology().watch().peek_latest();
    let server_state = state.servers().values().next().unwrap();
    assert_eq!(server_state.pool.available_len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn server_sessions_are_pooled_after_use() {
    let server = MockServer::new(|_| mongos_hello_reply());
    let client = server.client().unwrap();
    client.clear_session_pool().await;

    let session = client.start_session(None).await.unwrap();
    let id = session.id().clone();
    drop(session);

    // The check-in runs on a spawned task; give it a chance to land.
    let mut checked_in = false;
    for _ in 0..100 {
        tokio::task::yield_now().await;
        if client.is_session_checked_in(&id).await {
            checked_in = true;
            break;
        }
    }
    assert!(checked_in);

    // The pooled server session backs the next session started.
    let reused = client.start_session(None).await.unwrap();
    assert_eq!(reused.id(), &id);

    client.shutdown().await;
}

#[tokio::test]
async fn explicit_session_with_unacknowledged_write_concern_rejected() {
    let server = MockServer::new(|command| {
        if command.contains_key("insert") {
            doc! { "ok": 1, "n": 1 }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let mut session = client.start_session(None).await.unwrap();
    let collection = client.database("db").collection("coll");

    let options = InsertOneOptions::builder()
        .write_concern(WriteConcern::builder().w(Acknowledgment::Nodes(0)).build())
        .build();
    let error = collection
        .insert_one_with_session(doc! { "a": 1 }, options, &mut session)
        .await
        .unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::InvalidArgument { .. }
    ));

    client.shutdown().await;
}

#[tokio::test]
async fn find_iterates_across_batches() {
    let server = MockServer::new(|command| {
        if command.contains_key("find") {
            doc! {
                "ok": 1,
                "cursor": {
                    "id": 99i64,
                    "ns": "db.coll",
                    "firstBatch": [ { "x": 1 }, { "x": 2 } ],
                },
            }
        } else if command.contains_key("getMore") {
            doc! {
                "ok": 1,
                "cursor": {
                    "id": 0i64,
                    "ns": "db.coll",
                    "nextBatch": [ { "x": 3 } ],
                },
            }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    let mut cursor = collection.find(doc! {}, None).await.unwrap();

    let mut values = Vec::new();
    while let Some(doc) = cursor.next().await.transpose().unwrap() {
        values.push(doc.get_i32("x").unwrap());
    }
    assert_eq!(values, vec![1, 2, 3]);

    let commands = server.received_commands();
    assert!(commands.iter().any(|c| c.contains_key("getMore")));

    client.shutdown().await;
}

#[tokio::test]
async fn find_streams_documents_through_stream_impl() {
    use futures::StreamExt;

    let server = MockServer::new(|command| {
        if command.contains_key("find") {
            doc! {
                "ok": 1,
                "cursor": {
                    "id": 7i64,
                    "ns": "db.coll",
                    "firstBatch": [ { "x": 1 } ],
                },
            }
        } else if command.contains_key("getMore") {
            doc! {
                "ok": 1,
                "cursor": {
                    "id": 0i64,
                    "ns": "db.coll",
                    "nextBatch": [ { "x": 2 }, { "x": 3 } ],
                },
            }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    let cursor = collection.find(doc! {}, None).await.unwrap();

    // The getMore crossing happens transparently inside poll_next.
    let values: Vec<i32> = cursor
        .map(|doc| doc.unwrap().get_i32("x").unwrap())
        .collect()
        .await;
    assert_eq!(values, vec![1, 2, 3]);

    client.shutdown().await;
}

#[tokio::test]
async fn transaction_commands_carry_transaction_fields() {
    let server = MockServer::new(|command| {
        if command.contains_key("insert") || command.contains_key("commitTransaction") {
            doc! { "ok": 1, "n": 1 }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();

    let collection = client.database("db").collection("coll");
    collection
        .insert_one_with_session(doc! { "a": 1 }, None, &mut session)
        .await
        .unwrap();
    session.commit_transaction().await.unwrap();

    let commands = server.received_commands();
    let insert = commands.iter().find(|c| c.contains_key("insert")).unwrap();
    assert_eq!(insert.get_bool("startTransaction"), Ok(true));
    assert_eq!(insert.get_bool("autocommit"), Ok(false));
    assert!(insert.contains_key("txnNumber"));
    assert!(insert.contains_key("lsid"));
    // Individual commands inside a transaction must not carry a write concern.
    assert!(!insert.contains_key("writeConcern"));

    let commit = commands
        .iter()
        .find(|c| c.contains_key("commitTransaction"))
        .expect("commitTransaction sent");
    assert_eq!(commit.get_bool("autocommit"), Ok(false));
    assert!(!commit.contains_key("startTransaction"));
    assert_eq!(
        insert.get_i64("txnNumber").unwrap(),
        commit.get_i64("txnNumber").unwrap()
    );

    client.shutdown().await;
}
