use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bson::{doc, Bson, Document};
use pretty_assertions::assert_eq;

use crate::{
    error::ErrorKind,
    test::{mongos_hello_reply, MockServer},
};

fn change_event(token: i32) -> Document {
    doc! {
        "_id": { "_data": token },
        "operationType": "insert",
        "ns": { "db": "db", "coll": "coll" },
        "fullDocument": { "x": token },
    }
}

#[tokio::test]
async fn resume_token_tracks_returned_documents() {
    let server = MockServer::new(|command| {
        if command.contains_key("aggregate") {
            doc! {
                "ok": 1,
                "cursor": {
                    "id": 5i64,
                    "ns": "db.coll",
                    "firstBatch": [ change_event(1), change_event(2) ],
                },
            }
        } else if command.contains_key("getMore") {
            doc! {
                "ok": 1,
                "cursor": { "id": 5i64, "ns": "db.coll", "nextBatch": [] },
            }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    let mut stream = collection.watch(None, None).await.unwrap();

    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.get_document("_id").unwrap(), &doc! { "_data": 1 });
    // Immediately after a document is returned, the stored token is its _id.
    assert_eq!(
        stream.resume_token().unwrap().into_bson(),
        Bson::Document(doc! { "_data": 1 })
    );

    stream.next().await.unwrap().unwrap();
    assert_eq!(
        stream.resume_token().unwrap().into_bson(),
        Bson::Document(doc! { "_data": 2 })
    );

    client.shutdown().await;
}

#[tokio::test]
async fn one_shot_resume_after_get_more_failure() {
    let aggregates = Arc::new(AtomicUsize::new(0));
    let aggregates_in_handler = aggregates.clone();
    let resume_after: Arc<std::sync::Mutex<Option<Document>>> = Default::default();
    let resume_after_in_handler = resume_after.clone();

    let server = MockServer::new(move |command| {
        if command.contains_key("aggregate") {
            let run = aggregates_in_handler.fetch_add(1, Ordering::SeqCst);
            if run == 0 {
                doc! {
                    "ok": 1,
                    "cursor": {
                        "id": 7i64,
                        "ns": "db.coll",
                        "firstBatch": [ change_event(1) ],
                    },
                }
            } else {
                // Capture the $changeStream stage of the resumed aggregation.
                let pipeline = command.get_array("pipeline").unwrap();
                let stage = pipeline[0]
                    .as_document()
                    .unwrap()
                    .get_document("$changeStream")
                    .unwrap();
                *resume_after_in_handler.lock().unwrap() =
                    stage.get_document("resumeAfter").ok().cloned();
                doc! {
                    "ok": 1,
                    "cursor": {
                        "id": 8i64,
                        "ns": "db.coll",
                        "firstBatch": [ change_event(2) ],
                    },
                }
            }
        } else if command.contains_key("getMore") {
            doc! { "ok": 0, "code": 10107, "codeName": "NotWritablePrimary", "errmsg": "not master" }
        } else if command.contains_key("killCursors") {
            doc! { "ok": 1 }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    let mut stream = collection.watch(None, None).await.unwrap();

    // First document from the original aggregation.
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.get_document("_id").unwrap(), &doc! { "_data": 1 });

    // The getMore fails with a resumable error; the stream resumes transparently and the
    // caller sees the next document with no error in between.
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.get_document("_id").unwrap(), &doc! { "_data": 2 });

    assert_eq!(aggregates.load(Ordering::SeqCst), 2);
    assert_eq!(
        resume_after.lock().unwrap().clone(),
        Some(doc! { "_data": 1 })
    );

    client.shutdown().await;
}

#[tokio::test]
async fn second_failure_surfaces_to_caller() {
    let server = MockServer::new(move |command| {
        if command.contains_key("aggregate") {
            doc! {
                "ok": 1,
                "cursor": { "id": 7i64, "ns": "db.coll", "firstBatch": [] },
            }
        } else if command.contains_key("getMore") {
            doc! { "ok": 0, "code": 10107, "codeName": "NotWritablePrimary", "errmsg": "not master" }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    let mut stream = collection.watch(None, None).await.unwrap();

    // First failure consumes the stream's single resume; the second surfaces.
    let error = stream.next().await.unwrap().unwrap_err();
    assert_eq!(error.code(), Some(10107));

    client.shutdown().await;
}

#[tokio::test]
async fn missing_resume_token_is_not_resumable() {
    let server = MockServer::new(|command| {
        if command.contains_key("aggregate") {
            doc! {
                "ok": 1,
                "cursor": {
                    "id": 0i64,
                    "ns": "db.coll",
                    // A $project stage stripped the _id.
                    "firstBatch": [ { "operationType": "insert" } ],
                },
            }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    let mut stream = collection.watch(None, None).await.unwrap();

    let error = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::MissingResumeToken
    ));

    client.shutdown().await;
}

#[tokio::test]
async fn non_resumable_error_surfaces_immediately() {
    let aggregates = Arc::new(AtomicUsize::new(0));
    let aggregates_in_handler = aggregates.clone();
    let server = MockServer::new(move |command| {
        if command.contains_key("aggregate") {
            aggregates_in_handler.fetch_add(1, Ordering::SeqCst);
            doc! {
                "ok": 1,
                "cursor": { "id": 7i64, "ns": "db.coll", "firstBatch": [] },
            }
        } else if command.contains_key("getMore") {
            // Interrupted: not in the resumable set.
            doc! { "ok": 0, "code": 11601, "codeName": "Interrupted", "errmsg": "interrupted" }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();

    let collection = client.database("db").collection("coll");
    let mut stream = collection.watch(None, None).await.unwrap();

    let error = stream.next().await.unwrap().unwrap_err();
    assert_eq!(error.code(), Some(11601));
    // No resume was attempted.
    assert_eq!(aggregates.load(Ordering::SeqCst), 1);

    client.shutdown().await;
}
