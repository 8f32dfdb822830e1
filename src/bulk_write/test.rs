use bson::{doc, Bson, Document};
use pretty_assertions::assert_eq;

use super::{BulkWriteOptions, InsertOneModel, WriteModel};
use crate::{
    cmap::StreamDescription,
    error::ErrorKind,
    operation::{BulkWriteOperation, Operation},
    test::{hello_reply, MockServer},
    Namespace,
};

fn insert_model(ns: &str, doc: Document) -> WriteModel {
    WriteModel::InsertOne(
        InsertOneModel::builder()
            .namespace(ns.parse::<Namespace>().unwrap())
            .document(doc)
            .build(),
    )
}

fn delete_one_model(ns: &str) -> WriteModel {
    WriteModel::DeleteOne(
        super::DeleteOneModel::builder()
            .namespace(ns.parse::<Namespace>().unwrap())
            .filter(doc! { "x": 1 })
            .build(),
    )
}

fn description() -> StreamDescription {
    let mut description = StreamDescription::new_testing();
    description.max_wire_version = Some(25);
    description
}

#[test]
fn batch_splits_at_max_write_batch_size() {
    let models: Vec<WriteModel> = (0..5)
        .map(|i| insert_model("db.coll", doc! { "i": i as i32 }))
        .collect();
    let options = BulkWriteOptions::default();

    let mut description = description();
    description.max_write_batch_size = 3;

    let mut first = BulkWriteOperation::new(&models, 0, &options, false);
    let command = first.build(&description).unwrap();
    assert_eq!(first.n_attempted, 3);
    let ops = command
        .document_sequences
        .iter()
        .find(|seq| seq.identifier == "ops")
        .unwrap();
    assert_eq!(ops.documents.len(), 3);

    let mut second = BulkWriteOperation::new(&models[3..], 3, &options, false);
    let command = second.build(&description).unwrap();
    assert_eq!(second.n_attempted, 2);
    let ops = command
        .document_sequences
        .iter()
        .find(|seq| seq.identifier == "ops")
        .unwrap();
    assert_eq!(ops.documents.len(), 2);
}

#[test]
fn ns_info_lists_namespaces_in_first_seen_order() {
    let models = vec![
        insert_model("db.first", doc! { "a": 1 }),
        insert_model("db.second", doc! { "b": 2 }),
        insert_model("db.first", doc! { "c": 3 }),
        delete_one_model("db.third"),
    ];
    let options = BulkWriteOptions::default();

    let mut operation = BulkWriteOperation::new(&models, 0, &options, false);
    let command = operation.build(&description()).unwrap();

    let ns_info = command
        .document_sequences
        .iter()
        .find(|seq| seq.identifier == "nsInfo")
        .unwrap();
    let namespaces: Vec<String> = ns_info
        .documents
        .iter()
        .map(|doc| doc.get_str("ns").unwrap().to_string())
        .collect();
    assert_eq!(namespaces, vec!["db.first", "db.second", "db.third"]);

    // Each op's namespace field is an index into this batch's nsInfo.
    let ops = command
        .document_sequences
        .iter()
        .find(|seq| seq.identifier == "ops")
        .unwrap();
    let indexes: Vec<i32> = ops
        .documents
        .iter()
        .map(|doc| {
            let key = if doc.get("insert").unwrap().is_some() {
                "insert"
            } else {
                "delete"
            };
            doc.get_i32(key).unwrap()
        })
        .collect();
    assert_eq!(indexes, vec![0, 1, 0, 2]);
}

#[test]
fn message_size_limit_splits_batches() {
    let big = "x".repeat(900);
    let models: Vec<WriteModel> = (0..10)
        .map(|_| insert_model("db.coll", doc! { "pad": big.clone() }))
        .collect();
    let options = BulkWriteOptions::default();

    let mut description = description();
    // Room for a few ops but nowhere near all ten, once overhead is subtracted.
    description.max_message_size_bytes = 5_000;

    let mut operation = BulkWriteOperation::new(&models, 0, &options, false);
    operation.build(&description).unwrap();
    assert!(operation.n_attempted >= 1);
    assert!(operation.n_attempted < 10);
}

#[test]
fn oversized_model_error_cites_original_index() {
    let big = "x".repeat(20_000);
    let models = vec![insert_model("db.coll", doc! { "pad": big })];
    let options = BulkWriteOptions::default();

    let mut description = description();
    description.max_message_size_bytes = 10_000;

    // The operation starts partway through an engine run; the error must cite the
    // original model index, not the batch-relative one.
    let mut operation = BulkWriteOperation::new(&models, 7, &options, false);
    let error = operation.build(&description).unwrap_err();
    match error.kind.as_ref() {
        ErrorKind::InvalidArgument { message } => assert!(message.contains("index 7")),
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
}

#[test]
fn server_too_old_for_bulk_write() {
    let models = vec![insert_model("db.coll", doc! { "a": 1 })];
    let options = BulkWriteOptions::default();

    let mut description = description();
    description.max_wire_version = Some(17);

    let mut operation = BulkWriteOperation::new(&models, 0, &options, false);
    let error = operation.build(&description).unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::IncompatibleServer { .. }
    ));
}

#[test]
fn inserts_get_generated_ids_prepended() {
    let models = vec![insert_model("db.coll", doc! { "a": 1 })];
    let options = BulkWriteOptions::default();

    let mut operation = BulkWriteOperation::new(&models, 0, &options, false);
    let command = operation.build(&description()).unwrap();

    let id = operation.inserted_ids.get(&0).unwrap();
    assert!(matches!(id, Bson::ObjectId(_)));

    let ops = command
        .document_sequences
        .iter()
        .find(|seq| seq.identifier == "ops")
        .unwrap();
    let document = ops.documents[0].get_document("document").unwrap();
    // The generated _id is the first field, so the server stores it first.
    let (first_key, _) = document.into_iter().next().unwrap().unwrap();
    assert_eq!(first_key, "_id");
}

#[tokio::test]
async fn bulk_write_rejects_reuse_and_empty_batches() {
    let server = MockServer::new(|_| hello_reply());
    let client = server.client().unwrap();

    let mut bulk = client.bulk_write();
    let error = bulk.execute(None).await.unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::InvalidArgument { .. }
    ));

    // The failed execution still consumed the bulk write.
    let error = bulk
        .append(insert_model("db.coll", doc! { "a": 1 }))
        .unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::InvalidArgument { .. }
    ));

    client.shutdown().await;
}

#[tokio::test]
async fn ordered_bulk_write_with_duplicate_key() {
    let server = MockServer::new(move |command| {
        if command.contains_key("bulkWrite") {
            assert_eq!(command.get_bool("errorsOnly"), Ok(false));
            assert_eq!(command.get_bool("ordered"), Ok(true));
            doc! {
                "ok": 1,
                "cursor": {
                    "id": 0i64,
                    "ns": "admin.$cmd.bulkWrite",
                    "firstBatch": [
                        { "ok": 1, "idx": 0, "n": 1 },
                        { "ok": 0, "idx": 1, "code": 11000, "errmsg": "duplicate key" },
                    ],
                },
                "nInserted": 1,
                "nMatched": 0,
                "nModified": 0,
                "nUpserted": 0,
                "nDeleted": 0,
                "nErrors": 1,
            }
        } else {
            hello_reply()
        }
    });
    let client = server.client().unwrap();

    let mut bulk = client.bulk_write();
    bulk.append(insert_model("db.coll", doc! { "_id": 1 }))
        .unwrap();
    bulk.append(insert_model("db.coll", doc! { "_id": 1 }))
        .unwrap();

    let options = BulkWriteOptions::builder()
        .ordered(true)
        .verbose_results(true)
        .build();
    let error = bulk.execute(options).await.unwrap_err();

    match error.kind.as_ref() {
        ErrorKind::ClientBulkWrite(exception) => {
            let write_error = exception.write_errors.get(&1).expect("error at index 1");
            assert_eq!(write_error.code, 11000);

            let partial = exception.partial_result.as_ref().expect("partial result");
            assert_eq!(partial.inserted_count, 1);
            let insert_results = partial.insert_results.as_ref().unwrap();
            assert!(insert_results.contains_key(&0));
            assert!(!insert_results.contains_key(&1));
        }
        other => panic!("expected ClientBulkWrite error, got {:?}", other),
    }

    client.shutdown().await;
}

#[tokio::test]
async fn insert_split_produces_two_batches_with_one_session() {
    let server = MockServer::new(move |command| {
        if let Ok(ops) = command.get_array("ops") {
            doc! {
                "ok": 1,
                "cursor": {
                    "id": 0i64,
                    "ns": "admin.$cmd.bulkWrite",
                    "firstBatch": [],
                },
                "nInserted": ops.len() as i64,
                "nErrors": 0,
            }
        } else {
            let mut reply = hello_reply();
            reply.insert("maxWriteBatchSize", 2);
            reply
        }
    });
    let client = server.client().unwrap();

    let mut bulk = client.bulk_write();
    for i in 0..3 {
        bulk.append(insert_model("db.coll", doc! { "a": i as i32 }))
            .unwrap();
    }
    let result = bulk.execute(None).await.unwrap();
    assert_eq!(result.inserted_count, 3);

    let commands = server.received_commands();
    let bulk_commands: Vec<&Document> = commands
        .iter()
        .filter(|c| c.contains_key("bulkWrite"))
        .collect();
    assert_eq!(bulk_commands.len(), 2);
    assert_eq!(bulk_commands[0].get_array("ops").unwrap().len(), 2);
    assert_eq!(bulk_commands[1].get_array("ops").unwrap().len(), 1);

    // Both batches ran under the same logical session.
    assert_eq!(
        bulk_commands[0].get_document("lsid").unwrap(),
        bulk_commands[1].get_document("lsid").unwrap()
    );

    client.shutdown().await;
}
