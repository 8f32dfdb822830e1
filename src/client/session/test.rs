use bson::{doc, Timestamp};
use pretty_assertions::assert_eq;

use super::{ServerSession, SessionOptions, Transaction, TransactionState};
use crate::{
    client::session::ClusterTime,
    concern::{Acknowledgment, WriteConcern},
    error::ErrorKind,
    test::{mongos_hello_reply, MockServer},
};

#[test]
fn server_session_txn_numbers_are_monotonic() {
    let mut session = ServerSession::new();
    assert_eq!(session.txn_number, 0);
    session.txn_number += 1;
    session.txn_number += 1;
    assert_eq!(session.txn_number, 2);
}

#[test]
fn server_session_ids_are_unique() {
    let a = ServerSession::new();
    let b = ServerSession::new();
    assert_ne!(a.id, b.id);
}

#[test]
fn transaction_state_transitions() {
    let mut transaction = Transaction::new();
    assert_eq!(transaction.state, TransactionState::None);

    transaction.start(None);
    assert_eq!(transaction.state, TransactionState::Starting);

    transaction.state = TransactionState::InProgress;
    transaction.commit(true);
    assert_eq!(
        transaction.state,
        TransactionState::Committed {
            data_committed: true
        }
    );

    // Committed -> Starting for the next transaction on the same session.
    transaction.start(None);
    assert_eq!(transaction.state, TransactionState::Starting);

    transaction.state = TransactionState::InProgress;
    transaction.abort();
    assert_eq!(transaction.state, TransactionState::Aborted);
    assert!(transaction.pinned_address.is_none());

    transaction.reset();
    assert_eq!(transaction.state, TransactionState::None);
}

#[test]
fn session_options_reject_unacknowledged_transaction_write_concern() {
    let options = SessionOptions::builder()
        .default_transaction_options(
            super::TransactionOptions::builder()
                .write_concern(WriteConcern::builder().w(Acknowledgment::Nodes(0)).build())
                .build(),
        )
        .build();
    assert!(options.validate().is_err());
}

#[tokio::test]
async fn session_cluster_time_advances_monotonically() {
    let server = MockServer::new(|_| mongos_hello_reply());
    let client = server.client().unwrap();
    let mut session = client.start_session(None).await.unwrap();

    let earlier = ClusterTime {
        cluster_time: Timestamp {
            time: 1,
            increment: 0,
        },
        signature: doc! {},
    };
    let later = ClusterTime {
        cluster_time: Timestamp {
            time: 2,
            increment: 0,
        },
        signature: doc! {},
    };

    session.advance_cluster_time(&later);
    session.advance_cluster_time(&earlier);
    assert_eq!(session.cluster_time(), Some(&later));

    session.advance_operation_time(Timestamp {
        time: 10,
        increment: 0,
    });
    session.advance_operation_time(Timestamp {
        time: 5,
        increment: 0,
    });
    assert_eq!(
        session.operation_time(),
        Some(Timestamp {
            time: 10,
            increment: 0
        })
    );

    client.shutdown().await;
}

#[tokio::test]
async fn illegal_transaction_transitions_are_rejected() {
    let server = MockServer::new(|command| {
        if command.contains_key("insert") {
            doc! { "ok": 1, "n": 1 }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();
    let mut session = client.start_session(None).await.unwrap();

    // No transaction started yet.
    let error = session.commit_transaction().await.unwrap_err();
    assert!(matches!(error.kind.as_ref(), ErrorKind::Transaction { .. }));
    let error = session.abort_transaction().await.unwrap_err();
    assert!(matches!(error.kind.as_ref(), ErrorKind::Transaction { .. }));

    session.start_transaction(None).await.unwrap();
    let error = session.start_transaction(None).await.unwrap_err();
    assert!(matches!(error.kind.as_ref(), ErrorKind::Transaction { .. }));

    // Abort before any operation ran: no command is sent.
    session.abort_transaction().await.unwrap();
    assert!(!server
        .received_commands()
        .iter()
        .any(|c| c.contains_key("abortTransaction")));

    // Abort -> commit is illegal; abort -> start is legal.
    let error = session.commit_transaction().await.unwrap_err();
    assert!(matches!(error.kind.as_ref(), ErrorKind::Transaction { .. }));
    session.start_transaction(None).await.unwrap();

    client.shutdown().await;
}

#[tokio::test]
async fn commit_without_operations_sends_no_command() {
    let server = MockServer::new(|_| mongos_hello_reply());
    let client = server.client().unwrap();
    let mut session = client.start_session(None).await.unwrap();

    session.start_transaction(None).await.unwrap();
    session.commit_transaction().await.unwrap();

    assert!(!server
        .received_commands()
        .iter()
        .any(|c| c.contains_key("commitTransaction")));

    client.shutdown().await;
}

#[tokio::test]
async fn transaction_rejects_per_operation_write_concern() {
    let server = MockServer::new(|command| {
        if command.contains_key("insert") {
            doc! { "ok": 1, "n": 1 }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();
    let mut session = client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();

    let collection = client.database("db").collection("coll");
    let options = crate::options::InsertOneOptions::builder()
        .write_concern(WriteConcern::majority())
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
async fn with_transaction_commits_on_success() {
    let server = MockServer::new(|command| {
        if command.contains_key("insert") || command.contains_key("commitTransaction") {
            doc! { "ok": 1, "n": 1 }
        } else {
            mongos_hello_reply()
        }
    });
    let client = server.client().unwrap();
    let mut session = client.start_session(None).await.unwrap();

    let collection = client.database("db").collection("coll");
    let collection_in_callback = collection.clone();
    session
        .with_transaction(
            move |session| {
                let collection = collection_in_callback.clone();
                Box::pin(async move {
                    collection
                        .insert_one_with_session(doc! { "a": 1 }, None, session)
                        .await?;
                    Ok(())
                })
            },
            None,
        )
        .await
        .unwrap();

    let commands = server.received_commands();
    assert!(commands.iter().any(|c| c.contains_key("insert")));
    assert!(commands.iter().any(|c| c.contains_key("commitTransaction")));

    client.shutdown().await;
}
