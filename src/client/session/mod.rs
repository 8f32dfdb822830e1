//! Contains the functionality for client sessions: causal consistency, transactions, and
//! retryable-write transaction numbers.

mod cluster_time;
mod pool;

#[cfg(test)]
mod test;

use std::time::{Duration, Instant};

use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

pub use cluster_time::ClusterTime;
pub(crate) use pool::{ServerSession, ServerSessionPool};

use crate::{
    concern::{ReadConcern, WriteConcern},
    error::{
        Error, ErrorKind, Result, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    operation::{AbortTransaction, CommitTransaction},
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
    BoxFuture, Client,
};

/// The amount of time within which `with_transaction` keeps retrying a transaction that
/// fails with a transient error.
const MAX_WITH_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Contains the options that can be used to create a new [`ClientSession`].
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session.
    ///
    /// If these options are not specified, they will be inherited from the topology or
    /// client associated with this session, but they will not share the same instance of
    /// options with them.
    pub default_transaction_options: Option<TransactionOptions>,

    /// If true, all read operations performed using this client session will share the same
    /// causal consistency session, meaning eventually consistent reads performed in this
    /// session will observe their own writes.
    ///
    /// Defaults to true.
    pub causal_consistency: Option<bool>,
}

impl SessionOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(ref write_concern) = self
            .default_transaction_options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
        {
            if !write_concern.is_acknowledged() {
                return Err(Error::invalid_argument(
                    "transactions do not support unacknowledged write concerns",
                ));
            }
        }
        Ok(())
    }
}

/// Contains the options that can be used for a transaction.
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern to use for the transaction.
    pub read_concern: Option<ReadConcern>,

    /// The write concern to use when committing or aborting a transaction. This is the only
    /// write concern a transaction carries; per-operation write concerns are forbidden
    /// inside one.
    pub write_concern: Option<WriteConcern>,

    /// The selection criteria to use for all read operations in a transaction.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The maximum amount of time to allow a single commitTransaction to run.
    #[serde(rename = "maxTimeMS", skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub max_commit_time: Option<Duration>,
}

/// The state of a transaction over its lifecycle.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TransactionState {
    None,
    Starting,
    InProgress,
    Committed {
        /// Whether any data was actually committed, i.e. whether commitTransaction ran
        /// against a transaction that had executed at least one operation. Re-committing a
        /// data-less transaction stays a no-op.
        data_committed: bool,
    },
    Aborted,
}

#[derive(Debug)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    /// The mongos this transaction is pinned to, if any. All statements of a sharded
    /// transaction must land on one mongos.
    pub(crate) pinned_address: Option<ServerAddress>,
    pub(crate) recovery_token: Option<Document>,
}

impl Transaction {
    fn new() -> Self {
        Self {
            state: TransactionState::None,
            options: None,
            pinned_address: None,
            recovery_token: None,
        }
    }

    pub(crate) fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.pinned_address = None;
        self.recovery_token = None;
    }

    pub(crate) fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    pub(crate) fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
        self.pinned_address = None;
    }

    pub(crate) fn reset(&mut self) {
        self.state = TransactionState::None;
        self.options = None;
        self.pinned_address = None;
        self.recovery_token = None;
    }
}

/// A MongoDB client session. This struct represents a logical session used for ordering
/// sequential operations.
///
/// Sessions are created through [`Client::start_session`] and are cheap. They may not be
/// shared between clients or used concurrently: the invariant is at most one in-flight
/// operation per session, enforced by requiring `&mut self` for every operation.
///
/// ```no_run
/// # use mongodb_core::{bson::doc, Client, error::Result};
/// # async fn run(client: Client) -> Result<()> {
/// let mut session = client.start_session(None).await?;
/// let coll = client.database("app").collection("events");
/// coll.insert_one_with_session(doc! { "seq": 1 }, None, &mut session).await?;
/// coll.insert_one_with_session(doc! { "seq": 2 }, None, &mut session).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,
    server_session: Option<ServerSession>,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    pub(crate) transaction: Transaction,
    pub(crate) operation_time: Option<Timestamp>,
}

impl ClientSession {
    pub(crate) fn new(
        server_session: ServerSession,
        client: Client,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        Self {
            cluster_time: None,
            server_session: Some(server_session),
            client,
            is_implicit,
            options,
            transaction: Transaction::new(),
            operation_time: None,
        }
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self
            .server_session
            .as_ref()
            .expect("session unexpectedly checked in")
            .id
    }

    /// The highest cluster time this session has seen.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The operation time of the most recent operation executed with this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// The options this session was created with.
    pub fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    pub(crate) fn causal_consistency(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|options| options.causal_consistency)
            .unwrap_or(true)
    }

    pub(crate) fn in_transaction(&self) -> bool {
        matches!(
            self.transaction.state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    pub(crate) fn transaction_options(&self) -> Option<&TransactionOptions> {
        self.transaction.options.as_ref()
    }

    /// Set the cluster time to the provided one if it is greater than this session's
    /// highest seen cluster time or if this session's cluster time is `None`.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time.as_ref() < Some(to) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Set the operation time to the provided one if it is greater than this session's
    /// highest seen operation time.
    pub fn advance_operation_time(&mut self, to: Timestamp) {
        if self.operation_time.map_or(true, |current| to > current) {
            self.operation_time = Some(to);
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        if let Some(ref mut session) = self.server_session {
            session.dirty = true;
        }
    }

    pub(crate) fn update_last_use(&mut self) {
        if let Some(ref mut session) = self.server_session {
            session.update_last_use();
        }
    }

    /// The current transaction number without incrementing it. Used when retrying an
    /// operation, so the server can recognize the duplicate.
    pub(crate) fn txn_number(&self) -> i64 {
        self.server_session
            .as_ref()
            .map(|session| session.txn_number)
            .unwrap_or(0)
    }

    /// Increments and returns the transaction number, starting a new retryable-write or
    /// transaction scope.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        match self.server_session {
            Some(ref mut session) => {
                session.txn_number += 1;
                session.txn_number
            }
            None => 0,
        }
    }

    pub(crate) fn pin_to_address(&mut self, address: ServerAddress) {
        self.transaction.pinned_address = Some(address);
    }

    pub(crate) fn unpin(&mut self) {
        self.transaction.pinned_address = None;
    }

    pub(crate) fn pinned_address(&self) -> Option<&ServerAddress> {
        self.transaction.pinned_address.as_ref()
    }

    /// Starts a new transaction on this session with the given options. If no options are
    /// provided, the session's `default_transaction_options` will be used. This session
    /// must be passed into each operation within the transaction; otherwise, the operation
    /// will be executed outside of the transaction.
    ///
    /// Errors returned from operations executed within a transaction may include a
    /// [`crate::error::TRANSIENT_TRANSACTION_ERROR`] label, indicating that the entire
    /// transaction can be retried with a reasonable expectation that it will succeed.
    pub async fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        if matches!(
            self.client.transaction_support_status().await?,
            crate::sdam::TransactionSupportStatus::Unsupported
        ) {
            return Err(ErrorKind::Transaction {
                message: "the connected deployment does not support transactions".to_string(),
            }
            .into());
        }

        match self.transaction.state {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".to_string(),
                }
                .into());
            }
            TransactionState::Committed { .. } | TransactionState::Aborted => {
                self.transaction.reset();
            }
            TransactionState::None => {}
        }

        let mut options = options.into().or_else(|| {
            self.options
                .as_ref()
                .and_then(|o| o.default_transaction_options.clone())
        });
        resolve_transaction_options(&mut options, &self.client);

        if let Some(ref write_concern) = options.as_ref().and_then(|o| o.write_concern.as_ref()) {
            if !write_concern.is_acknowledged() {
                return Err(Error::invalid_argument(
                    "transactions do not support unacknowledged write concerns",
                ));
            }
        }

        self.get_and_increment_txn_number();
        self.transaction.start(options);
        Ok(())
    }

    /// Commits the transaction that is currently active on this session.
    ///
    /// This method may return an error with a
    /// [`crate::error::UNKNOWN_TRANSACTION_COMMIT_RESULT`] label, indicating that it is
    /// unknown whether the commit has satisfied its write concern. Retrying the commit is
    /// safe in that case.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "Cannot call commitTransaction after calling abortTransaction".to_string(),
            }
            .into()),
            TransactionState::Starting | TransactionState::Committed {
                data_committed: false,
            } => {
                // No operation ran inside the transaction, so there is nothing to commit.
                self.transaction.commit(false);
                Ok(())
            }
            TransactionState::InProgress
            | TransactionState::Committed {
                data_committed: true,
            } => {
                let options = self.transaction.options.clone();
                let commit = CommitTransaction::new(options);
                self.transaction.commit(true);
                let client = self.client.clone();
                client.execute_operation(commit, Some(self)).await
            }
        }
    }

    /// Aborts the transaction that is currently active on this session. Any data written
    /// by the transaction will be rolled back.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Committed { .. } => Err(ErrorKind::Transaction {
                message: "Cannot call abortTransaction after calling commitTransaction".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction twice".to_string(),
            }
            .into()),
            TransactionState::Starting => {
                self.transaction.abort();
                Ok(())
            }
            TransactionState::InProgress => {
                let write_concern = self
                    .transaction
                    .options
                    .as_ref()
                    .and_then(|options| options.write_concern.clone());
                let abort = AbortTransaction::new(write_concern);
                self.transaction.abort();
                let client = self.client.clone();
                // The transaction is over client-side regardless of whether the server
                // heard about the abort.
                let _ = client.execute_operation(abort, Some(self)).await;
                Ok(())
            }
        }
    }

    /// Starts a transaction, runs the given callback with this session, and commits or
    /// aborts the transaction based on the outcome. Transient failures are retried for up
    /// to two minutes before the latest error is surfaced.
    pub async fn with_transaction<R, F>(
        &mut self,
        mut callback: F,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<R>
    where
        F: for<'a> FnMut(&'a mut ClientSession) -> BoxFuture<'a, Result<R>>,
    {
        let options = options.into();
        let start = Instant::now();

        'transaction: loop {
            self.start_transaction(options.clone()).await?;
            let result = callback(self).await;

            let callback_value = match result {
                Ok(value) => value,
                Err(error) => {
                    if self.in_transaction() {
                        self.abort_transaction().await?;
                    }
                    if error.contains_label(TRANSIENT_TRANSACTION_ERROR)
                        && start.elapsed() < MAX_WITH_TRANSACTION_TIMEOUT
                    {
                        continue 'transaction;
                    }
                    return Err(error);
                }
            };

            'commit: loop {
                match self.commit_transaction().await {
                    Ok(()) => return Ok(callback_value),
                    Err(error) => {
                        if error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                            && start.elapsed() < MAX_WITH_TRANSACTION_TIMEOUT
                        {
                            continue 'commit;
                        }
                        if error.contains_label(TRANSIENT_TRANSACTION_ERROR)
                            && start.elapsed() < MAX_WITH_TRANSACTION_TIMEOUT
                        {
                            continue 'transaction;
                        }
                        return Err(error);
                    }
                }
            }
        }
    }
}

fn resolve_transaction_options(options: &mut Option<TransactionOptions>, client: &Client) {
    let inherit_read_concern = client.read_concern().cloned();
    let inherit_write_concern = client.write_concern().cloned();
    if inherit_read_concern.is_none() && inherit_write_concern.is_none() {
        return;
    }
    let options = options.get_or_insert_with(Default::default);
    if options.read_concern.is_none() {
        options.read_concern = inherit_read_concern;
    }
    if options.write_concern.is_none() {
        options.write_concern = inherit_write_concern;
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(server_session) = self.server_session.take() {
            let client = self.client.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    client.check_in_server_session(server_session).await;
                });
            }
        }
    }
}
