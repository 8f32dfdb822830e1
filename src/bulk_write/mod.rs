//! The client-level bulk write API: heterogeneous batches of writes across any number of
//! namespaces, executed with as few `bulkWrite` commands as the server's batch limits
//! allow.

mod models;

#[cfg(test)]
mod test;

use std::collections::HashMap;

use bson::{Bson, Document};
use serde::Serialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

pub use models::{
    DeleteManyModel, DeleteOneModel, InsertOneModel, ReplaceOneModel, UpdateManyModel,
    UpdateOneModel, WriteModel,
};
pub(crate) use models::OperationType;

use crate::{
    client::session::ClientSession,
    concern::WriteConcern,
    error::{CommandError, Error, ErrorKind, Result, WriteError},
    operation::{
        bulk_write::{BulkWriteBatchOutcome, SingleOperationResponse},
        BulkWriteOperation, GetMore,
    },
    options::ServerAddress,
    results::{
        BulkDeleteResult, BulkInsertResult, BulkUpdateResult, BulkWriteConcernError,
    },
    sdam::SessionSupportStatus,
    Client,
};

/// Options for a client-level bulk write.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct BulkWriteOptions {
    /// Whether the writes run in order and stop at the first failure. Defaults to true.
    #[serde(skip)]
    pub ordered: Option<bool>,

    /// Whether per-operation results are returned in addition to the summary counts.
    #[serde(skip)]
    pub verbose_results: Option<bool>,

    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// Map of parameter names and values that can be accessed in the command via `$$var`.
    #[serde(rename = "let")]
    pub let_vars: Option<Document>,

    /// Tags the operation with an arbitrary [`Bson`] value.
    pub comment: Option<Bson>,

    /// The write concern for the whole bulk write.
    pub write_concern: Option<WriteConcern>,

    /// The server to pin the bulk write to, overriding selection.
    #[serde(skip)]
    pub(crate) server_address: Option<ServerAddress>,
}

/// The result of a client-level bulk write.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct BulkWriteResult {
    /// Whether the write concern requested acknowledgment. When false, all counts are zero
    /// and no verbose results are recorded.
    pub acknowledged: bool,

    /// The number of documents inserted.
    pub inserted_count: i64,

    /// The number of documents matched by update filters.
    pub matched_count: i64,

    /// The number of documents modified.
    pub modified_count: i64,

    /// The number of documents upserted.
    pub upserted_count: i64,

    /// The number of documents deleted.
    pub deleted_count: i64,

    /// Per-insert results keyed by original model index. Populated only in verbose mode.
    pub insert_results: Option<HashMap<usize, BulkInsertResult>>,

    /// Per-update results keyed by original model index. Populated only in verbose mode.
    pub update_results: Option<HashMap<usize, BulkUpdateResult>>,

    /// Per-delete results keyed by original model index. Populated only in verbose mode.
    pub delete_results: Option<HashMap<usize, BulkDeleteResult>>,
}

impl BulkWriteResult {
    fn new(verbose: bool) -> Self {
        Self {
            acknowledged: true,
            insert_results: verbose.then(HashMap::new),
            update_results: verbose.then(HashMap::new),
            delete_results: verbose.then(HashMap::new),
            ..Default::default()
        }
    }

    fn absorb_summary(&mut self, summary: &crate::results::BulkWriteSummary) {
        self.inserted_count += summary.n_inserted;
        self.matched_count += summary.n_matched;
        self.modified_count += summary.n_modified;
        self.upserted_count += summary.n_upserted;
        self.deleted_count += summary.n_deleted;
    }
}

/// The errors observed during a client-level bulk write, delivered together with any
/// partial result via [`ErrorKind::ClientBulkWrite`].
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct BulkWriteException {
    /// The top-level error that interrupted the bulk write, if any. The raw server reply,
    /// when one exists, is preserved on the wrapping [`Error`](crate::error::Error).
    pub top_level_error: Option<CommandError>,

    /// Write concern errors, in the order the server reported them.
    pub write_concern_errors: Vec<BulkWriteConcernError>,

    /// Per-operation write errors, keyed by original model index.
    pub write_errors: HashMap<usize, WriteError>,

    /// The outcome of the writes that did succeed, when at least one did.
    pub partial_result: Option<BulkWriteResult>,
}

impl BulkWriteException {
    /// Whether any error was observed during execution.
    pub fn has_errors(&self) -> bool {
        self.top_level_error.is_some()
            || !self.write_concern_errors.is_empty()
            || !self.write_errors.is_empty()
    }
}

/// A client-level bulk write in its append phase.
///
/// Models accumulate in order via [`BulkWrite::append`]; [`BulkWrite::execute`] partitions
/// them into as few `bulkWrite` commands as the server's limits allow and maps every
/// per-operation outcome back to the index the model was appended at. A bulk write
/// executes at most once; appends after execution are rejected.
///
/// ```no_run
/// # use mongodb_core::{bson::doc, bulk_write::{InsertOneModel, WriteModel}, Client, Namespace, error::Result};
/// # async fn run(client: Client) -> Result<()> {
/// let mut bulk = client.bulk_write();
/// bulk.append(WriteModel::InsertOne(
///     InsertOneModel::builder()
///         .namespace(Namespace::new("db", "coll"))
///         .document(doc! { "a": 1 })
///         .build(),
/// ))?;
/// let result = bulk.execute(None).await?;
/// assert_eq!(result.inserted_count, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BulkWrite {
    client: Client,
    models: Vec<WriteModel>,
    has_multi_write: bool,
    executed: bool,
}

impl BulkWrite {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            models: Vec::new(),
            has_multi_write: false,
            executed: false,
        }
    }

    /// The number of models appended so far.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether no models have been appended yet.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Appends a write to the buffer. The model's documents are validated here so
    /// malformed writes fail before execution begins.
    pub fn append(&mut self, model: WriteModel) -> Result<()> {
        if self.executed {
            return Err(Error::invalid_argument("bulk write already executed"));
        }
        model.validate()?;

        if model.multi() {
            self.has_multi_write = true;
        }

        self.models.push(model);
        Ok(())
    }

    /// Executes the buffered writes, consuming this bulk write's one execution.
    ///
    /// On any failure the error carries a [`BulkWriteException`] pairing whatever partial
    /// result accumulated with the per-index errors that were observed.
    pub async fn execute(
        &mut self,
        options: impl Into<Option<BulkWriteOptions>>,
    ) -> Result<BulkWriteResult> {
        self.execute_with_session(options, None).await
    }

    /// Executes the buffered writes under an explicit session.
    pub async fn execute_with_session(
        &mut self,
        options: impl Into<Option<BulkWriteOptions>>,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<BulkWriteResult> {
        if self.executed {
            return Err(Error::invalid_argument("bulk write already executed"));
        }
        self.executed = true;

        if self.models.is_empty() {
            return Err(Error::invalid_argument(
                "cannot execute a bulk write with no operations",
            ));
        }

        let options = options.into().unwrap_or_default();
        let mut session = session.into();

        if let Some(ref session) = session {
            if session.in_transaction() && options.write_concern.is_some() {
                return Err(Error::invalid_argument(
                    "cannot set a write concern on an operation inside a transaction",
                ));
            }
        }

        let acknowledged = options
            .write_concern
            .as_ref()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true);
        let verbose = options.verbose_results.unwrap_or(false) && acknowledged;
        let ordered = options.ordered.unwrap_or(true);

        // Every batch of one bulk write runs under a single logical session, so the server
        // sees the batches as one operation.
        let mut implicit_session = None;
        if session.is_none() && acknowledged {
            if let SessionSupportStatus::Supported {
                logical_session_timeout,
            } = self.client.get_session_support_status().await?
            {
                implicit_session = Some(
                    self.client
                        .start_session_with_timeout(logical_session_timeout, None, true)
                        .await,
                );
                session = implicit_session.as_mut();
            }
        }

        let mut result = BulkWriteResult::new(verbose);
        let mut exception = BulkWriteException::default();

        let mut offset = 0;
        while offset < self.models.len() {
            let mut operation = BulkWriteOperation::new(
                &self.models[offset..],
                offset,
                &options,
                self.has_multi_write,
            );
            let outcome = self
                .client
                .execute_operation(&mut operation, session.as_deref_mut())
                .await;

            let n_attempted = operation.n_attempted.max(1);
            let inserted_ids = std::mem::take(&mut operation.inserted_ids);
            drop(operation);

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(error) => {
                    record_top_level_error(&mut exception, &error);
                    return finish(result, exception, acknowledged, Some(error));
                }
            };

            result.absorb_summary(&outcome.summary);
            if let Some(ref wc_error) = outcome.write_concern_error {
                exception.write_concern_errors.push(BulkWriteConcernError {
                    code: wc_error.code,
                    message: wc_error.message.clone(),
                    details: wc_error.details.clone(),
                });
            }

            let batch_had_write_errors = self
                .iterate_results_cursor(
                    outcome,
                    &inserted_ids,
                    offset,
                    verbose,
                    &mut result,
                    &mut exception,
                    session.as_deref_mut(),
                )
                .await?;

            if ordered && batch_had_write_errors {
                break;
            }

            offset += n_attempted;
        }

        finish(result, exception, acknowledged, None)
    }

    /// Drains the per-op results cursor of one batch, translating batch-relative indexes
    /// to original model indexes. Returns whether any write errors were seen.
    #[allow(clippy::too_many_arguments)]
    async fn iterate_results_cursor(
        &self,
        outcome: BulkWriteBatchOutcome,
        inserted_ids: &HashMap<usize, Bson>,
        offset: usize,
        verbose: bool,
        result: &mut BulkWriteResult,
        exception: &mut BulkWriteException,
        mut session: Option<&mut ClientSession>,
    ) -> Result<bool> {
        let mut had_write_errors = false;

        let mut batch: Vec<bson::RawDocumentBuf> =
            outcome.cursor.info.first_batch.iter().cloned().collect();
        let mut cursor_id = outcome.cursor.id();
        let namespace = outcome.cursor.namespace().clone();
        let address = outcome.cursor.address.clone();

        loop {
            for doc in &batch {
                let response: SingleOperationResponse = bson::from_slice(doc.as_bytes())
                    .map_err(|e| Error::invalid_response(e.to_string()))?;
                self.handle_individual_response(
                    response,
                    inserted_ids,
                    offset,
                    verbose,
                    result,
                    exception,
                    &mut had_write_errors,
                )?;
            }

            if cursor_id == 0 {
                break;
            }

            let get_more = GetMore::new(
                namespace.clone(),
                cursor_id,
                address.clone(),
                None,
                None,
                None,
            );
            let get_more_result = self
                .client
                .execute_operation(get_more, session.as_deref_mut())
                .await?;
            batch = get_more_result.batch.into_iter().collect();
            cursor_id = get_more_result.id;
        }

        Ok(had_write_errors)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_individual_response(
        &self,
        response: SingleOperationResponse,
        inserted_ids: &HashMap<usize, Bson>,
        offset: usize,
        verbose: bool,
        result: &mut BulkWriteResult,
        exception: &mut BulkWriteException,
        had_write_errors: &mut bool,
    ) -> Result<()> {
        let index = response.idx + offset;

        if response.ok == 0.0 {
            *had_write_errors = true;
            exception.write_errors.insert(
                index,
                WriteError {
                    code: response.code.unwrap_or(0),
                    code_name: String::new(),
                    message: response.errmsg.unwrap_or_default(),
                    details: response.err_info,
                },
            );
            return Ok(());
        }

        if !verbose {
            return Ok(());
        }

        let model = self.models.get(index).ok_or_else(|| {
            Error::invalid_response(format!(
                "invalid operation index returned from bulkWrite: {}",
                index
            ))
        })?;

        match model.operation_type() {
            OperationType::Insert => {
                let inserted_id = inserted_ids.get(&index).ok_or_else(|| {
                    Error::invalid_response(format!(
                        "invalid index returned for insert operation: {}",
                        index
                    ))
                })?;
                if let Some(ref mut insert_results) = result.insert_results {
                    insert_results.insert(
                        index,
                        BulkInsertResult {
                            inserted_id: inserted_id.clone(),
                        },
                    );
                }
            }
            OperationType::Update => {
                if let Some(ref mut update_results) = result.update_results {
                    update_results.insert(
                        index,
                        BulkUpdateResult {
                            matched_count: response.n.unwrap_or(0),
                            modified_count: response.n_modified.unwrap_or(0),
                            upserted_id: response.upserted.map(|upserted| upserted.id),
                        },
                    );
                }
            }
            OperationType::Delete => {
                if let Some(ref mut delete_results) = result.delete_results {
                    delete_results.insert(
                        index,
                        BulkDeleteResult {
                            deleted_count: response.n.unwrap_or(0),
                        },
                    );
                }
            }
        }

        Ok(())
    }
}

fn record_top_level_error(exception: &mut BulkWriteException, error: &Error) {
    exception.top_level_error = Some(match error.kind.as_ref() {
        ErrorKind::Command(command_error) => command_error.clone(),
        _ => CommandError {
            code: 0,
            code_name: String::new(),
            message: error.to_string(),
        },
    });
}

/// Applies the end-of-run rules: unacknowledged writes drop the result, and an exception
/// with no recorded errors is dropped rather than surfaced.
fn finish(
    mut result: BulkWriteResult,
    mut exception: BulkWriteException,
    acknowledged: bool,
    source: Option<Error>,
) -> Result<BulkWriteResult> {
    if !acknowledged {
        result = BulkWriteResult {
            acknowledged: false,
            ..Default::default()
        };
    }

    if !exception.has_errors() {
        return match source {
            // A non-server error (e.g. network failure mid-run) still surfaces.
            Some(error) => Err(error),
            None => Ok(result),
        };
    }

    let any_success = result.inserted_count
        + result.matched_count
        + result.deleted_count
        + result.upserted_count
        > 0;
    if acknowledged && any_success {
        exception.partial_result = Some(result);
    }

    let labels: Vec<String> = source
        .as_ref()
        .map(|error| error.labels().iter().cloned().collect())
        .unwrap_or_default();
    let mut error = Error::new(ErrorKind::ClientBulkWrite(exception), Some(labels));
    if let Some(reply) = source.as_ref().and_then(|e| e.server_reply()) {
        error = error.with_server_reply(reply.clone());
    }
    Err(error)
}
