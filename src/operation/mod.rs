mod abort_transaction;
pub(crate) mod aggregate;
pub(crate) mod bulk_write;
mod commit_transaction;
mod delete;
mod find;
mod get_more;
mod insert;
mod kill_cursors;
pub(crate) mod run_command;
mod update;

use std::collections::VecDeque;

use bson::{Bson, Document, RawDocumentBuf};
use serde::Deserialize;

use crate::{
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{
        BulkWriteFailure, Error, ErrorKind, IndexedWriteError, Result, WriteConcernError,
    },
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
    Namespace,
};

pub(crate) use abort_transaction::AbortTransaction;
pub(crate) use aggregate::{Aggregate, AggregateTarget};
pub(crate) use bulk_write::BulkWriteOperation;
pub(crate) use commit_transaction::CommitTransaction;
pub(crate) use delete::Delete;
pub(crate) use find::Find;
pub(crate) use get_more::{GetMore, GetMoreResult};
pub(crate) use insert::Insert;
pub(crate) use kill_cursors::KillCursors;
pub(crate) use run_command::RunCommand;
pub(crate) use update::{Update, UpdateOrReplace};

pub(crate) const SERVER_4_2_0_WIRE_VERSION: i32 = 8;
pub(crate) const SERVER_8_0_0_WIRE_VERSION: i32 = 25;

/// The number of overhead bytes to account for when building a message with a document
/// sequence, covering the OP_MSG header, flags, section headers, and the command body
/// fields appended after batch splitting (lsid, txnNumber, $clusterTime, $db).
pub(crate) const OP_MSG_OVERHEAD_BYTES: usize = 1_000;

/// A trait modeling the behavior of a server-side operation.
///
/// The executor drives every user-visible operation through this trait: `build` produces
/// the command for a selected server, `handle_response` interprets the reply, and the
/// remaining methods describe how the operation participates in sessions and retries.
pub(crate) trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the server-side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store some additional state that is required for handling the
    /// response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Interpret an error encountered while sending the built command to the server,
    /// potentially recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether or not this operation will request acknowledgment from the server.
    fn is_acknowledged(&self) -> bool {
        self.write_concern()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true)
    }

    /// The write concern to use for this operation, if any.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    /// The server this operation must execute on, if it is pinned (cursors and sharded
    /// transactions).
    fn pinned_address(&self) -> Option<&ServerAddress> {
        None
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}

// Allows executing through a mutable reference when the caller needs the operation's
// post-build state (e.g. the bulk write engine reading back n_attempted).
impl<T: Operation> Operation for &mut T {
    type O = T::O;

    const NAME: &'static str = T::NAME;

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        (**self).build(description)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        (**self).handle_response(response, description)
    }

    fn handle_error(&self, error: Error) -> Result<Self::O> {
        (**self).handle_error(error)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        (**self).selection_criteria()
    }

    fn is_acknowledged(&self) -> bool {
        (**self).is_acknowledged()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        (**self).write_concern()
    }

    fn supports_sessions(&self) -> bool {
        (**self).supports_sessions()
    }

    fn retryability(&self) -> Retryability {
        (**self).retryability()
    }

    fn update_for_retry(&mut self) {
        (**self).update_for_retry()
    }

    fn pinned_address(&self) -> Option<&ServerAddress> {
        (**self).pinned_address()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// The level of retry an operation supports.
#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

/// Appends a serializable struct to the input document. The serializable struct MUST
/// serialize to a document; otherwise an error is returned.
pub(crate) fn append_options<T: serde::Serialize>(
    doc: &mut Document,
    options: Option<&T>,
) -> Result<()> {
    if let Some(options) = options {
        let options_doc = bson::to_document(options)?;
        doc.extend(options_doc);
    }
    Ok(())
}

/// Removes an empty write concern from an options struct so it is not serialized as `{}`.
macro_rules! remove_empty_write_concern {
    ($opts:expr) => {
        if let Some(ref mut options) = $opts {
            if let Some(ref write_concern) = options.write_concern {
                if write_concern.is_empty() {
                    options.write_concern = None;
                }
            }
        }
    };
}
pub(crate) use remove_empty_write_concern;

/// Body of a write response that could possibly have a write concern error but not write
/// errors.
#[derive(Debug, Deserialize, Default, Clone)]
pub(crate) struct WriteConcernOnlyBody {
    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

impl WriteConcernOnlyBody {
    pub(crate) fn validate(&self) -> Result<()> {
        match self.write_concern_error {
            Some(ref wc_error) => Err(Error::new(
                ErrorKind::Write(crate::error::WriteFailure::WriteConcernError(
                    wc_error.clone(),
                )),
                self.labels.clone(),
            )),
            None => Ok(()),
        }
    }
}

/// Body of a response to a write command: the affected-document count plus any write or
/// write concern errors.
#[derive(Debug, Deserialize)]
pub(crate) struct WriteResponseBody<T = EmptyBody> {
    #[serde(flatten)]
    pub(crate) body: T,

    #[serde(default)]
    pub(crate) n: u64,

    #[serde(rename = "nModified", default)]
    pub(crate) n_modified: u64,

    #[serde(rename = "writeErrors")]
    pub(crate) write_errors: Option<Vec<IndexedWriteError>>,

    #[serde(rename = "writeConcernError")]
    pub(crate) write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    pub(crate) labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmptyBody {}

impl<T> WriteResponseBody<T> {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.write_errors.is_none() && self.write_concern_error.is_none() {
            return Ok(());
        }

        let failure = BulkWriteFailure {
            write_errors: self.write_errors.clone(),
            write_concern_error: self.write_concern_error.clone(),
            inserted_ids: Default::default(),
        };

        Err(Error::new(
            ErrorKind::BulkWrite(failure),
            self.labels.clone(),
        ))
    }
}

/// The cursor sub-document of a reply that opens a cursor.
#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    pub(crate) ns: Namespace,

    #[serde(alias = "nextBatch")]
    pub(crate) first_batch: VecDeque<RawDocumentBuf>,

    pub(crate) post_batch_resume_token: Option<RawDocumentBuf>,
}

/// Enforces the server's document size limit on a single command document.
pub(crate) fn verify_max_bson_size(
    document: &Document,
    max_bson_object_size: i64,
) -> Result<usize> {
    let size = bson_util::doc_size_bytes(document)?;
    if size as i64 > max_bson_object_size {
        return Err(Error::invalid_argument(format!(
            "document size {} exceeds maximum BSON object size {}",
            size, max_bson_object_size
        )));
    }
    Ok(size)
}

/// The `_id` of a document, generating and prepending a fresh `ObjectId` when absent.
///
/// The generated id is prepended rather than appended so the server stores it first, and
/// the caller can report it without re-reading the document.
pub(crate) fn get_or_prepend_id_field(doc: &mut Document) -> Result<Bson> {
    match doc.get("_id") {
        Some(id) => Ok(id.clone()),
        None => {
            let id = Bson::ObjectId(bson::oid::ObjectId::new());
            let mut new_doc = Document::new();
            new_doc.insert("_id", id.clone());
            new_doc.extend(std::mem::take(doc));
            *doc = new_doc;
            Ok(id)
        }
    }
}
