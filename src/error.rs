//! Contains the `Error` and `Result` types that `mongodb-core` uses.

use std::{
    collections::HashSet,
    fmt::{self, Debug},
    sync::Arc,
};

use bson::Document;
use serde::Deserialize;
use thiserror::Error;

use crate::bson_util;

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOT_MASTER_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];
const RETRYABLE_READ_CODES: [i32; 12] =
    [11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 43];
const RETRYABLE_WRITE_CODES: [i32; 11] =
    [11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001];

/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// Transient transaction error label. This label will be added to a network error or server
/// selection error that occurs during a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Unknown transaction commit result label. This label will be added to a server selection error,
/// network error, write-retryable error, MaxTimeMSExpired error, or write concern
/// failed/timeout during a commitTransaction.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the driver itself, a MongoDB server, or a client-side
/// collaborator.
///
/// When the error originated on a server, the raw server reply is preserved and can be
/// inspected via [`Error::server_reply`].
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    server_reply: Option<Document>,
    pub(crate) wire_version: Option<i32>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        if let Some(wc) = kind.get_write_concern_error() {
            labels.extend(wc.labels.clone());
        }
        Self {
            kind: Box::new(kind),
            labels,
            server_reply: None,
            wire_version: None,
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn with_server_reply(mut self, reply: Document) -> Self {
        self.server_reply = Some(reply);
        self
    }

    /// The raw reply from the server this error originated from, if any.
    pub fn server_reply(&self) -> Option<&Document> {
        self.server_reply.as_ref()
    }

    /// The labels attached to this error by the server or the driver.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the given label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Adds the given label to this error.
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    /// The server-reported error code, if this is a command error.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            ErrorKind::ClientBulkWrite(ref exception) => exception
                .top_level_error
                .as_ref()
                .map(|command_error| command_error.code),
            _ => None,
        }
    }

    /// The server-reported error message, if any.
    pub fn message(&self) -> Option<&str> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.message.as_str()),
            _ => None,
        }
    }

    /// Whether this error is a network error (I/O failure or timeout on the stream).
    pub fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_non_timeout_network_error(&self) -> bool {
        self.is_network_error() && !self.is_network_timeout()
    }

    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    /// Whether an error originated on the server (command, write, or write concern error).
    pub(crate) fn is_server_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Command(_) | ErrorKind::Write(_) | ErrorKind::ClientBulkWrite(_)
        )
    }

    /// Whether a read operation should be retried after seeing this error.
    ///
    /// The retryable read set is the retryable write set plus `CursorNotFound` (43), plus any
    /// reply whose errmsg contains "not master". Network errors are always read-retryable.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => RETRYABLE_READ_CODES.contains(&code),
            None => match self.message() {
                Some(message) => {
                    message.contains("not master") || message.contains("node is recovering")
                }
                None => false,
            },
        }
    }

    /// Whether a write operation should be retried after seeing this error.
    ///
    /// On 4.4+ servers the `RetryableWriteError` label is authoritative; on older servers the
    /// driver classifies by error code.
    pub(crate) fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether the `RetryableWriteError` label should be added to this error. If max_wire_version
    /// indicates a 4.4+ server, a label should only be added if the error is a network error.
    /// Otherwise, a label should be added if the error is a network error or the error code
    /// matches one of the retryable write codes.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version > 8 {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    pub(crate) fn should_add_unknown_transaction_commit_result_label(&self) -> bool {
        if self.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            return false;
        }
        if self.is_network_error() || self.is_server_selection_error() || self.is_write_retryable()
        {
            return true;
        }
        match self.sdam_code() {
            Some(code) => code == 50 || code == 64 || code == 91,
            None => false,
        }
    }

    /// Whether a change stream should attempt a one-shot resume after this error.
    ///
    /// The resumable set matches the retryable-read set plus any network error, minus errors
    /// that indicate the stream itself is unrecoverable.
    pub(crate) fn is_resumable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        if matches!(self.kind.as_ref(), ErrorKind::MissingResumeToken) {
            return false;
        }
        self.is_read_retryable()
    }

    /// If this error corresponds to a "node is recovering" or "not master" error per the SDAM
    /// spec, returns the matching code.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        let code = match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)) => Some(wc_error.code),
            ErrorKind::BulkWrite(BulkWriteFailure {
                write_concern_error: Some(wc_error),
                ..
            }) => Some(wc_error.code),
            _ => None,
        };
        code.or_else(|| self.code())
    }

    /// Whether this error indicates a server state change that should mark the server Unknown.
    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        match self.sdam_code() {
            Some(code) => SHUTTING_DOWN_CODES.contains(&code),
            None => false,
        }
    }

    fn is_recovering(&self) -> bool {
        match self.sdam_code() {
            Some(code) => RECOVERING_CODES.contains(&code),
            None => match self.message() {
                Some(message) => message.contains("node is recovering"),
                None => false,
            },
        }
    }

    fn is_notwritableprimary(&self) -> bool {
        match self.sdam_code() {
            Some(code) => NOT_MASTER_CODES.contains(&code),
            None => match self.message() {
                Some(message) => message.contains("not master"),
                None => false,
            },
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into(), None::<Vec<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<bson::raw::Error> for ErrorKind {
    fn from(err: bson::raw::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An error occurred during a multi-document operation on a single collection.
    #[error("A bulk write failed: {0:?}")]
    BulkWrite(BulkWriteFailure),

    /// An error occurred during a client-level `bulkWrite` operation.
    #[error("A client bulk write failed: {0:?}")]
    ClientBulkWrite(crate::bulk_write::BulkWriteException),

    /// An error occurred when trying to execute a write operation.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    Write(WriteFailure),

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// A timeout or failure occurred while selecting a server for an operation.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// The topology is not compatible with this driver.
    #[error("{message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// The topology does not support sessions.
    #[error("Attempted to start a session against a topology that doesn't support sessions")]
    SessionsNotSupported,

    /// A transaction-related error.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },

    /// A change stream document was missing the `_id` resume token, so resumability cannot be
    /// guaranteed.
    #[error(
        "Cannot provide resume functionality when the resume token is missing; this is likely \
         caused by a pipeline stage that removes the _id field"
    )]
    MissingResumeToken,

    /// An internal error in the driver.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}

impl ErrorKind {
    fn get_write_concern_error(&self) -> Option<&WriteConcernError> {
        match self {
            ErrorKind::BulkWrite(BulkWriteFailure {
                write_concern_error,
                ..
            }) => write_concern_error.as_ref(),
            ErrorKind::Write(WriteFailure::WriteConcernError(wce)) => Some(wce),
            _ => None,
        }
    }
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize, Error)]
#[error("Error {code} ({code_name}): {message}")]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Deserialize, Error)]
#[error("Write concern error {code} ({code_name}): {message}")]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,

    /// Labels attached to this write concern error by the server.
    #[serde(rename = "errorLabels", default)]
    pub(crate) labels: Vec<String>,
}

/// An error that occurred during a write operation that wasn't due to being unable to satisfy a
/// write concern.
#[derive(Clone, Debug, Deserialize, Error)]
#[error("Write error {code}: {message}")]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document providing more information about the write error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

/// An individual write error that occurred during a multi-document write operation.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct IndexedWriteError {
    /// Index into the list of operations that this error corresponds to.
    #[serde(default)]
    pub index: usize,

    /// Identifies the type of write error.
    pub code: i32,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document providing more information about the write error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

/// The set of errors that occurred during a multi-document write operation on a single
/// collection.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct BulkWriteFailure {
    /// The error(s) that occurred on account of a non write concern failure.
    #[serde(rename = "writeErrors")]
    pub write_errors: Option<Vec<IndexedWriteError>>,

    /// The error that occurred on account of write concern failure.
    #[serde(rename = "writeConcernError")]
    pub write_concern_error: Option<WriteConcernError>,

    #[serde(skip)]
    pub(crate) inserted_ids: std::collections::HashMap<usize, bson::Bson>,
}

impl BulkWriteFailure {
    pub(crate) fn new() -> Self {
        BulkWriteFailure {
            write_errors: None,
            write_concern_error: None,
            inserted_ids: Default::default(),
        }
    }
}

/// An error that occurred when trying to execute a write operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteFailure {
    /// An error that occurred due to not being able to satisfy a write concern.
    WriteConcernError(WriteConcernError),

    /// An error that occurred during a write operation that wasn't due to being unable to satisfy
    /// a write concern.
    WriteError(WriteError),
}

impl WriteFailure {
    fn from_bulk_failure(bulk: BulkWriteFailure) -> Result<Self> {
        if let Some(bulk_write_error) = bulk.write_errors.and_then(|es| es.into_iter().next()) {
            let write_error = WriteError {
                code: bulk_write_error.code,
                code_name: String::new(),
                message: bulk_write_error.message,
                details: bulk_write_error.details,
            };
            Ok(WriteFailure::WriteError(write_error))
        } else if let Some(wc_error) = bulk.write_concern_error {
            Ok(WriteFailure::WriteConcernError(wc_error))
        } else {
            Err(Error::invalid_response(
                "server reported a write failure with no write errors",
            ))
        }
    }
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteConcernError(e) => fmt::Display::fmt(e, f),
            Self::WriteError(e) => fmt::Display::fmt(e, f),
        }
    }
}

/// Translates a bulk write failure for a single-document write into the equivalent
/// `WriteFailure`, preserving labels and the server reply.
pub(crate) fn convert_bulk_errors(error: Error) -> Error {
    match *error.kind {
        ErrorKind::BulkWrite(bulk_failure) => match WriteFailure::from_bulk_failure(bulk_failure) {
            Ok(failure) => {
                let mut new = Error::new(
                    ErrorKind::Write(failure),
                    Some(error.labels.iter().cloned()),
                );
                if let Some(reply) = error.server_reply {
                    new = new.with_server_reply(reply);
                }
                new
            }
            Err(e) => e,
        },
        _ => error,
    }
}

/// Extracts error labels from a raw server reply.
pub(crate) fn labels_from_reply(reply: &Document) -> Option<Vec<String>> {
    reply.get_array("errorLabels").ok().map(|labels| {
        labels
            .iter()
            .filter_map(|label| label.as_str().map(String::from))
            .collect()
    })
}

/// Builds a command `Error` from an `ok: 0` server reply, preserving the reply.
pub(crate) fn command_error_from_reply(reply: &Document) -> Error {
    let command_error = CommandError {
        code: reply
            .get("code")
            .and_then(bson_util::get_int)
            .unwrap_or(0) as i32,
        code_name: reply.get_str("codeName").unwrap_or_default().to_string(),
        message: reply.get_str("errmsg").unwrap_or_default().to_string(),
    };
    Error::new(ErrorKind::Command(command_error), labels_from_reply(reply))
        .with_server_reply(reply.clone())
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    fn command_error(code: i32, message: &str) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: message.to_string(),
        })
        .into()
    }

    fn network_error() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::UnexpectedEof.into())).into()
    }

    #[test]
    fn retryable_read_classification() {
        for code in RETRYABLE_READ_CODES {
            assert!(command_error(code, "").is_read_retryable(), "code {}", code);
        }
        assert!(command_error(0, "legacy not master error").is_read_retryable());
        assert!(!command_error(11000, "duplicate key").is_read_retryable());
        assert!(network_error().is_read_retryable());
    }

    #[test]
    fn cursor_not_found_is_read_but_not_write_retryable() {
        let err = command_error(43, "cursor not found");
        assert!(err.is_read_retryable());
        assert!(err.should_add_retryable_write_label(8) == false);
    }

    #[test]
    fn write_retryable_label_pre_and_post_4_4() {
        let mut err = command_error(10107, "not writable primary");
        // pre-4.4: classified by code.
        assert!(err.should_add_retryable_write_label(8));
        // 4.4+: only network errors get the label client-side.
        assert!(!err.should_add_retryable_write_label(9));
        assert!(network_error().should_add_retryable_write_label(9));

        assert!(!err.is_write_retryable());
        err.add_label(RETRYABLE_WRITE_ERROR);
        assert!(err.is_write_retryable());
    }

    #[test]
    fn state_change_classification() {
        assert!(command_error(10107, "").is_state_change_error());
        assert!(command_error(91, "").is_state_change_error());
        assert!(command_error(91, "").is_shutting_down());
        assert!(!command_error(189, "").is_shutting_down());
        assert!(!command_error(11000, "").is_state_change_error());
    }

    #[test]
    fn server_reply_preserved_through_conversion() {
        let reply = doc! { "ok": 0, "code": 10107, "errmsg": "not master", "codeName": "NotWritablePrimary" };
        let err = command_error_from_reply(&reply);
        assert_eq!(err.code(), Some(10107));
        assert_eq!(err.server_reply(), Some(&reply));
        assert!(err.is_state_change_error());
    }

    #[test]
    fn error_labels_parsed_from_reply() {
        let reply = doc! {
            "ok": 0,
            "code": 112,
            "errmsg": "write conflict",
            "errorLabels": ["TransientTransactionError"],
        };
        let err = command_error_from_reply(&reply);
        assert!(err.contains_label(TRANSIENT_TRANSACTION_ERROR));
    }
}
