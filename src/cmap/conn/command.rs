use std::collections::HashSet;

use bson::{Bson, Document, RawDocumentBuf};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;

use super::wire::{DocumentSequence, Message};
use crate::{
    bson_util,
    client::session::{ClientSession, ClusterTime},
    concern::ReadConcern,
    error::{Error, Result},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

lazy_static! {
    /// Commands that carry credentials or handshake state. They are never compressed, and
    /// their bodies and replies are redacted from events and logs.
    static ref SENSITIVE_COMMANDS: HashSet<&'static str> = {
        [
            "hello",
            "ismaster",
            "authenticate",
            "saslstart",
            "saslcontinue",
            "getnonce",
        ]
        .into_iter()
        .collect()
    };
}

pub(crate) fn is_sensitive_command(name: &str) -> bool {
    SENSITIVE_COMMANDS.contains(name.to_lowercase().as_str())
}

/// Driver-side representation of a database command.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) document_sequences: Vec<DocumentSequence>,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(name: impl ToString, target_db: impl ToString, body: Document) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
            document_sequences: Vec::new(),
        }
    }

    /// Constructs a read command, applying the read concern to the body if one is given.
    pub(crate) fn new_read(
        name: impl ToString,
        target_db: impl ToString,
        read_concern: Option<ReadConcern>,
        body: Document,
    ) -> Result<Self> {
        let mut command = Self::new(name, target_db, body);
        if let Some(read_concern) = read_concern {
            command.set_read_concern(&read_concern)?;
        }
        Ok(command)
    }

    /// Attaches a kind-1 payload section to this command. `documents` are laid out
    /// back-to-back in the message rather than embedded in the body.
    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl ToString,
        documents: Vec<RawDocumentBuf>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.to_string(),
            documents,
        });
    }

    pub(crate) fn set_read_concern(&mut self, read_concern: &ReadConcern) -> Result<()> {
        self.body
            .insert("readConcern", bson::to_document(read_concern)?);
        Ok(())
    }

    pub(crate) fn set_session(&mut self, session: &ClientSession) {
        self.body.insert("lsid", session.id().clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if let Ok(doc) = bson::to_document(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    /// Sets the read concern to the level captured at transaction start, carrying the
    /// session's causal-consistency `afterClusterTime` if one is known.
    pub(crate) fn set_txn_read_concern(&mut self, session: &ClientSession) -> Result<()> {
        let mut read_concern = match session
            .transaction_options()
            .and_then(|options| options.read_concern.as_ref())
        {
            Some(rc) => bson::to_document(rc)?,
            None => Document::new(),
        };
        if session.causal_consistency() {
            if let Some(operation_time) = session.operation_time() {
                read_concern.insert("afterClusterTime", Bson::Timestamp(operation_time));
            }
        }
        if !read_concern.is_empty() {
            self.body.insert("readConcern", read_concern);
        }
        Ok(())
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: &ReadPreference) -> Result<()> {
        self.body
            .insert("$readPreference", read_preference.to_document()?);
        Ok(())
    }

    /// Whether this command's contents may appear in events and logs.
    pub(crate) fn should_redact(&self) -> bool {
        is_sensitive_command(&self.name)
    }

    /// Whether this command may be sent compressed. Handshake and authentication-related
    /// commands always go uncompressed.
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    pub(crate) fn should_compress(&self) -> bool {
        !is_sensitive_command(&self.name)
    }

    /// Converts this command to a wire message, appending `$db` to the body.
    pub(crate) fn into_message(mut self) -> Result<Message> {
        self.body.insert("$db", self.target_db.clone());
        let body = bson_util::to_raw_document_buf(&self.body)?;
        Ok(Message::with_sequences(body, self.document_sequences))
    }

    /// The number of bytes this command will occupy on the wire.
    pub(crate) fn encoded_size(&self) -> Result<usize> {
        // Clone so the real `$db` append still happens exactly once, in into_message.
        self.clone().into_message().map(|m| m.encoded_len())
    }
}

/// A response to a command, kept serialized until a typed body is requested.
#[derive(Clone, Debug)]
pub(crate) struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    raw: RawDocumentBuf,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, raw: RawDocumentBuf) -> Self {
        Self { source, raw }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    /// Deserializes the body of this response to a `T`.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_slice(self.raw.as_bytes()).map_err(|e| {
            Error::invalid_response(format!("failed to deserialize server response: {}", e))
        })
    }

    /// The response as an owned `Document`.
    pub(crate) fn to_document(&self) -> Result<Document> {
        self.raw
            .to_owned()
            .try_into()
            .map_err(|e: bson::raw::Error| Error::invalid_response(e.to_string()))
    }

    /// Whether this reply has `ok: 1`.
    pub(crate) fn is_success(&self) -> bool {
        match self.raw.get("ok") {
            Ok(Some(ok)) => {
                ok.as_i32() == Some(1)
                    || ok.as_i64() == Some(1)
                    || matches!(ok.as_f64(), Some(f) if (f - 1.0).abs() <= f64::EPSILON)
            }
            _ => false,
        }
    }

    /// The `$clusterTime` this reply gossiped, if any.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.raw
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| bson::from_slice(doc.as_bytes()).ok())
    }

    /// The `operationTime` this reply reported, if any.
    pub(crate) fn operation_time(&self) -> Option<bson::Timestamp> {
        match self.raw.get("operationTime") {
            Ok(Some(raw)) => raw.as_timestamp(),
            _ => None,
        }
    }

    /// The `recoveryToken` attached to this reply, used to commit or abort a sharded
    /// transaction after a failover.
    pub(crate) fn recovery_token(&self) -> Option<Document> {
        self.raw
            .get_document("recoveryToken")
            .ok()
            .and_then(|raw| raw.to_owned().try_into().ok())
    }

    /// Converts an `ok: 0` reply into a command error, preserving the reply document.
    pub(crate) fn command_error(&self) -> Result<Error> {
        let reply = self.to_document()?;
        Ok(crate::error::command_error_from_reply(&reply))
    }
}

