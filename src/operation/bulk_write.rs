use std::collections::HashMap;

use bson::{doc, rawdoc, Bson, Document, RawDocumentBuf};
use serde::Deserialize;

use super::{
    append_options, CursorInfo, Operation, Retryability, WriteResponseBody,
    OP_MSG_OVERHEAD_BYTES, SERVER_8_0_0_WIRE_VERSION,
};
use crate::{
    bson_util,
    bulk_write::{BulkWriteOptions, WriteModel},
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    cursor::CursorSpecification,
    error::{Error, ErrorKind, Result},
    results::BulkWriteSummary,
};

/// One `bulkWrite` command round trip: as many of the remaining models as fit within the
/// server's batch limits, encoded into `nsInfo` and `ops` document sequences.
pub(crate) struct BulkWriteOperation<'a> {
    models: &'a [WriteModel],

    /// The index of `models[0]` within the original append order. Per-op results use
    /// batch-relative indexes; this offset translates them back.
    pub(crate) offset: usize,

    options: &'a BulkWriteOptions,

    /// Whether the bulk write as a whole contains any multi-document writes, which
    /// disqualifies every batch from retry.
    has_multi_write: bool,

    /// The `_id` values of inserted documents, keyed by original model index. Populated
    /// during `build`.
    pub(crate) inserted_ids: HashMap<usize, Bson>,

    /// The number of models encoded by the last `build`.
    pub(crate) n_attempted: usize,
}

impl<'a> BulkWriteOperation<'a> {
    pub(crate) fn new(
        models: &'a [WriteModel],
        offset: usize,
        options: &'a BulkWriteOptions,
        has_multi_write: bool,
    ) -> Self {
        Self {
            models,
            offset,
            options,
            has_multi_write,
            inserted_ids: HashMap::new(),
            n_attempted: 0,
        }
    }

    fn ordered(&self) -> bool {
        self.options.ordered.unwrap_or(true)
    }
}

/// Tracks the namespaces referenced by the ops of one batch, in first-seen order, along
/// with the bytes each new entry adds to the `nsInfo` sequence.
struct NamespaceInfo {
    namespaces: Vec<RawDocumentBuf>,
    cache: HashMap<String, usize>,
}

impl NamespaceInfo {
    fn new() -> Self {
        Self {
            namespaces: Vec::new(),
            cache: HashMap::new(),
        }
    }

    /// The index for the given namespace and the number of bytes appending it would add;
    /// zero when the namespace is already present.
    fn index_and_size(&self, namespace: &str) -> (usize, usize) {
        match self.cache.get(namespace) {
            Some(index) => (*index, 0),
            None => {
                let doc = rawdoc! { "ns": namespace };
                (self.cache.len(), doc.as_bytes().len())
            }
        }
    }

    fn commit(&mut self, namespace: &str) -> Result<()> {
        if !self.cache.contains_key(namespace) {
            if self.cache.len() >= i32::MAX as usize {
                return Err(Error::invalid_argument(
                    "too many distinct namespaces in one bulk write batch",
                ));
            }
            self.cache.insert(namespace.to_string(), self.cache.len());
            self.namespaces
                .push(bson_util::to_raw_document_buf(&doc! { "ns": namespace })?);
        }
        Ok(())
    }
}

impl Operation for BulkWriteOperation<'_> {
    type O = BulkWriteBatchOutcome;

    const NAME: &'static str = "bulkWrite";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        if description.max_wire_version.unwrap_or(0) < SERVER_8_0_0_WIRE_VERSION {
            return Err(ErrorKind::IncompatibleServer {
                message: "the client bulkWrite feature is only supported on MongoDB 8.0+"
                    .to_string(),
            }
            .into());
        }

        self.inserted_ids.clear();
        self.n_attempted = 0;

        let max_operations = description.max_write_batch_size as usize;
        let max_bson_object_size = description.max_bson_object_size as usize;
        let max_message_size = description.max_message_size_bytes as usize;

        let mut body = doc! {
            Self::NAME: 1,
            "errorsOnly": !self.options.verbose_results.unwrap_or(false),
            "ordered": self.ordered(),
        };
        append_options(&mut body, Some(self.options))?;

        let body_size = bson_util::doc_size_bytes(&body)?;
        let max_size = max_message_size
            .saturating_sub(OP_MSG_OVERHEAD_BYTES)
            .saturating_sub(body_size);

        let mut namespace_info = NamespaceInfo::new();
        let mut ops: Vec<RawDocumentBuf> = Vec::new();
        let mut current_size = 0usize;

        for (i, model) in self.models.iter().take(max_operations).enumerate() {
            let namespace = model.namespace().to_string();
            let (namespace_index, namespace_size) = namespace_info.index_and_size(&namespace);

            let (op_document, inserted_id) = model.get_ops_document(namespace_index)?;
            let op_raw = bson_util::to_raw_document_buf(&op_document)?;
            let op_size = op_raw.as_bytes().len();

            if op_size > max_bson_object_size {
                return Err(Error::invalid_argument(format!(
                    "bulk write operation at index {} exceeds the maximum BSON object size",
                    self.offset + i
                )));
            }

            // The op only fits if it and any nsInfo entry it introduces both fit.
            if current_size + op_size + namespace_size > max_size {
                if i == 0 {
                    return Err(Error::invalid_argument(format!(
                        "bulk write operation at index {} is too large to fit in a single \
                         message",
                        self.offset
                    )));
                }
                break;
            }

            current_size += op_size + namespace_size;
            namespace_info.commit(&namespace)?;
            if let Some(inserted_id) = inserted_id {
                self.inserted_ids.insert(self.offset + i, inserted_id);
            }
            ops.push(op_raw);
            self.n_attempted += 1;
        }

        let mut command = Command::new(Self::NAME, "admin", body);
        command.add_document_sequence("nsInfo", namespace_info.namespaces);
        command.add_document_sequence("ops", ops);
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        if !response.is_success() {
            return Err(response.command_error()?);
        }

        let body: WriteResponseBody<BulkWriteResponseBody> = response.body()?;

        Ok(BulkWriteBatchOutcome {
            summary: body.body.summary,
            write_concern_error: body.write_concern_error,
            cursor: CursorSpecification::new(
                body.body.cursor,
                description.server_address.clone(),
                None,
                None,
                self.options.comment.clone(),
            ),
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        if self.has_multi_write {
            Retryability::None
        } else {
            Retryability::Write
        }
    }

    fn pinned_address(&self) -> Option<&crate::options::ServerAddress> {
        self.options.server_address.as_ref()
    }
}

#[derive(Debug, Deserialize)]
struct BulkWriteResponseBody {
    #[serde(flatten)]
    summary: BulkWriteSummary,

    cursor: CursorInfo,
}

/// Everything the engine needs from one bulkWrite reply: the summary counts, any write
/// concern error, and the cursor of per-op results.
#[derive(Debug)]
pub(crate) struct BulkWriteBatchOutcome {
    pub(crate) summary: BulkWriteSummary,
    pub(crate) write_concern_error: Option<crate::error::WriteConcernError>,
    pub(crate) cursor: CursorSpecification,
}

/// A single per-operation result document from a bulkWrite results cursor.
#[derive(Debug, Deserialize)]
pub(crate) struct SingleOperationResponse {
    /// The batch-relative index of the operation this document describes.
    pub(crate) idx: usize,

    pub(crate) ok: f64,

    #[serde(default)]
    pub(crate) code: Option<i32>,

    #[serde(default, rename = "errmsg")]
    pub(crate) errmsg: Option<String>,

    #[serde(default, rename = "errInfo")]
    pub(crate) err_info: Option<Document>,

    #[serde(default)]
    pub(crate) n: Option<i64>,

    #[serde(default, rename = "nModified")]
    pub(crate) n_modified: Option<i64>,

    #[serde(default)]
    pub(crate) upserted: Option<UpsertedId>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpsertedId {
    #[serde(rename = "_id")]
    pub(crate) id: Bson,
}
