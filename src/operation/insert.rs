use std::collections::HashMap;

use bson::{doc, Bson, Document, RawDocumentBuf};

use super::{
    remove_empty_write_concern, verify_max_bson_size, Operation, Retryability, WriteResponseBody,
    OP_MSG_OVERHEAD_BYTES,
};
use crate::{
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{BulkWriteFailure, Error, ErrorKind, Result},
    options::InsertManyOptions,
    results::InsertManyResult,
    Namespace,
};

/// An `insert` command for one server round trip. Documents that do not fit within the
/// server's batch limits are left for the caller to submit in a subsequent operation.
#[derive(Debug)]
pub(crate) struct Insert {
    ns: Namespace,
    documents: Vec<Document>,
    inserted_ids: Vec<Bson>,
    options: Option<InsertManyOptions>,
}

impl Insert {
    pub(crate) fn new(
        ns: Namespace,
        documents: Vec<Document>,
        mut options: Option<InsertManyOptions>,
    ) -> Self {
        remove_empty_write_concern!(options);
        Self {
            ns,
            documents,
            options,
            inserted_ids: Vec::new(),
        }
    }

    fn is_ordered(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|options| options.ordered)
            .unwrap_or(true)
    }

    /// The number of documents that were sent to the server by the last `build`.
    pub(crate) fn n_attempted(&self) -> usize {
        self.inserted_ids.len()
    }
}

impl Operation for Insert {
    type O = InsertManyResult;

    const NAME: &'static str = "insert";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.inserted_ids.clear();

        let max_doc_size = description.max_bson_object_size;
        let max_message_size = description.max_message_size_bytes as usize;
        let max_operations = description.max_write_batch_size as usize;

        let mut body = doc! { Self::NAME: self.ns.coll.clone() };
        body.insert("ordered", self.is_ordered());
        super::append_options(&mut body, self.options.as_ref())?;

        let mut document_sequence: Vec<RawDocumentBuf> = Vec::new();
        let mut current_size = bson_util::doc_size_bytes(&body)? + OP_MSG_OVERHEAD_BYTES;

        let documents = &mut self.documents;
        let inserted_ids = &mut self.inserted_ids;
        for (i, document) in documents.iter_mut().enumerate() {
            let id = super::get_or_prepend_id_field(document)?;

            let doc_size = verify_max_bson_size(document, max_doc_size)?;
            if i != 0 && (current_size + doc_size > max_message_size || i >= max_operations) {
                break;
            }

            current_size += doc_size;
            inserted_ids.push(id);
            document_sequence.push(bson_util::to_raw_document_buf(document)?);
        }

        if document_sequence.is_empty() {
            return Err(Error::invalid_argument(
                "document exceeds maximum message size and cannot be inserted",
            ));
        }

        let mut command = Command::new(Self::NAME, self.ns.db.clone(), body);
        command.add_document_sequence("documents", document_sequence);
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        if !response.is_success() {
            return Err(response.command_error()?);
        }

        let body: WriteResponseBody = response.body()?;

        let mut map = HashMap::new();
        if self.is_ordered() {
            // Ordered inserts stop at the first write error, so only the documents up to
            // that index (or all of them) were inserted.
            let failed_index = body
                .write_errors
                .as_ref()
                .and_then(|errors| errors.first().map(|error| error.index))
                .unwrap_or(self.inserted_ids.len());
            for (i, id) in self.inserted_ids.iter().take(failed_index).enumerate() {
                map.insert(i, id.clone());
            }
        } else {
            let failed_indices: std::collections::HashSet<usize> = body
                .write_errors
                .iter()
                .flatten()
                .map(|error| error.index)
                .collect();
            for (i, id) in self.inserted_ids.iter().enumerate() {
                if !failed_indices.contains(&i) {
                    map.insert(i, id.clone());
                }
            }
        }

        if body.write_errors.is_some() || body.write_concern_error.is_some() {
            let failure = BulkWriteFailure {
                write_errors: body.write_errors.clone(),
                write_concern_error: body.write_concern_error.clone(),
                inserted_ids: map,
            };
            let mut error = Error::new(ErrorKind::BulkWrite(failure), body.labels.clone());
            if let Ok(reply) = response.to_document() {
                error = error.with_server_reply(reply);
            }
            return Err(error);
        }

        Ok(InsertManyResult { inserted_ids: map })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
