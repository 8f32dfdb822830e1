use bson::{doc, Document};

use super::{remove_empty_write_concern, Operation, Retryability, WriteResponseBody};
use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{convert_bulk_errors, Result},
    options::DeleteOptions,
    results::DeleteResult,
    Namespace,
};

/// A `delete` command removing either one or all matching documents.
#[derive(Debug)]
pub(crate) struct Delete {
    ns: Namespace,
    filter: Document,
    limit: u32,
    options: Option<DeleteOptions>,
}

impl Delete {
    pub(crate) fn new(
        ns: Namespace,
        filter: Document,
        limit: Option<u32>,
        mut options: Option<DeleteOptions>,
    ) -> Self {
        remove_empty_write_concern!(options);
        Self {
            ns,
            filter,
            // 0 = delete all matching documents, 1 = delete one.
            limit: limit.unwrap_or(0),
            options,
        }
    }
}

impl Operation for Delete {
    type O = DeleteResult;

    const NAME: &'static str = "delete";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut delete = doc! {
            "q": self.filter.clone(),
            "limit": self.limit,
        };

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "ordered": true,
        };

        if let Some(ref options) = self.options {
            if let Some(ref collation) = options.collation {
                delete.insert("collation", collation.clone());
            }
            if let Some(ref hint) = options.hint {
                delete.insert("hint", hint.clone());
            }
            if let Some(ref write_concern) = options.write_concern {
                if !write_concern.is_empty() {
                    body.insert("writeConcern", write_concern.to_document()?);
                }
            }
            if let Some(ref let_vars) = options.let_vars {
                body.insert("let", let_vars.clone());
            }
            if let Some(ref comment) = options.comment {
                body.insert("comment", comment.clone());
            }
        }

        body.insert("deletes", vec![delete]);

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
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
        body.validate().map_err(convert_bulk_errors)?;

        Ok(DeleteResult {
            deleted_count: body.n,
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        if self.limit == 1 {
            Retryability::Write
        } else {
            Retryability::None
        }
    }
}
