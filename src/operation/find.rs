use bson::{doc, Document};

use super::{append_options, CursorBody, Operation, Retryability};
use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::{Error, Result},
    options::{CursorType, FindOptions},
    selection_criteria::SelectionCriteria,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: Option<FindOptions>,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Document, options: Option<FindOptions>) -> Self {
        Self {
            ns,
            filter,
            options,
        }
    }
}

impl Operation for Find {
    type O = CursorSpecification;

    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };

        if let Some(ref options) = self.options {
            match options.cursor_type {
                Some(CursorType::Tailable) => {
                    body.insert("tailable", true);
                }
                Some(CursorType::TailableAwait) => {
                    body.insert("tailable", true);
                    body.insert("awaitData", true);
                }
                _ => {}
            }

            if let Some(limit) = options.limit {
                // A negative limit requests a single batch, closing the cursor afterwards.
                body.insert("singleBatch", limit < 0);
                body.insert("limit", limit.abs());
            }

            if let Some(batch_size) = options.batch_size {
                if batch_size > i32::MAX as u32 {
                    return Err(Error::invalid_argument(
                        "batch size must fit in a signed 32-bit integer",
                    ));
                }
                body.insert("batchSize", batch_size as i32);
            }

            append_options(&mut body, Some(options))?;
        }

        body.insert("filter", self.filter.clone());

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        if !response.is_success() {
            return Err(response.command_error()?);
        }

        let body: CursorBody = response.body()?;

        let max_await_time = self.options.as_ref().and_then(|options| {
            if options.cursor_type == Some(CursorType::TailableAwait) {
                options.max_await_time
            } else {
                None
            }
        });

        Ok(CursorSpecification::new(
            body.cursor,
            description.server_address.clone(),
            self.options.as_ref().and_then(|options| options.batch_size),
            max_await_time,
            self.options
                .as_ref()
                .and_then(|options| options.comment.clone()),
        ))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|options| options.selection_criteria.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
