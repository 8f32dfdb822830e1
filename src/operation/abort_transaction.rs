use bson::doc;

use super::{Operation, Retryability, WriteConcernOnlyBody};
use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::Result,
};

/// An `abortTransaction` command. Sent best-effort; the transaction is over client-side
/// whether or not the server hears about it.
#[derive(Debug)]
pub(crate) struct AbortTransaction {
    write_concern: Option<WriteConcern>,
}

impl AbortTransaction {
    pub(crate) fn new(write_concern: Option<WriteConcern>) -> Self {
        Self { write_concern }
    }
}

impl Operation for AbortTransaction {
    type O = ();

    const NAME: &'static str = "abortTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
        };

        if let Some(ref write_concern) = self.write_concern() {
            if !write_concern.is_empty() {
                body.insert("writeConcern", write_concern.to_document()?);
            }
        }

        Ok(Command::new(Self::NAME, "admin", body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        if !response.is_success() {
            return Err(response.command_error()?);
        }
        let body: WriteConcernOnlyBody = response.body()?;
        body.validate()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
