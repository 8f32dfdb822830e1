use bson::Document;

use super::Operation;
use crate::{
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    selection_criteria::SelectionCriteria,
};

/// An arbitrary command provided by the caller, run as-is against the selected server.
#[derive(Debug)]
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    pub(crate) fn new(
        db: String,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if bson_util::first_key(&command).is_none() {
            return Err(Error::invalid_argument(
                "an empty document cannot be run as a command",
            ));
        }
        Ok(Self {
            db,
            command,
            selection_criteria,
        })
    }

    fn command_name(&self) -> &str {
        bson_util::first_key(&self.command).unwrap_or("")
    }
}

impl Operation for RunCommand {
    type O = Document;

    const NAME: &'static str = "";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            self.command_name(),
            self.db.clone(),
            self.command.clone(),
        ))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        // ok: 0 replies have already been converted into command errors by the executor;
        // anything that reaches here is returned to the caller verbatim.
        response.to_document()
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn name(&self) -> &str {
        self.command_name()
    }
}
