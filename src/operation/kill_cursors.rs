use bson::doc;

use super::Operation;
use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    options::ServerAddress,
    Namespace,
};

/// A `killCursors` command closing one server-side cursor. Sent best-effort when a cursor
/// is dropped before exhaustion; its result is ignored.
#[derive(Debug)]
pub(crate) struct KillCursors {
    ns: Namespace,
    cursor_id: i64,
    address: ServerAddress,
}

impl KillCursors {
    pub(crate) fn new(ns: Namespace, cursor_id: i64, address: ServerAddress) -> Self {
        Self {
            ns,
            cursor_id,
            address,
        }
    }
}

impl Operation for KillCursors {
    type O = ();

    const NAME: &'static str = "killCursors";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "cursors": [self.cursor_id],
        };
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
        Ok(())
    }

    fn supports_sessions(&self) -> bool {
        false
    }

    fn pinned_address(&self) -> Option<&ServerAddress> {
        Some(&self.address)
    }
}
