use std::time::Duration;

use bson::doc;

use super::{Operation, Retryability, WriteConcernOnlyBody};
use crate::{
    client::session::TransactionOptions,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::{Acknowledgment, WriteConcern},
    error::Result,
};

/// A `commitTransaction` command. Always run against the admin database with the write
/// concern captured at transaction start.
#[derive(Debug)]
pub(crate) struct CommitTransaction {
    options: Option<TransactionOptions>,
}

impl CommitTransaction {
    pub(crate) fn new(options: Option<TransactionOptions>) -> Self {
        Self { options }
    }
}

impl Operation for CommitTransaction {
    type O = ();

    const NAME: &'static str = "commitTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
        };

        if let Some(ref write_concern) = self.write_concern() {
            if !write_concern.is_empty() {
                body.insert("writeConcern", write_concern.to_document()?);
            }
        }

        if let Some(max_commit_time) = self
            .options
            .as_ref()
            .and_then(|options| options.max_commit_time)
        {
            body.insert("maxTimeMS", max_commit_time.as_millis() as i64);
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
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    /// Commits retried after an unknown outcome upgrade their write concern to majority
    /// with a bounded wtimeout, per the transactions specification.
    fn update_for_retry(&mut self) {
        let options = self.options.get_or_insert_with(Default::default);
        let write_concern = options.write_concern.get_or_insert_with(Default::default);
        write_concern.w = Some(Acknowledgment::Majority);
        if write_concern.w_timeout.is_none() {
            write_concern.w_timeout = Some(Duration::from_secs(10));
        }
    }
}
