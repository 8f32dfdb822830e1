use std::{collections::VecDeque, time::Duration};

use bson::{doc, Bson, RawDocumentBuf};
use serde::Deserialize;

use super::Operation;
use crate::{
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    options::ServerAddress,
    Namespace,
};

/// A `getMore` command retrieving the next batch of an open cursor. Always pinned to the
/// server that created the cursor.
#[derive(Debug)]
pub(crate) struct GetMore {
    ns: Namespace,
    cursor_id: i64,
    address: ServerAddress,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
    comment: Option<Bson>,
}

impl GetMore {
    pub(crate) fn new(
        ns: Namespace,
        cursor_id: i64,
        address: ServerAddress,
        batch_size: Option<u32>,
        max_await_time: Option<Duration>,
        comment: Option<Bson>,
    ) -> Self {
        Self {
            ns,
            cursor_id,
            address,
            batch_size,
            max_await_time,
            comment,
        }
    }
}

impl Operation for GetMore {
    type O = GetMoreResult;

    const NAME: &'static str = "getMore";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.cursor_id,
            "collection": self.ns.coll.clone(),
        };

        if let Some(batch_size) = self.batch_size {
            if batch_size != 0 {
                body.insert("batchSize", batch_size as i64);
            }
        }

        if let Some(ref max_await_time) = self.max_await_time {
            body.insert("maxTimeMS", max_await_time.as_millis() as i64);
        }

        if let Some(ref comment) = self.comment {
            body.insert("comment", comment.clone());
        }

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

        let body: GetMoreResponseBody = response.body()?;

        Ok(GetMoreResult {
            batch: body.cursor.next_batch,
            id: body.cursor.id,
            ns: body.cursor.ns,
            post_batch_resume_token: body.cursor.post_batch_resume_token,
        })
    }

    fn pinned_address(&self) -> Option<&ServerAddress> {
        Some(&self.address)
    }
}

#[derive(Debug, Deserialize)]
struct GetMoreResponseBody {
    cursor: NextBatchBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextBatchBody {
    id: i64,
    ns: Namespace,
    next_batch: VecDeque<RawDocumentBuf>,
    post_batch_resume_token: Option<RawDocumentBuf>,
}

/// The result of one getMore round trip.
#[derive(Debug, Clone)]
pub(crate) struct GetMoreResult {
    pub(crate) batch: VecDeque<RawDocumentBuf>,

    /// The cursor id, 0 once the server has exhausted the cursor.
    pub(crate) id: i64,

    #[allow(dead_code)]
    pub(crate) ns: Namespace,

    pub(crate) post_batch_resume_token: Option<RawDocumentBuf>,
}
