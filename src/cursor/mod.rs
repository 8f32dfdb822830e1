//! Cursors for iterating multi-batch command results.

use std::{
    collections::VecDeque,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bson::{Bson, Document, RawDocumentBuf};
use derivative::Derivative;
use futures_core::Stream;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;

use crate::{
    client::session::ClientSession,
    error::{Error, Result},
    operation::{CursorInfo, GetMore, GetMoreResult, KillCursors},
    options::ServerAddress,
    runtime, BoxFuture, Client, Namespace,
};

/// Everything the driver needs to iterate a cursor returned by the server: its id and first
/// batch, the namespace getMore commands target, and the server the cursor is pinned to.
#[derive(Debug, Clone)]
pub(crate) struct CursorSpecification {
    pub(crate) info: CursorInfo,
    pub(crate) address: ServerAddress,
    pub(crate) batch_size: Option<u32>,
    pub(crate) max_await_time: Option<Duration>,
    pub(crate) comment: Option<Bson>,
}

impl CursorSpecification {
    pub(crate) fn new(
        info: CursorInfo,
        address: ServerAddress,
        batch_size: impl Into<Option<u32>>,
        max_await_time: impl Into<Option<Duration>>,
        comment: Option<Bson>,
    ) -> Self {
        Self {
            info,
            address,
            batch_size: batch_size.into(),
            max_await_time: max_await_time.into(),
            comment,
        }
    }

    pub(crate) fn id(&self) -> i64 {
        self.info.id
    }

    pub(crate) fn namespace(&self) -> &Namespace {
        &self.info.ns
    }
}

/// The iteration state of a cursor.
///
/// `InBatch` means buffered documents remain from the last reply; `EndOfBatch` means the
/// buffer is drained but the server-side cursor is still open; `Done` means the server
/// cursor is exhausted (id 0) and the buffer is empty.
#[derive(Debug, Clone, Copy, PartialEq)]
enum CursorState {
    InBatch,
    EndOfBatch,
    Done,
}

/// A cursor streaming the results of an operation in server-sized batches.
///
/// A cursor is pinned to the server that created it: all getMore and killCursors commands
/// it issues target that server. Iterate with [`Cursor::next`], or through the
/// [`Stream`](futures_core::Stream) implementation:
///
/// ```no_run
/// # use mongodb_core::{bson::doc, Client, error::Result};
/// # async fn run(client: Client) -> Result<()> {
/// let coll = client.database("app").collection("users");
/// let mut cursor = coll.find(doc! { "active": true }, None).await?;
/// while let Some(doc) = cursor.next().await.transpose()? {
///     println!("{}", doc);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Cursor {
    client: Client,
    spec: CursorSpecification,
    batch: VecDeque<RawDocumentBuf>,
    state: CursorState,
    /// The implicit session iteration runs under, if the cursor owns one. While a getMore
    /// started by `poll_next` is in flight, the session rides inside the pending future.
    session: Option<ClientSession>,
    post_batch_resume_token: Option<RawDocumentBuf>,
    #[derivative(Debug = "ignore")]
    pending_get_more: Option<GetMoreFuture>,
}

type GetMoreFuture = BoxFuture<'static, (Result<GetMoreResult>, Option<ClientSession>)>;

impl Cursor {
    pub(crate) fn new(
        client: Client,
        spec: CursorSpecification,
        session: Option<ClientSession>,
    ) -> Self {
        let batch: VecDeque<RawDocumentBuf> = spec.info.first_batch.clone().into_iter().collect();
        let state = initial_state(spec.id(), &batch);
        let post_batch_resume_token = spec.info.post_batch_resume_token.clone();
        Self {
            client,
            spec,
            batch,
            state,
            session,
            post_batch_resume_token,
            pending_get_more: None,
        }
    }

    /// The namespace this cursor iterates.
    pub fn namespace(&self) -> Namespace {
        self.spec.info.ns.clone()
    }

    pub(crate) fn post_batch_resume_token(&self) -> Option<&RawDocumentBuf> {
        self.post_batch_resume_token.as_ref()
    }

    /// Advances the cursor, returning the next document, or `None` once the cursor is
    /// exhausted. For tailable cursors an empty reply surfaces as `None` without closing
    /// the cursor; iteration may be resumed later.
    pub async fn next(&mut self) -> Option<Result<Document>> {
        match self.next_raw().await {
            Ok(Some(raw)) => Some(raw.try_into().map_err(|e: bson::raw::Error| {
                Error::invalid_response(e.to_string())
            })),
            Ok(None) => None,
            Err(error) => Some(Err(error)),
        }
    }

    /// Advances the cursor and deserializes the next document to a `T`.
    pub async fn next_as<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        match self.next_raw().await {
            Ok(Some(raw)) => Some(
                bson::from_slice(raw.as_bytes())
                    .map_err(|e| Error::invalid_response(e.to_string())),
            ),
            Ok(None) => None,
            Err(error) => Some(Err(error)),
        }
    }

    pub(crate) async fn next_raw(&mut self) -> Result<Option<RawDocumentBuf>> {
        loop {
            match self.state {
                CursorState::InBatch => {
                    if let Some(doc) = self.pop_from_batch() {
                        return Ok(Some(doc));
                    }
                }
                CursorState::EndOfBatch => {
                    let got_more = self.get_more().await?;
                    if !got_more {
                        // Tailable cursor with no new data yet.
                        return Ok(None);
                    }
                }
                CursorState::Done => return Ok(None),
            }
        }
    }

    fn pop_from_batch(&mut self) -> Option<RawDocumentBuf> {
        match self.batch.pop_front() {
            Some(doc) => {
                if self.batch.is_empty() {
                    self.state = if self.spec.id() == 0 {
                        CursorState::Done
                    } else {
                        CursorState::EndOfBatch
                    };
                }
                Some(doc)
            }
            None => {
                self.state = if self.spec.id() == 0 {
                    CursorState::Done
                } else {
                    CursorState::EndOfBatch
                };
                None
            }
        }
    }

    /// Issues a getMore against the cursor's pinned server, buffering the returned batch.
    /// Returns whether any documents were received.
    async fn get_more(&mut self) -> Result<bool> {
        // Finish any getMore a partially polled Stream call left in flight rather than
        // issuing a duplicate.
        let future = match self.pending_get_more.take() {
            Some(future) => future,
            None => self.start_get_more(),
        };
        let (result, session) = future.await;
        self.session = session;
        match result {
            Ok(result) => {
                self.apply_get_more(result);
                Ok(self.state == CursorState::InBatch)
            }
            Err(error) => {
                // A cursor error ends iteration; the server has already closed cursors it
                // reports as not found.
                self.state = CursorState::Done;
                self.spec.info.id = 0;
                Err(error)
            }
        }
    }

    /// Builds the next getMore round trip as an owned future, moving the cursor's session
    /// into it for the duration of the call.
    fn start_get_more(&mut self) -> GetMoreFuture {
        let get_more = GetMore::new(
            self.spec.info.ns.clone(),
            self.spec.id(),
            self.spec.address.clone(),
            self.spec.batch_size,
            self.spec.max_await_time,
            self.spec.comment.clone(),
        );
        let client = self.client.clone();
        let mut session = self.session.take();
        async move {
            let result = client.execute_operation(get_more, session.as_mut()).await;
            (result, session)
        }
        .boxed()
    }

    fn apply_get_more(&mut self, result: GetMoreResult) {
        self.spec.info.id = result.id;
        self.post_batch_resume_token = result.post_batch_resume_token;
        self.batch.extend(result.batch);
        self.state = if self.batch.is_empty() {
            if self.spec.id() == 0 {
                CursorState::Done
            } else {
                CursorState::EndOfBatch
            }
        } else {
            CursorState::InBatch
        };
    }
}

impl Stream for Cursor {
    type Item = Result<Document>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(future) = this.pending_get_more.as_mut() {
                let (result, session) = match future.poll_unpin(cx) {
                    Poll::Ready(output) => output,
                    Poll::Pending => return Poll::Pending,
                };
                this.pending_get_more = None;
                this.session = session;
                match result {
                    Ok(result) => this.apply_get_more(result),
                    Err(error) => {
                        this.state = CursorState::Done;
                        this.spec.info.id = 0;
                        return Poll::Ready(Some(Err(error)));
                    }
                }
            }

            match this.state {
                CursorState::InBatch => {
                    if let Some(raw) = this.pop_from_batch() {
                        let document = raw.try_into().map_err(|e: bson::raw::Error| {
                            Error::invalid_response(e.to_string())
                        });
                        return Poll::Ready(Some(document));
                    }
                }
                CursorState::EndOfBatch => {
                    this.pending_get_more = Some(this.start_get_more());
                }
                CursorState::Done => return Poll::Ready(None),
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        // Best-effort close of the server-side cursor; never blocks the dropping task.
        if self.spec.id() != 0 && self.state != CursorState::Done {
            let kill = KillCursors::new(
                self.spec.info.ns.clone(),
                self.spec.id(),
                self.spec.address.clone(),
            );
            let client = self.client.clone();
            if tokio::runtime::Handle::try_current().is_ok() {
                runtime::spawn(async move {
                    let _ = client.execute_operation(kill, None).await;
                });
            }
        }
    }
}

/// A cursor iterated under an explicit [`ClientSession`]. The session is passed to each
/// `next` call rather than owned, since sessions may not be shared or held across callers.
#[derive(Debug)]
pub struct SessionCursor {
    client: Client,
    spec: CursorSpecification,
    batch: VecDeque<RawDocumentBuf>,
    state: CursorState,
}

impl SessionCursor {
    pub(crate) fn new(client: Client, spec: CursorSpecification) -> Self {
        let batch: VecDeque<RawDocumentBuf> = spec.info.first_batch.clone().into_iter().collect();
        let state = initial_state(spec.id(), &batch);
        Self {
            client,
            spec,
            batch,
            state,
        }
    }

    /// Advances the cursor using the given session, returning the next document or `None`
    /// once exhausted.
    pub async fn next(
        &mut self,
        session: &mut ClientSession,
    ) -> Option<Result<Document>> {
        match self.next_raw(session).await {
            Ok(Some(raw)) => Some(raw.try_into().map_err(|e: bson::raw::Error| {
                Error::invalid_response(e.to_string())
            })),
            Ok(None) => None,
            Err(error) => Some(Err(error)),
        }
    }

    pub(crate) async fn next_raw(
        &mut self,
        session: &mut ClientSession,
    ) -> Result<Option<RawDocumentBuf>> {
        loop {
            match self.state {
                CursorState::InBatch => match self.batch.pop_front() {
                    Some(doc) => {
                        if self.batch.is_empty() && self.spec.id() == 0 {
                            self.state = CursorState::Done;
                        }
                        return Ok(Some(doc));
                    }
                    None => {
                        self.state = if self.spec.id() == 0 {
                            CursorState::Done
                        } else {
                            CursorState::EndOfBatch
                        };
                    }
                },
                CursorState::EndOfBatch => {
                    let get_more = GetMore::new(
                        self.spec.info.ns.clone(),
                        self.spec.id(),
                        self.spec.address.clone(),
                        self.spec.batch_size,
                        self.spec.max_await_time,
                        self.spec.comment.clone(),
                    );
                    let client = self.client.clone();
                    match client.execute_operation(get_more, &mut *session).await {
                        Ok(result) => {
                            self.spec.info.id = result.id;
                            self.batch.extend(result.batch);
                            if self.batch.is_empty() {
                                if self.spec.id() == 0 {
                                    self.state = CursorState::Done;
                                }
                                return Ok(None);
                            }
                            self.state = CursorState::InBatch;
                        }
                        Err(error) => {
                            self.state = CursorState::Done;
                            self.spec.info.id = 0;
                            return Err(error);
                        }
                    }
                }
                CursorState::Done => return Ok(None),
            }
        }
    }
}

impl Drop for SessionCursor {
    fn drop(&mut self) {
        if self.spec.id() != 0 && self.state != CursorState::Done {
            let kill = KillCursors::new(
                self.spec.info.ns.clone(),
                self.spec.id(),
                self.spec.address.clone(),
            );
            let client = self.client.clone();
            if tokio::runtime::Handle::try_current().is_ok() {
                runtime::spawn(async move {
                    let _ = client.execute_operation(kill, None).await;
                });
            }
        }
    }
}

fn initial_state(id: i64, batch: &VecDeque<RawDocumentBuf>) -> CursorState {
    if batch.is_empty() {
        if id == 0 {
            CursorState::Done
        } else {
            CursorState::EndOfBatch
        }
    } else {
        CursorState::InBatch
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initial_state_transitions() {
        let empty = VecDeque::new();
        let full: VecDeque<RawDocumentBuf> = vec![bson::rawdoc! { "a": 1 }].into_iter().collect();

        // id 0 + empty batch: nothing to iterate.
        assert_eq!(initial_state(0, &empty), CursorState::Done);
        // id 0 + documents: drain the batch, then done.
        assert_eq!(initial_state(0, &full), CursorState::InBatch);
        // live cursor + empty batch: a getMore is needed for the first document.
        assert_eq!(initial_state(42, &empty), CursorState::EndOfBatch);
        assert_eq!(initial_state(42, &full), CursorState::InBatch);
    }
}
