//! Change streams: real-time notification of data changes, with automatic one-shot
//! resumption after transient failures.

pub mod event;
pub mod options;

#[cfg(test)]
mod test;

use bson::{doc, Document};

use self::{event::ResumeToken, options::ChangeStreamOptions};
use crate::{
    cursor::Cursor,
    error::{Error, Result},
    operation::{Aggregate, AggregateTarget},
    options::AggregateOptions,
    Client,
};

/// A `ChangeStream` streams the ongoing changes of its associated collection, database or
/// deployment. It is created through [`Client::watch`], [`Database::watch`](crate::Database::watch)
/// or [`Collection::watch`](crate::Collection::watch).
///
/// The stream tracks the resume token of the most recently returned event. When the
/// underlying cursor fails with a resumable error, the stream transparently re-runs its
/// aggregation once with `resumeAfter` set to that token; callers observe an unbroken
/// sequence of events. A stream that has already resumed surfaces the next failure to the
/// caller, who may construct a fresh stream from [`ChangeStream::resume_token`].
///
/// A change stream exclusively owns its cursor and is not safe for concurrent use.
///
/// ```no_run
/// # use mongodb_core::{bson::doc, Client, error::Result};
/// # async fn run(client: Client) -> Result<()> {
/// let coll = client.database("inventory").collection("items");
/// let mut stream = coll.watch(None, None).await?;
/// while let Some(event) = stream.next().await.transpose()? {
///     println!("change: {}", event);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ChangeStream {
    client: Client,
    target: AggregateTarget,
    pipeline: Vec<Document>,
    options: Option<ChangeStreamOptions>,
    cursor: Cursor,
    resume_token: Option<ResumeToken>,
    resumed: bool,
}

impl ChangeStream {
    /// Runs the initial `$changeStream` aggregation and wraps the resulting cursor.
    pub(crate) async fn execute(
        client: Client,
        target: AggregateTarget,
        pipeline: Vec<Document>,
        options: Option<ChangeStreamOptions>,
    ) -> Result<Self> {
        let aggregate = build_aggregate(&target, &pipeline, options.as_ref(), None)?;

        let (spec, session) = client.execute_cursor_operation(aggregate).await?;

        // The stream's starting token: the caller-provided one, or the post-batch token
        // the server returned with an empty first batch.
        let resume_token = options
            .as_ref()
            .and_then(|options| {
                options
                    .start_after
                    .clone()
                    .or_else(|| options.resume_after.clone())
            })
            .map(|doc| ResumeToken(bson::Bson::Document(doc)))
            .or_else(|| {
                spec.info
                    .post_batch_resume_token
                    .as_ref()
                    .and_then(ResumeToken::from_raw)
            });

        let cursor = Cursor::new(client.clone(), spec, session);

        Ok(Self {
            client,
            target,
            pipeline,
            options,
            cursor,
            resume_token,
            resumed: false,
        })
    }

    /// Returns the cached resume token that can be used to resume after the most recently
    /// returned change.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.resume_token.clone()
    }

    /// The next change event, or `None` if no more events are currently available (for a
    /// stream whose cursor is still alive, events may become available later).
    ///
    /// After every returned event, the stream's stored resume token is that event's `_id`.
    pub async fn next(&mut self) -> Option<Result<Document>> {
        loop {
            match self.next_inner().await {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => return None,
                Err(error) => {
                    if self.resumed || !error.is_resumable() {
                        return Some(Err(error));
                    }
                    // One-shot resume: re-run the aggregation from the last seen token.
                    // The failed cursor closes its server-side half best-effort on drop.
                    self.resumed = true;
                    if let Err(resume_error) = self.resume().await {
                        return Some(Err(resume_error));
                    }
                }
            }
        }
    }

    async fn next_inner(&mut self) -> Result<Option<Document>> {
        match self.cursor.next_raw().await? {
            Some(raw) => {
                let event: Document = raw
                    .try_into()
                    .map_err(|e: bson::raw::Error| Error::invalid_response(e.to_string()))?;
                self.resume_token = Some(ResumeToken::from_event_document(&event)?);
                Ok(Some(event))
            }
            None => {
                // With the batch drained, the post-batch token is the stream's most
                // recent position.
                if let Some(token) = self
                    .cursor
                    .post_batch_resume_token()
                    .and_then(ResumeToken::from_raw)
                {
                    self.resume_token = Some(token);
                }
                Ok(None)
            }
        }
    }

    /// Re-executes the aggregation with `resumeAfter` set to the last observed token,
    /// replacing this stream's cursor.
    async fn resume(&mut self) -> Result<()> {
        let aggregate = build_aggregate(
            &self.target,
            &self.pipeline,
            self.options.as_ref(),
            self.resume_token.clone(),
        )?;

        let (spec, session) = self.client.execute_cursor_operation(aggregate).await?;

        if self.resume_token.is_none() {
            self.resume_token = spec
                .info
                .post_batch_resume_token
                .as_ref()
                .and_then(ResumeToken::from_raw);
        }

        self.cursor = Cursor::new(self.client.clone(), spec, session);
        Ok(())
    }
}

/// Builds the `aggregate` operation for a change stream: a `$changeStream` stage followed
/// by the caller's pipeline.
///
/// When `resume_token` is given (a resume after an error), it replaces any caller-provided
/// `resumeAfter`/`startAfter`/`startAtOperationTime` so the stream continues from where it
/// actually was, not where it originally began.
fn build_aggregate(
    target: &AggregateTarget,
    pipeline: &[Document],
    options: Option<&ChangeStreamOptions>,
    resume_token: Option<ResumeToken>,
) -> Result<Aggregate> {
    let mut change_stream_stage = match options {
        Some(options) => bson::to_document(options)?,
        None => Document::new(),
    };

    if let Some(token) = resume_token {
        change_stream_stage.remove("startAfter");
        change_stream_stage.remove("startAtOperationTime");
        change_stream_stage.insert("resumeAfter", token.0);
    }

    let mut full_pipeline = Vec::with_capacity(pipeline.len() + 1);
    full_pipeline.push(doc! { "$changeStream": change_stream_stage });
    full_pipeline.extend(pipeline.iter().cloned());

    let aggregate_options = options.map(|options| {
        AggregateOptions::builder()
            .batch_size(options.batch_size)
            .max_await_time(options.max_await_time)
            .collation(options.collation.clone())
            .read_concern(options.read_concern.clone())
            .selection_criteria(options.selection_criteria.clone())
            .build()
    });

    Ok(Aggregate::new(
        target.clone(),
        full_pipeline,
        aggregate_options,
    ))
}
