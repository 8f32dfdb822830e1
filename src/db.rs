//! Contains the `Database` type and its options.

use std::sync::Arc;

use bson::Document;
use typed_builder::TypedBuilder;

use crate::{
    change_stream::{options::ChangeStreamOptions, ChangeStream},
    coll::{options::AggregateOptions, Collection},
    concern::{ReadConcern, WriteConcern},
    cursor::Cursor,
    error::Result,
    operation::{Aggregate, AggregateTarget, RunCommand},
    selection_criteria::SelectionCriteria,
    Client, ClientSession,
};

/// These are the valid options for creating a [`Database`] with
/// [`Client::database_with_options`].
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DatabaseOptions {
    /// The default read concern for operations.
    pub read_concern: Option<ReadConcern>,

    /// The default write concern for operations.
    pub write_concern: Option<WriteConcern>,

    /// The default selection criteria for operations.
    pub selection_criteria: Option<SelectionCriteria>,
}

/// `Database` is the client-side abstraction of a MongoDB database. It can be used to
/// perform database-level operations or to obtain handles to specific collections within
/// the database.
///
/// `Database` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html)
/// internally, so it can safely be shared across threads or async tasks.
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

#[derive(Debug)]
struct DatabaseInner {
    client: Client,
    name: String,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
    selection_criteria: Option<SelectionCriteria>,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str, options: Option<DatabaseOptions>) -> Self {
        let options = options.unwrap_or_default();
        Self {
            inner: Arc::new(DatabaseInner {
                read_concern: options
                    .read_concern
                    .or_else(|| client.read_concern().cloned()),
                write_concern: options
                    .write_concern
                    .or_else(|| client.write_concern().cloned()),
                selection_criteria: options
                    .selection_criteria
                    .or_else(|| client.selection_criteria().cloned()),
                client,
                name: name.to_string(),
            }),
        }
    }

    pub(crate) fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Gets the name of the `Database`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Gets the read concern of the `Database`.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    /// Gets the write concern of the `Database`.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    /// Gets the selection criteria of the `Database`.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria.as_ref()
    }

    /// Gets a handle to a collection specified by `name` of the database. The
    /// `Collection` options (e.g. read preference and write concern) will default to those
    /// of the `Database`.
    ///
    /// This method does not send or receive anything across the wire to the database, so
    /// it can be used repeatedly without incurring any costs from I/O.
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.clone(), name, None)
    }

    /// Gets a handle to a collection with the given options.
    pub fn collection_with_options(
        &self,
        name: &str,
        options: crate::coll::CollectionOptions,
    ) -> Collection {
        Collection::new(self.clone(), name, Some(options))
    }

    /// Runs a database-level command.
    ///
    /// Note that no inspection is done on `doc`, so the command will not use the
    /// database's default read concern or write concern. If specific read concern or
    /// write concern is desired, it must be specified manually.
    pub async fn run_command(
        &self,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let operation = RunCommand::new(
            self.inner.name.clone(),
            command,
            selection_criteria.into(),
        )?;
        self.inner.client.execute_operation(operation, None).await
    }

    /// Runs a database-level command using the provided `ClientSession`.
    pub async fn run_command_with_session(
        &self,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let operation = RunCommand::new(
            self.inner.name.clone(),
            command,
            selection_criteria.into(),
        )?;
        self.inner
            .client
            .execute_operation(operation, session)
            .await
    }

    /// Runs an aggregation operation against the database.
    pub async fn aggregate(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<AggregateOptions>>,
    ) -> Result<Cursor> {
        let mut options = options.into();
        resolve_aggregate_options(&mut options, self);
        let aggregate = Aggregate::new(self.inner.name.clone(), pipeline, options);
        let client = self.inner.client.clone();
        let (spec, session) = client.execute_cursor_operation(aggregate).await?;
        Ok(Cursor::new(client, spec, session))
    }

    /// Starts a new [`ChangeStream`] that receives events for all changes in this
    /// database.
    pub async fn watch(
        &self,
        pipeline: impl Into<Option<Vec<Document>>>,
        options: impl Into<Option<ChangeStreamOptions>>,
    ) -> Result<ChangeStream> {
        let target = AggregateTarget::Database(self.inner.name.clone());
        ChangeStream::execute(
            self.inner.client.clone(),
            target,
            pipeline.into().unwrap_or_default(),
            options.into(),
        )
        .await
    }
}

fn resolve_aggregate_options(options: &mut Option<AggregateOptions>, db: &Database) {
    let read_concern = db.read_concern().cloned();
    let selection_criteria = db.selection_criteria().cloned();
    if read_concern.is_none() && selection_criteria.is_none() {
        return;
    }
    let options = options.get_or_insert_with(Default::default);
    if options.read_concern.is_none() {
        options.read_concern = read_concern;
    }
    if options.selection_criteria.is_none() {
        options.selection_criteria = selection_criteria;
    }
}
