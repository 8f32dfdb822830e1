//! Contains the `Collection` type and the namespace model.

pub mod options;

use std::{fmt, str::FromStr, sync::Arc};

use bson::Document;
use serde::{de::Error as SerdeDeError, Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

use crate::{
    change_stream::{options::ChangeStreamOptions, ChangeStream},
    concern::{ReadConcern, WriteConcern},
    cursor::Cursor,
    db::Database,
    error::{convert_bulk_errors, Error, ErrorKind, Result},
    operation::{
        Aggregate, AggregateTarget, Delete, Find, Insert, Update, UpdateOrReplace,
    },
    options::{
        AggregateOptions, DeleteOptions, FindOneOptions, FindOptions, InsertManyOptions,
        InsertOneOptions, ReplaceOptions, UpdateOptions,
    },
    results::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult},
    selection_criteria::SelectionCriteria,
    Client, ClientSession,
};

/// A database name and collection name pair, uniquely identifying a collection in a
/// deployment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The name of the database associated with this namespace.
    pub db: String,

    /// The name of the collection this namespace corresponds to.
    pub coll: String,
}

impl Namespace {
    /// Creates a new `Namespace` from the given database and collection names.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(2, '.');
        match (parts.next(), parts.next()) {
            (Some(db), Some(coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(Error::invalid_argument(format!(
                "invalid namespace: \"{}\"",
                s
            ))),
        }
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(|_| D::Error::custom(format!("invalid namespace: {}", s)))
    }
}

/// These are the valid options for creating a [`Collection`] with
/// [`Database::collection_with_options`].
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct CollectionOptions {
    /// The default read concern for operations.
    pub read_concern: Option<ReadConcern>,

    /// The default write concern for operations.
    pub write_concern: Option<WriteConcern>,

    /// The default selection criteria for operations.
    pub selection_criteria: Option<SelectionCriteria>,
}

/// `Collection` is the client-side abstraction of a MongoDB collection. All CRUD in this
/// crate flows through a `Collection` (or through the client-level
/// [`BulkWrite`](crate::BulkWrite)).
///
/// `Collection` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html)
/// internally, so it can safely be shared across threads or async tasks.
#[derive(Clone, Debug)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

#[derive(Debug)]
struct CollectionInner {
    client: Client,
    db: Database,
    name: String,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
    selection_criteria: Option<SelectionCriteria>,
}

impl Collection {
    pub(crate) fn new(db: Database, name: &str, options: Option<CollectionOptions>) -> Self {
        let options = options.unwrap_or_default();
        Self {
            inner: Arc::new(CollectionInner {
                client: db.client().clone(),
                read_concern: options.read_concern.or_else(|| db.read_concern().cloned()),
                write_concern: options
                    .write_concern
                    .or_else(|| db.write_concern().cloned()),
                selection_criteria: options
                    .selection_criteria
                    .or_else(|| db.selection_criteria().cloned()),
                name: name.to_string(),
                db,
            }),
        }
    }

    fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Gets the name of the `Collection`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Gets the namespace of the `Collection`, i.e. the `db.coll` pair.
    pub fn namespace(&self) -> Namespace {
        Namespace {
            db: self.inner.db.name().to_string(),
            coll: self.inner.name.clone(),
        }
    }

    /// Gets the read concern of the `Collection`.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    /// Gets the write concern of the `Collection`.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    /// Gets the selection criteria of the `Collection`.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria.as_ref()
    }

    /// Inserts `doc` into the collection.
    pub async fn insert_one(
        &self,
        doc: Document,
        options: impl Into<Option<InsertOneOptions>>,
    ) -> Result<InsertOneResult> {
        self.insert_one_common(doc, options.into(), None).await
    }

    /// Inserts `doc` into the collection using the provided `ClientSession`.
    pub async fn insert_one_with_session(
        &self,
        doc: Document,
        options: impl Into<Option<InsertOneOptions>>,
        session: &mut ClientSession,
    ) -> Result<InsertOneResult> {
        self.insert_one_common(doc, options.into(), Some(session))
            .await
    }

    async fn insert_one_common(
        &self,
        doc: Document,
        options: Option<InsertOneOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<InsertOneResult> {
        let mut options = options
            .map(InsertManyOptions::from_insert_one_options)
            .unwrap_or_default();
        self.resolve_write_concern(&mut options.write_concern, &session);

        let insert = Insert::new(self.namespace(), vec![doc], Some(options));
        self.client()
            .execute_operation(insert, session)
            .await
            .map(InsertOneResult::from_insert_many_result)
            .map_err(convert_bulk_errors)
    }

    /// Inserts the given documents into the collection.
    pub async fn insert_many(
        &self,
        docs: impl IntoIterator<Item = Document>,
        options: impl Into<Option<InsertManyOptions>>,
    ) -> Result<InsertManyResult> {
        self.insert_many_common(docs.into_iter().collect(), options.into(), None)
            .await
    }

    /// Inserts the given documents into the collection using the provided `ClientSession`.
    pub async fn insert_many_with_session(
        &self,
        docs: impl IntoIterator<Item = Document>,
        options: impl Into<Option<InsertManyOptions>>,
        session: &mut ClientSession,
    ) -> Result<InsertManyResult> {
        self.insert_many_common(docs.into_iter().collect(), options.into(), Some(session))
            .await
    }

    /// Runs the insert in as many batches as the server's limits require, accumulating
    /// results and errors across batches. For ordered inserts the first batch containing a
    /// write error is the last one sent.
    async fn insert_many_common(
        &self,
        docs: Vec<Document>,
        options: Option<InsertManyOptions>,
        mut session: Option<&mut ClientSession>,
    ) -> Result<InsertManyResult> {
        if docs.is_empty() {
            return Err(Error::invalid_argument(
                "no documents provided for insert_many",
            ));
        }

        let mut options = options.unwrap_or_default();
        self.resolve_write_concern(&mut options.write_concern, &session);
        let ordered = options.ordered.unwrap_or(true);

        let mut cumulative_result = InsertManyResult::new();
        let mut cumulative_failure: Option<crate::error::BulkWriteFailure> = None;
        let mut error_labels: std::collections::HashSet<String> = Default::default();

        let mut n_attempted = 0;
        while n_attempted < docs.len() {
            let mut insert = Insert::new(
                self.namespace(),
                docs[n_attempted..].to_vec(),
                Some(options.clone()),
            );

            let result = self
                .client()
                .execute_operation(&mut insert, session.as_deref_mut())
                .await;
            let batch_size = insert.n_attempted().max(1);

            match result {
                Ok(batch_result) => {
                    for (index, id) in batch_result.inserted_ids {
                        cumulative_result
                            .inserted_ids
                            .insert(index + n_attempted, id);
                    }
                }
                Err(error) => {
                    let labels: Vec<String> = error.labels().iter().cloned().collect();
                    match *error.kind {
                        ErrorKind::BulkWrite(failure) => {
                            error_labels.extend(labels);
                            let cumulative = cumulative_failure
                                .get_or_insert_with(crate::error::BulkWriteFailure::new);

                            for (index, id) in failure.inserted_ids {
                                cumulative.inserted_ids.insert(index + n_attempted, id);
                            }
                            if let Some(write_errors) = failure.write_errors {
                                let offset_errors =
                                    cumulative.write_errors.get_or_insert_with(Vec::new);
                                for mut write_error in write_errors {
                                    write_error.index += n_attempted;
                                    offset_errors.push(write_error);
                                }
                            }
                            if let Some(wc_error) = failure.write_concern_error {
                                cumulative.write_concern_error = Some(wc_error);
                            }

                            if ordered {
                                break;
                            }
                        }
                        _ => return Err(error),
                    }
                }
            }

            n_attempted += batch_size;
        }

        match cumulative_failure {
            Some(mut failure) => {
                failure.inserted_ids.extend(cumulative_result.inserted_ids);
                Err(crate::error::Error::new(
                    ErrorKind::BulkWrite(failure),
                    Some(error_labels),
                ))
            }
            None => Ok(cumulative_result),
        }
    }

    /// Updates up to one document matching `query` in the collection.
    pub async fn update_one(
        &self,
        query: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        self.update_common(query, update, false, options.into(), None)
            .await
    }

    /// Updates up to one document matching `query` using the provided `ClientSession`.
    pub async fn update_one_with_session(
        &self,
        query: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
        session: &mut ClientSession,
    ) -> Result<UpdateResult> {
        self.update_common(query, update, false, options.into(), Some(session))
            .await
    }

    /// Updates all documents matching `query` in the collection.
    pub async fn update_many(
        &self,
        query: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        self.update_common(query, update, true, options.into(), None)
            .await
    }

    /// Updates all documents matching `query` using the provided `ClientSession`.
    pub async fn update_many_with_session(
        &self,
        query: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
        session: &mut ClientSession,
    ) -> Result<UpdateResult> {
        self.update_common(query, update, true, options.into(), Some(session))
            .await
    }

    async fn update_common(
        &self,
        query: Document,
        update: Document,
        multi: bool,
        mut options: Option<UpdateOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<UpdateResult> {
        self.resolve_options_write_concern(&mut options, &session);
        let update = Update::new(
            self.namespace(),
            query,
            UpdateOrReplace::UpdateModifications(update.into()),
            multi,
            options,
        )?;
        self.client().execute_operation(update, session).await
    }

    /// Replaces up to one document matching `query` in the collection with `replacement`.
    pub async fn replace_one(
        &self,
        query: Document,
        replacement: Document,
        options: impl Into<Option<ReplaceOptions>>,
    ) -> Result<UpdateResult> {
        self.replace_one_common(query, replacement, options.into(), None)
            .await
    }

    /// Replaces up to one document matching `query` using the provided `ClientSession`.
    pub async fn replace_one_with_session(
        &self,
        query: Document,
        replacement: Document,
        options: impl Into<Option<ReplaceOptions>>,
        session: &mut ClientSession,
    ) -> Result<UpdateResult> {
        self.replace_one_common(query, replacement, options.into(), Some(session))
            .await
    }

    async fn replace_one_common(
        &self,
        query: Document,
        replacement: Document,
        options: Option<ReplaceOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<UpdateResult> {
        let mut options = options.map(ReplaceOptions::into_update_options);
        self.resolve_options_write_concern(&mut options, &session);
        let update = Update::new(
            self.namespace(),
            query,
            UpdateOrReplace::Replacement(replacement),
            false,
            options,
        )?;
        self.client().execute_operation(update, session).await
    }

    /// Deletes up to one document found matching `query`.
    pub async fn delete_one(
        &self,
        query: Document,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<DeleteResult> {
        self.delete_common(query, Some(1), options.into(), None)
            .await
    }

    /// Deletes up to one document found matching `query` using the provided
    /// `ClientSession`.
    pub async fn delete_one_with_session(
        &self,
        query: Document,
        options: impl Into<Option<DeleteOptions>>,
        session: &mut ClientSession,
    ) -> Result<DeleteResult> {
        self.delete_common(query, Some(1), options.into(), Some(session))
            .await
    }

    /// Deletes all documents stored in the collection matching `query`.
    pub async fn delete_many(
        &self,
        query: Document,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<DeleteResult> {
        self.delete_common(query, None, options.into(), None).await
    }

    /// Deletes all documents matching `query` using the provided `ClientSession`.
    pub async fn delete_many_with_session(
        &self,
        query: Document,
        options: impl Into<Option<DeleteOptions>>,
        session: &mut ClientSession,
    ) -> Result<DeleteResult> {
        self.delete_common(query, None, options.into(), Some(session))
            .await
    }

    async fn delete_common(
        &self,
        query: Document,
        limit: Option<u32>,
        mut options: Option<DeleteOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<DeleteResult> {
        self.resolve_options_write_concern(&mut options, &session);
        let delete = Delete::new(self.namespace(), query, limit, options);
        self.client().execute_operation(delete, session).await
    }

    /// Finds the documents in the collection matching `filter`.
    pub async fn find(
        &self,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Cursor> {
        let mut options = options.into();
        self.resolve_find_options(&mut options);
        let find = Find::new(self.namespace(), filter, options);
        let client = self.client().clone();
        let (spec, session) = client.execute_cursor_operation(find).await?;
        Ok(Cursor::new(client, spec, session))
    }

    /// Finds the documents in the collection matching `filter` using the provided
    /// `ClientSession`.
    pub async fn find_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
        session: &mut ClientSession,
    ) -> Result<crate::cursor::SessionCursor> {
        let mut options = options.into();
        self.resolve_find_options(&mut options);
        let find = Find::new(self.namespace(), filter, options);
        let client = self.client().clone();
        let spec = client.execute_operation(find, session).await?;
        Ok(crate::cursor::SessionCursor::new(client, spec))
    }

    /// Finds a single document in the collection matching `filter`.
    pub async fn find_one(
        &self,
        filter: Document,
        options: impl Into<Option<FindOneOptions>>,
    ) -> Result<Option<Document>> {
        let options: FindOptions = options.into().unwrap_or_default().into();
        let mut cursor = self.find(filter, options).await?;
        cursor.next().await.transpose()
    }

    /// Runs an aggregation operation against the collection.
    pub async fn aggregate(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<AggregateOptions>>,
    ) -> Result<Cursor> {
        let mut options = options.into();
        self.resolve_aggregate_options(&mut options);
        let aggregate = Aggregate::new(self.namespace(), pipeline, options);
        let client = self.client().clone();
        let (spec, session) = client.execute_cursor_operation(aggregate).await?;
        Ok(Cursor::new(client, spec, session))
    }

    /// Starts a new [`ChangeStream`] that receives events for all changes in this
    /// collection.
    pub async fn watch(
        &self,
        pipeline: impl Into<Option<Vec<Document>>>,
        options: impl Into<Option<ChangeStreamOptions>>,
    ) -> Result<ChangeStream> {
        let target = AggregateTarget::Collection(self.namespace());
        ChangeStream::execute(
            self.client().clone(),
            target,
            pipeline.into().unwrap_or_default(),
            options.into(),
        )
        .await
    }

    fn resolve_write_concern(
        &self,
        write_concern: &mut Option<WriteConcern>,
        session: &Option<&mut ClientSession>,
    ) {
        // Inside a transaction the only permitted write concern is the transaction's own;
        // inherited defaults must not leak into individual commands.
        let in_transaction = session
            .as_ref()
            .map(|session| session.in_transaction())
            .unwrap_or(false);
        if write_concern.is_none() && !in_transaction {
            *write_concern = self.write_concern().cloned();
        }
    }

    fn resolve_options_write_concern<O: HasWriteConcern>(
        &self,
        options: &mut Option<O>,
        session: &Option<&mut ClientSession>,
    ) {
        let in_transaction = session
            .as_ref()
            .map(|session| session.in_transaction())
            .unwrap_or(false);
        if in_transaction {
            return;
        }
        if let Some(write_concern) = self.write_concern().cloned() {
            let options = options.get_or_insert_with(Default::default);
            if options.write_concern_mut().is_none() {
                *options.write_concern_mut() = Some(write_concern);
            }
        }
    }

    fn resolve_find_options(&self, options: &mut Option<FindOptions>) {
        let read_concern = self.read_concern().cloned();
        let selection_criteria = self.selection_criteria().cloned();
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

    fn resolve_aggregate_options(&self, options: &mut Option<AggregateOptions>) {
        let read_concern = self.read_concern().cloned();
        let write_concern = self.write_concern().cloned();
        let selection_criteria = self.selection_criteria().cloned();
        if read_concern.is_none() && write_concern.is_none() && selection_criteria.is_none() {
            return;
        }
        let options = options.get_or_insert_with(Default::default);
        if options.read_concern.is_none() {
            options.read_concern = read_concern;
        }
        if options.write_concern.is_none() {
            options.write_concern = write_concern;
        }
        if options.selection_criteria.is_none() {
            options.selection_criteria = selection_criteria;
        }
    }
}

trait HasWriteConcern: Default {
    fn write_concern_mut(&mut self) -> &mut Option<WriteConcern>;
}

impl HasWriteConcern for UpdateOptions {
    fn write_concern_mut(&mut self) -> &mut Option<WriteConcern> {
        &mut self.write_concern
    }
}

impl HasWriteConcern for DeleteOptions {
    fn write_concern_mut(&mut self) -> &mut Option<WriteConcern> {
        &mut self.write_concern
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn namespace_round_trip() {
        let ns: Namespace = "db.coll".parse().unwrap();
        assert_eq!(ns, Namespace::new("db", "coll"));
        assert_eq!(ns.to_string(), "db.coll");

        // Collection names may themselves contain dots.
        let nested: Namespace = "db.coll.sub".parse().unwrap();
        assert_eq!(nested.coll, "coll.sub");

        assert!(Namespace::from_str("nodot").is_err());
        assert!(Namespace::from_str(".coll").is_err());
    }
}
