//! Options for collection-level operations.

use std::time::Duration;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    concern::{ReadConcern, WriteConcern},
    selection_criteria::SelectionCriteria,
};

/// Specifies the options to a [`Collection::insert_one`](crate::Collection::insert_one)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct InsertOneOptions {
    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Tags the query with an arbitrary [`Bson`] value to help trace the operation through
    /// the database profiler, currentOp and logs.
    pub comment: Option<Bson>,
}

/// Specifies the options to a [`Collection::insert_many`](crate::Collection::insert_many)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct InsertManyOptions {
    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// If true, when an insert fails, return without performing the remaining writes. If
    /// false, when a write fails, continue with the remaining writes, if any.
    ///
    /// Defaults to true.
    pub ordered: Option<bool>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Tags the query with an arbitrary [`Bson`] value.
    pub comment: Option<Bson>,
}

impl InsertManyOptions {
    pub(crate) fn from_insert_one_options(options: InsertOneOptions) -> Self {
        Self {
            bypass_document_validation: options.bypass_document_validation,
            ordered: None,
            write_concern: options.write_concern,
            comment: options.comment,
        }
    }
}

/// Specifies the options to a [`Collection::update_one`](crate::Collection::update_one) or
/// [`Collection::update_many`](crate::Collection::update_many) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct UpdateOptions {
    /// A set of filters specifying to which array elements an update should apply.
    pub array_filters: Option<Vec<Document>>,

    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// If true, insert a document if no matching document is found.
    pub upsert: Option<bool>,

    /// The collation to use for the operation.
    pub collation: Option<Document>,

    /// A document or string that specifies the index to use to support the query predicate.
    pub hint: Option<Bson>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Map of parameter names and values that can be accessed in the command via `$$var`.
    #[serde(rename = "let")]
    pub let_vars: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value.
    pub comment: Option<Bson>,
}

/// Specifies the options to a [`Collection::replace_one`](crate::Collection::replace_one)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ReplaceOptions {
    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// If true, insert a document if no matching document is found.
    pub upsert: Option<bool>,

    /// The collation to use for the operation.
    pub collation: Option<Document>,

    /// A document or string that specifies the index to use to support the query predicate.
    pub hint: Option<Bson>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// Map of parameter names and values that can be accessed in the command via `$$var`.
    #[serde(rename = "let")]
    pub let_vars: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value.
    pub comment: Option<Bson>,
}

impl ReplaceOptions {
    pub(crate) fn into_update_options(self) -> UpdateOptions {
        UpdateOptions {
            array_filters: None,
            bypass_document_validation: self.bypass_document_validation,
            upsert: self.upsert,
            collation: self.collation,
            hint: self.hint,
            write_concern: self.write_concern,
            let_vars: self.let_vars,
            comment: self.comment,
        }
    }
}

/// Specifies the options to a [`Collection::delete_one`](crate::Collection::delete_one) or
/// [`Collection::delete_many`](crate::Collection::delete_many) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DeleteOptions {
    /// The collation to use for the operation.
    pub collation: Option<Document>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,

    /// A document or string that specifies the index to use to support the query predicate.
    pub hint: Option<Bson>,

    /// Map of parameter names and values that can be accessed in the command via `$$var`.
    #[serde(rename = "let")]
    pub let_vars: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value.
    pub comment: Option<Bson>,
}

/// The type of cursor a find operation should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CursorType {
    /// A regular, non-tailable cursor that is closed once all its results are exhausted.
    NonTailable,

    /// A tailable cursor that remains open after the last data is retrieved, for capped
    /// collections.
    Tailable,

    /// A tailable cursor on which the server blocks for new data on getMore, bounded by
    /// `max_await_time`.
    TailableAwait,
}

/// Specifies the options to a [`Collection::find`](crate::Collection::find) operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct FindOptions {
    /// Enables writing to temporary files by the server when executing the query.
    pub allow_disk_use: Option<bool>,

    /// The number of documents the server should return per cursor batch.
    #[serde(skip)]
    pub batch_size: Option<u32>,

    /// The collation to use for the operation.
    pub collation: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value.
    pub comment: Option<Bson>,

    /// The type of cursor to return.
    #[serde(skip)]
    pub cursor_type: Option<CursorType>,

    /// A document or string that specifies the index to use to support the query predicate.
    pub hint: Option<Bson>,

    /// The maximum number of documents to query.
    #[serde(skip)]
    pub limit: Option<i64>,

    /// The maximum amount of time for the server to wait on new documents to satisfy a
    /// tailable cursor query. Only valid for `CursorType::TailableAwait` cursors.
    #[serde(skip)]
    pub max_await_time: Option<Duration>,

    /// Maximum amount of time for the query to run on the server before it is aborted.
    #[serde(
        rename = "maxTimeMS",
        serialize_with = "crate::coll::options::serialize_duration_option_as_int_millis"
    )]
    pub max_time: Option<Duration>,

    /// The number of documents to skip before counting.
    pub skip: Option<u64>,

    /// The order of the documents for the purposes of the operation.
    pub sort: Option<Document>,

    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for the operation.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// Map of parameter names and values that can be accessed in the command via `$$var`.
    #[serde(rename = "let")]
    pub let_vars: Option<Document>,
}

/// Specifies the options to a [`Collection::find_one`](crate::Collection::find_one)
/// operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct FindOneOptions {
    /// The collation to use for the operation.
    pub collation: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value.
    pub comment: Option<Bson>,

    /// A document or string that specifies the index to use to support the query predicate.
    pub hint: Option<Bson>,

    /// Maximum amount of time for the query to run on the server before it is aborted.
    pub max_time: Option<Duration>,

    /// The number of documents to skip before counting.
    pub skip: Option<u64>,

    /// The order of the documents for the purposes of the operation.
    pub sort: Option<Document>,

    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for the operation.
    pub selection_criteria: Option<SelectionCriteria>,
}

impl From<FindOneOptions> for FindOptions {
    fn from(options: FindOneOptions) -> Self {
        FindOptions {
            collation: options.collation,
            comment: options.comment,
            hint: options.hint,
            limit: Some(-1),
            max_time: options.max_time,
            skip: options.skip,
            sort: options.sort,
            projection: options.projection,
            read_concern: options.read_concern,
            selection_criteria: options.selection_criteria,
            ..Default::default()
        }
    }
}

/// Specifies the options to a [`Collection::aggregate`](crate::Collection::aggregate)
/// operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct AggregateOptions {
    /// Enables writing to temporary files by the server.
    pub allow_disk_use: Option<bool>,

    /// The number of documents the server should return per cursor batch.
    #[serde(skip)]
    pub batch_size: Option<u32>,

    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// The collation to use for the operation.
    pub collation: Option<Document>,

    /// Tags the query with an arbitrary [`Bson`] value.
    pub comment: Option<Bson>,

    /// A document or string that specifies the index to use to support the query predicate.
    pub hint: Option<Bson>,

    /// The maximum amount of time for the server to wait on new documents to satisfy a
    /// tailable awaitData cursor on getMore.
    #[serde(skip)]
    pub max_await_time: Option<Duration>,

    /// Maximum amount of time for the operation to run on the server before it is aborted.
    #[serde(
        rename = "maxTimeMS",
        serialize_with = "crate::coll::options::serialize_duration_option_as_int_millis"
    )]
    pub max_time: Option<Duration>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The write concern for the operation, applied when the pipeline contains `$out` or
    /// `$merge`.
    pub write_concern: Option<WriteConcern>,

    /// The criteria used to select a server for the operation.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// Map of parameter names and values that can be accessed in the command via `$$var`.
    #[serde(rename = "let")]
    pub let_vars: Option<Document>,
}

pub(crate) fn serialize_duration_option_as_int_millis<S: serde::Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) => serializer.serialize_i64(duration.as_millis() as i64),
        None => serializer.serialize_none(),
    }
}
