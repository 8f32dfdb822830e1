//! Contains the types of results returned by CRUD operations.

use std::collections::HashMap;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

/// The result of a [`Collection::insert_one`](crate::Collection::insert_one) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertOneResult {
    /// The `_id` field of the document inserted.
    pub inserted_id: Bson,
}

impl InsertOneResult {
    pub(crate) fn from_insert_many_result(result: InsertManyResult) -> Self {
        Self {
            inserted_id: result
                .inserted_ids
                .get(&0)
                .cloned()
                .unwrap_or(Bson::Null),
        }
    }
}

/// The result of a [`Collection::insert_many`](crate::Collection::insert_many) operation.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct InsertManyResult {
    /// The `_id` field of the documents inserted, keyed by their index in the input.
    pub inserted_ids: HashMap<usize, Bson>,
}

impl InsertManyResult {
    pub(crate) fn new() -> Self {
        Default::default()
    }
}

/// The result of a [`Collection::update_one`](crate::Collection::update_one) or
/// [`Collection::update_many`](crate::Collection::update_many) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateResult {
    /// The number of documents that matched the filter.
    pub matched_count: u64,

    /// The number of documents that were modified by the operation.
    pub modified_count: u64,

    /// The `_id` field of the upserted document, if an upsert took place.
    pub upserted_id: Option<Bson>,
}

/// The result of a [`Collection::delete_one`](crate::Collection::delete_one) or
/// [`Collection::delete_many`](crate::Collection::delete_many) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DeleteResult {
    /// The number of documents deleted by the operation.
    pub deleted_count: u64,
}

/// The summary counts the server reports for one `bulkWrite` command.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BulkWriteSummary {
    #[serde(rename = "nInserted", default)]
    pub(crate) n_inserted: i64,

    #[serde(rename = "nMatched", default)]
    pub(crate) n_matched: i64,

    #[serde(rename = "nModified", default)]
    pub(crate) n_modified: i64,

    #[serde(rename = "nUpserted", default)]
    pub(crate) n_upserted: i64,

    #[serde(rename = "nDeleted", default)]
    pub(crate) n_deleted: i64,
}

/// The per-operation verbose result of an insert within a client bulk write.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkInsertResult {
    /// The `_id` of the inserted document.
    pub inserted_id: Bson,
}

/// The per-operation verbose result of an update or replace within a client bulk write.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkUpdateResult {
    /// The number of documents that matched the filter.
    pub matched_count: i64,

    /// The number of documents that were modified.
    pub modified_count: i64,

    /// The `_id` of the upserted document, if an upsert took place.
    pub upserted_id: Option<Bson>,
}

/// The per-operation verbose result of a delete within a client bulk write.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkDeleteResult {
    /// The number of documents deleted.
    pub deleted_count: i64,
}

/// A write concern error recorded while executing a bulk write, together with any server
/// detail document.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct BulkWriteConcernError {
    /// The error code.
    pub code: i32,

    /// A description of the error.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}
