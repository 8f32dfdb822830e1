use bson::{doc, Bson, Document};
use serde::Serialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson_util,
    error::Result,
    Namespace,
};

/// The type of write a [`WriteModel`] performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OperationType {
    Insert,
    Update,
    Delete,
}

/// A single write to be performed as part of a client-level bulk write.
///
/// Each model names its own namespace; one bulk write may touch any number of
/// collections across any number of databases.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteModel {
    /// Insert one document.
    InsertOne(InsertOneModel),

    /// Update at most one matching document.
    UpdateOne(UpdateOneModel),

    /// Update all matching documents.
    UpdateMany(UpdateManyModel),

    /// Replace at most one matching document.
    ReplaceOne(ReplaceOneModel),

    /// Delete at most one matching document.
    DeleteOne(DeleteOneModel),

    /// Delete all matching documents.
    DeleteMany(DeleteManyModel),
}

/// Inserts a single document as part of a bulk write.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct InsertOneModel {
    /// The namespace the document is inserted into.
    pub namespace: Namespace,

    /// The document to insert.
    pub document: Document,
}

/// Updates at most one document matching a filter as part of a bulk write.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct UpdateOneModel {
    /// The namespace of the documents to update.
    #[serde(skip)]
    #[builder(!default)]
    pub namespace: Namespace,

    /// The filter determining which document is updated.
    #[builder(!default)]
    pub filter: Document,

    /// The update to apply; must contain only `$`-prefixed update operators.
    #[serde(rename = "updateMods")]
    #[builder(!default)]
    pub update: Document,

    /// A set of filters specifying to which array elements the update applies.
    pub array_filters: Option<Vec<Document>>,

    /// The collation to use.
    pub collation: Option<Document>,

    /// The index to use to support the query predicate.
    pub hint: Option<Bson>,

    /// Whether a new document should be created if no document matches the filter.
    pub upsert: Option<bool>,
}

/// Updates all documents matching a filter as part of a bulk write.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct UpdateManyModel {
    /// The namespace of the documents to update.
    #[serde(skip)]
    #[builder(!default)]
    pub namespace: Namespace,

    /// The filter determining which documents are updated.
    #[builder(!default)]
    pub filter: Document,

    /// The update to apply; must contain only `$`-prefixed update operators.
    #[serde(rename = "updateMods")]
    #[builder(!default)]
    pub update: Document,

    /// A set of filters specifying to which array elements the update applies.
    pub array_filters: Option<Vec<Document>>,

    /// The collation to use.
    pub collation: Option<Document>,

    /// The index to use to support the query predicate.
    pub hint: Option<Bson>,

    /// Whether a new document should be created if no document matches the filter.
    pub upsert: Option<bool>,
}

/// Replaces at most one document matching a filter as part of a bulk write.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ReplaceOneModel {
    /// The namespace of the document to replace.
    #[serde(skip)]
    #[builder(!default)]
    pub namespace: Namespace,

    /// The filter determining which document is replaced.
    #[builder(!default)]
    pub filter: Document,

    /// The replacement document; must not contain update operators.
    #[serde(rename = "updateMods")]
    #[builder(!default)]
    pub replacement: Document,

    /// The collation to use.
    pub collation: Option<Document>,

    /// The index to use to support the query predicate.
    pub hint: Option<Bson>,

    /// Whether a new document should be created if no document matches the filter.
    pub upsert: Option<bool>,
}

/// Deletes at most one document matching a filter as part of a bulk write.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DeleteOneModel {
    /// The namespace of the document to delete.
    #[serde(skip)]
    #[builder(!default)]
    pub namespace: Namespace,

    /// The filter determining which document is deleted.
    #[builder(!default)]
    pub filter: Document,

    /// The collation to use.
    pub collation: Option<Document>,

    /// The index to use to support the query predicate.
    pub hint: Option<Bson>,
}

/// Deletes all documents matching a filter as part of a bulk write.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DeleteManyModel {
    /// The namespace of the documents to delete.
    #[serde(skip)]
    #[builder(!default)]
    pub namespace: Namespace,

    /// The filter determining which documents are deleted.
    #[builder(!default)]
    pub filter: Document,

    /// The collation to use.
    pub collation: Option<Document>,

    /// The index to use to support the query predicate.
    pub hint: Option<Bson>,
}

impl WriteModel {
    /// The namespace this write targets.
    pub fn namespace(&self) -> &Namespace {
        match self {
            WriteModel::InsertOne(model) => &model.namespace,
            WriteModel::UpdateOne(model) => &model.namespace,
            WriteModel::UpdateMany(model) => &model.namespace,
            WriteModel::ReplaceOne(model) => &model.namespace,
            WriteModel::DeleteOne(model) => &model.namespace,
            WriteModel::DeleteMany(model) => &model.namespace,
        }
    }

    pub(crate) fn operation_type(&self) -> OperationType {
        match self {
            WriteModel::InsertOne(_) => OperationType::Insert,
            WriteModel::UpdateOne(_) | WriteModel::UpdateMany(_) | WriteModel::ReplaceOne(_) => {
                OperationType::Update
            }
            WriteModel::DeleteOne(_) | WriteModel::DeleteMany(_) => OperationType::Delete,
        }
    }

    /// Whether this write can affect multiple documents, which disqualifies the containing
    /// bulk write from being retried.
    pub(crate) fn multi(&self) -> bool {
        matches!(self, WriteModel::UpdateMany(_) | WriteModel::DeleteMany(_))
    }

    /// Validates the model's user-supplied documents at append time, so malformed models
    /// are rejected before anything is sent.
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            WriteModel::UpdateOne(model) => bson_util::update_document_check(&model.update),
            WriteModel::UpdateMany(model) => bson_util::update_document_check(&model.update),
            WriteModel::ReplaceOne(model) => {
                bson_util::replacement_document_check(&model.replacement)
            }
            _ => Ok(()),
        }
    }

    /// The name of the field the op document starts with, identifying the op kind to the
    /// server.
    pub(crate) fn operation_name(&self) -> &'static str {
        match self.operation_type() {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    /// Builds the document sent in the `ops` payload for this model, rewriting the
    /// namespace to `ns_index` (the position of this model's namespace in the batch's
    /// nsInfo sequence). For inserts lacking an `_id`, a freshly generated `ObjectId` is
    /// prepended and returned so the result can report it without re-reading the document.
    pub(crate) fn get_ops_document(&self, ns_index: usize) -> Result<(Document, Option<Bson>)> {
        let ns_index = ns_index as i32;
        match self {
            WriteModel::InsertOne(model) => {
                let mut document = model.document.clone();
                let inserted_id = crate::operation::get_or_prepend_id_field(&mut document)?;
                let op = doc! {
                    self.operation_name(): ns_index,
                    "document": document,
                };
                Ok((op, Some(inserted_id)))
            }
            WriteModel::UpdateOne(_)
            | WriteModel::UpdateMany(_)
            | WriteModel::ReplaceOne(_)
            | WriteModel::DeleteOne(_)
            | WriteModel::DeleteMany(_) => {
                let mut op = doc! { self.operation_name(): ns_index };
                let fields = match self {
                    WriteModel::UpdateOne(model) => bson::to_document(model)?,
                    WriteModel::UpdateMany(model) => bson::to_document(model)?,
                    WriteModel::ReplaceOne(model) => bson::to_document(model)?,
                    WriteModel::DeleteOne(model) => bson::to_document(model)?,
                    WriteModel::DeleteMany(model) => bson::to_document(model)?,
                    WriteModel::InsertOne(_) => unreachable!(),
                };
                op.extend(fields);
                op.insert("multi", self.multi());
                Ok((op, None))
            }
        }
    }
}
