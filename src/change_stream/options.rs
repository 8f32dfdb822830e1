//! Options for change stream creation.

use std::time::Duration;

use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{concern::ReadConcern, selection_criteria::SelectionCriteria};

/// These are the valid options for creating a [`ChangeStream`](crate::ChangeStream) with
/// [`Client::watch`](crate::Client::watch),
/// [`Database::watch`](crate::Database::watch), or
/// [`Collection::watch`](crate::Collection::watch).
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeStreamOptions {
    /// Configures how the `fullDocument` field of change events is populated.
    pub full_document: Option<FullDocumentType>,

    /// Specifies the logical starting point for the new change stream. The stream will
    /// deliver the first notification after the event carrying this token.
    pub resume_after: Option<Document>,

    /// Takes a resume token and starts a new change stream returning the first
    /// notification after the token. Unlike `resumeAfter`, this allows watching
    /// collections that have been dropped and recreated.
    ///
    /// The server reports an error if both `startAfter` and `resumeAfter` are specified.
    pub start_after: Option<Document>,

    /// The change stream will only provide changes that occurred at or after the specified
    /// timestamp.
    pub start_at_operation_time: Option<Timestamp>,

    /// The maximum amount of time for the server to wait on new documents to satisfy a
    /// change stream query.
    #[serde(skip)]
    pub max_await_time: Option<Duration>,

    /// The number of documents to return per batch.
    #[serde(skip)]
    pub batch_size: Option<u32>,

    /// Specifies a collation.
    #[serde(skip)]
    pub collation: Option<Document>,

    /// The read concern for the initial aggregation. Change streams require "majority" or
    /// no read concern.
    #[serde(skip)]
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for the initial aggregation and any resumes.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// Set when the stream watches an entire deployment.
    #[serde(rename = "allChangesForCluster")]
    pub(crate) all_changes_for_cluster: Option<bool>,
}

/// Describes the modes for configuring the `fullDocument` field of change stream events.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum FullDocumentType {
    /// The event includes a copy of the entire changed document from some point in time
    /// after the change.
    UpdateLookup,

    /// The event includes a post-image of the modified document.
    WhenAvailable,

    /// Same as `WhenAvailable`, but the server raises an error if the post-image is not
    /// available.
    Required,
}
