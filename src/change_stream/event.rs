//! Types for working with change stream events.

use bson::{Bson, Document, RawDocumentBuf};

use crate::error::{Error, Result};

/// An opaque token used for resuming an interrupted change stream.
///
/// A resume token is the `_id` of a change event. Callers may persist tokens externally
/// (they are plain BSON values) and later resume a stream from one via the `resume_after`
/// or `start_after` options.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeToken(pub(crate) Bson);

impl ResumeToken {
    /// The token extracted from a change event's `_id`, or an error when the field is
    /// missing: without it the driver cannot guarantee replay semantics, so the stream is
    /// not resumable.
    pub(crate) fn from_event_document(document: &Document) -> Result<Self> {
        match document.get("_id") {
            Some(id) => Ok(Self(id.clone())),
            None => Err(Error::from(crate::error::ErrorKind::MissingResumeToken)),
        }
    }

    pub(crate) fn from_raw(raw: &RawDocumentBuf) -> Option<Self> {
        let doc: Document = raw.to_owned().try_into().ok()?;
        Some(Self(Bson::Document(doc)))
    }

    /// The token's underlying BSON value, for external persistence.
    pub fn into_bson(self) -> Bson {
        self.0
    }

    /// A token from a previously persisted BSON value.
    pub fn from_bson(bson: Bson) -> Self {
        Self(bson)
    }
}
