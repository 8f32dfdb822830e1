//! Criteria for selecting the server on which an operation runs.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    sdam::public::ServerInfo,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadPreference(read_pref) => write!(f, "ReadPreference({:?})", read_pref),
            Self::Predicate(..) => write!(f, "Predicate"),
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

/// A predicate used to filter servers.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver routes read operations among the members of a replica set or
/// sharded cluster.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Specifications for the server suitable to handle the operation.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    PrimaryPreferred {
        /// Specifications for the server suitable to handle the operation.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        /// Specifications for the server suitable to handle the operation.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the node with the least network latency regardless of whether it's
    /// the primary or a secondary.
    Nearest {
        /// Specifications for the server suitable to handle the operation.
        options: ReadPreferenceOptions,
    },
}

/// Specifies read preference options for non-primary read preferences.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set will
    /// be checked in order until one or more servers is found with each tag in the set.
    #[serde(rename = "tags")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation.
    ///
    /// If no `max_staleness` is specified, there is no maximum lag.
    #[serde(default)]
    pub max_staleness: Option<Duration>,
}

impl ReadPreference {
    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { ref options }
            | ReadPreference::PrimaryPreferred { ref options }
            | ReadPreference::SecondaryPreferred { ref options }
            | ReadPreference::Nearest { ref options } => options.max_staleness,
        }
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { ref options }
            | ReadPreference::PrimaryPreferred { ref options }
            | ReadPreference::SecondaryPreferred { ref options }
            | ReadPreference::Nearest { ref options } => options.tag_sets.as_ref(),
        }
    }

    /// Creates a `ReadPreference::Secondary` with default options.
    pub fn secondary() -> Self {
        ReadPreference::Secondary {
            options: Default::default(),
        }
    }

    /// Creates a `ReadPreference::SecondaryPreferred` with default options.
    pub fn secondary_preferred() -> Self {
        ReadPreference::SecondaryPreferred {
            options: Default::default(),
        }
    }

    /// Creates a `ReadPreference::Nearest` with default options.
    pub fn nearest() -> Self {
        ReadPreference::Nearest {
            options: Default::default(),
        }
    }

    /// Replaces the tag sets of this read preference. Returns an error for
    /// `ReadPreference::Primary`, which does not accept tag sets.
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(Error::invalid_argument(
                    "read preference tags can only be specified when a non-primary mode is \
                     specified",
                ));
            }
            ReadPreference::Secondary { ref mut options } => options,
            ReadPreference::PrimaryPreferred { ref mut options } => options,
            ReadPreference::SecondaryPreferred { ref mut options } => options,
            ReadPreference::Nearest { ref mut options } => options,
        };

        options.tag_sets = Some(tag_sets);
        Ok(self)
    }

    pub(crate) fn mode_str(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
            ReadPreference::Secondary { .. } => "secondary",
            ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
            ReadPreference::Nearest { .. } => "nearest",
        }
    }

    /// The document form appended to commands as `$readPreference`.
    pub(crate) fn to_document(&self) -> Result<Document> {
        let mut doc = doc! { "mode": self.mode_str() };

        if let Some(tag_sets) = self.tag_sets() {
            let tags: Vec<Bson> = tag_sets
                .iter()
                .map(|tag_set| {
                    Bson::Document(tag_set.iter().map(|(k, v)| (k.clone(), v.into())).collect())
                })
                .collect();
            doc.insert("tags", tags);
        }

        if let Some(max_staleness) = self.max_staleness() {
            doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
        }

        Ok(doc)
    }
}

/// A read preference tag set. See the documentation
/// [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/) for more
/// details.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primary_rejects_tags() {
        assert!(ReadPreference::Primary
            .with_tags(vec![Default::default()])
            .is_err());
    }

    #[test]
    fn document_form_includes_mode_and_tags() {
        let mut tags = TagSet::new();
        tags.insert("dc".to_string(), "east".to_string());
        let pref = ReadPreference::secondary().with_tags(vec![tags]).unwrap();
        let doc = pref.to_document().unwrap();
        assert_eq!(doc.get_str("mode").unwrap(), "secondary");
        assert_eq!(
            doc.get_array("tags").unwrap()[0],
            Bson::Document(doc! { "dc": "east" })
        );
    }
}
