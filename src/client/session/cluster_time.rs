use std::cmp::Ordering;

use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};

/// Struct modeling a cluster time reported by the server.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusterTime {
    /// The logical timestamp this cluster time corresponds to.
    pub cluster_time: Timestamp,

    /// The server's signature over the timestamp. Opaque to the driver; echoed back to the
    /// server verbatim when gossiping.
    pub(crate) signature: Document,
}

impl Eq for ClusterTime {}

impl std::hash::Hash for ClusterTime {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.cluster_time.hash(state);
    }
}

impl Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    fn cluster_time(time: u32, increment: u32) -> ClusterTime {
        ClusterTime {
            cluster_time: Timestamp { time, increment },
            signature: doc! {},
        }
    }

    #[test]
    fn ordering_compares_time_then_increment() {
        assert!(cluster_time(1, 1) < cluster_time(2, 0));
        assert!(cluster_time(1, 1) < cluster_time(1, 2));
        assert!(cluster_time(3, 0) > cluster_time(2, 9));
        assert_eq!(cluster_time(2, 2), cluster_time(2, 2));
    }
}
