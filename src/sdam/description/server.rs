use std::time::Duration;

use bson::{oid::ObjectId, serde_helpers, DateTime};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

const DRIVER_MIN_DB_VERSION: &str = "3.6";
const DRIVER_MIN_WIRE_VERSION: i32 = 6;
const DRIVER_MAX_WIRE_VERSION: i32 = 21;

/// The possible types for a server.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, standalone server.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A load balancer.
    LoadBalancer,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

impl Default for ServerType {
    fn default() -> Self {
        ServerType::Unknown
    }
}

/// A monotonic identifier the server attaches to its hello replies, used to discard stale
/// monitor updates that arrive out of order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    /// An identifier for the server process.
    pub process_id: ObjectId,

    /// A monotonically increasing counter, reset when `process_id` changes.
    pub counter: i64,
}

impl TopologyVersion {
    /// Whether a reply carrying `other` is stale relative to this version.
    pub(crate) fn is_more_recent_than(&self, existing: TopologyVersion) -> bool {
        self.process_id != existing.process_id || self.counter > existing.counter
    }
}

impl From<TopologyVersion> for bson::Bson {
    fn from(version: TopologyVersion) -> Self {
        bson::bson!({
            "processId": version.process_id,
            "counter": version.counter,
        })
    }
}

/// A description of the most up-to-date information known about a server, built from the
/// latest hello reply (or the error that took its place).
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server's description was updated.
    #[serde(serialize_with = "serde_helpers::serialize_bson_datetime_as_rfc3339_string")]
    pub(crate) last_update_time: DateTime,

    /// The average duration of this server's hello calls.
    pub(crate) average_round_trip_time: Option<Duration>,

    /// The last hello reply seen from this server, or the error string that marked it
    /// Unknown. Errors are kept as strings so descriptions stay cheap immutable values.
    #[serde(skip)]
    pub(crate) reply: std::result::Result<Option<HelloReply>, String>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }
        match (&self.reply, &other.reply) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.command_response);
                let other_response = other_reply.as_ref().map(|r| &r.command_response);
                // Compare serialized forms; HelloCommandResponse isn't Eq because of
                // floating-point fields.
                bson::to_document(&self_response).ok() == bson::to_document(&other_response).ok()
            }
            (Err(self_err), Err(other_err)) => self_err == other_err,
            _ => false,
        }
    }
}

impl ServerDescription {
    /// A description for a server the driver has not yet contacted.
    pub(crate) fn new(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            last_update_time: DateTime::now(),
            average_round_trip_time: None,
            reply: Ok(None),
        }
    }

    /// A description built from a successful hello reply.
    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        let server_type = reply.command_response.server_type();

        // Normalize all address fields to lowercase per the SDAM spec, so host list
        // comparisons are consistent.
        reply.command_response.me = reply.command_response.me.map(|me| me.to_lowercase());
        for hosts in [
            reply.command_response.hosts.as_mut(),
            reply.command_response.passives.as_mut(),
            reply.command_response.arbiters.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            for host in hosts.iter_mut() {
                *host = host.to_lowercase();
            }
        }

        Self {
            address,
            server_type,
            last_update_time: DateTime::now(),
            average_round_trip_time: Some(average_rtt),
            reply: Ok(Some(reply)),
        }
    }

    /// A description for a server whose last check failed.
    pub(crate) fn new_from_error(address: ServerAddress, error: &Error) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            last_update_time: DateTime::now(),
            average_round_trip_time: None,
            reply: Err(error.to_string()),
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    /// The error that marked this server Unknown, if any.
    pub(crate) fn error_message(&self) -> Option<&str> {
        self.reply.as_ref().err().map(String::as_str)
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);
            if max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this version of the driver \
                     requires at least {} (MongoDB {})",
                    self.address, max_wire_version, DRIVER_MIN_WIRE_VERSION, DRIVER_MIN_DB_VERSION,
                ));
            }
            let min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);
            if min_wire_version > DRIVER_MAX_WIRE_VERSION {
                return Some(format!(
                    "Server at {} requires wire version {}, but this version of the driver only \
                     supports up to {}",
                    self.address, min_wire_version, DRIVER_MAX_WIRE_VERSION,
                ));
            }
        }
        None
    }

    pub(crate) fn set_name(&self) -> Option<&str> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.set_name.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let mut hosts = Vec::new();
        if let Ok(Some(ref reply)) = self.reply {
            for host_list in [
                reply.command_response.hosts.as_ref(),
                reply.command_response.passives.as_ref(),
                reply.command_response.arbiters.as_ref(),
            ]
            .into_iter()
            .flatten()
            {
                for host in host_list {
                    hosts.push(ServerAddress::parse(host)?);
                }
            }
        }
        Ok(hosts)
    }

    pub(crate) fn me(&self) -> Option<&str> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.me.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn primary(&self) -> Option<&str> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.primary.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn set_version(&self) -> Option<i32> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.set_version,
            _ => None,
        }
    }

    pub(crate) fn election_id(&self) -> Option<ObjectId> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.election_id,
            _ => None,
        }
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.topology_version,
            _ => None,
        }
    }

    pub(crate) fn last_write_date(&self) -> Option<DateTime> {
        match self.reply {
            Ok(Some(ref reply)) => reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date),
            _ => None,
        }
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        match self.reply {
            Ok(Some(ref reply)) => reply
                .command_response
                .logical_session_timeout_minutes
                .map(|timeout| Duration::from_secs(timeout as u64 * 60)),
            _ => None,
        }
    }

    pub(crate) fn max_wire_version(&self) -> Option<i32> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.max_wire_version,
            _ => None,
        }
    }

    pub(crate) fn min_wire_version(&self) -> Option<i32> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.min_wire_version,
            _ => None,
        }
    }

    pub(crate) fn max_bson_object_size(&self) -> Option<i64> {
        match self.reply {
            Ok(Some(ref reply)) => Some(reply.command_response.max_bson_object_size),
            _ => None,
        }
    }

    pub(crate) fn max_message_size_bytes(&self) -> Option<i32> {
        match self.reply {
            Ok(Some(ref reply)) => Some(reply.command_response.max_message_size_bytes),
            _ => None,
        }
    }

    pub(crate) fn max_write_batch_size(&self) -> Option<i64> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.max_write_batch_size,
            _ => None,
        }
    }

    pub(crate) fn tags(&self) -> Option<&TagSet> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.tags.as_ref(),
            _ => None,
        }
    }

    /// Whether all tags in `tag_set` equal this server's corresponding tags.
    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags() {
            Some(tags) => tags,
            None => return tag_set.is_empty(),
        };
        tag_set
            .iter()
            .all(|(key, value)| server_tags.get(key) == Some(value))
    }
}
