use std::time::Duration;

use crate::{hello::HelloReply, options::ServerAddress, sdam::ServerType};

/// Contains the negotiated limits and capabilities of an established connection, taken from
/// the hello handshake reply.
#[derive(Debug, Clone)]
pub(crate) struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// How long sessions started on this server will stay alive without use, as advertised in
    /// the handshake. Servers that do not support sessions leave this unset.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The maximum size of a BSON document the server accepts.
    pub(crate) max_bson_object_size: i64,

    /// The maximum size of a wire protocol message the server accepts.
    pub(crate) max_message_size_bytes: i32,

    /// The maximum number of write operations the server accepts in one batch.
    pub(crate) max_write_batch_size: i64,

    /// The shortest round trip time observed for this connection's hello exchange.
    #[allow(dead_code)]
    pub(crate) round_trip_time: Option<Duration>,

    /// The `serviceId` advertised by a load balancer backend, if any.
    #[allow(dead_code)]
    pub(crate) service_id: Option<bson::oid::ObjectId>,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a hello reply.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: reply.command_response.server_type(),
            max_wire_version: reply.command_response.max_wire_version,
            min_wire_version: reply.command_response.min_wire_version,
            logical_session_timeout: reply
                .command_response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
            max_bson_object_size: reply.command_response.max_bson_object_size,
            max_message_size_bytes: reply.command_response.max_message_size_bytes,
            max_write_batch_size: reply
                .command_response
                .max_write_batch_size
                .unwrap_or(100_000),
            round_trip_time: None,
            service_id: reply.command_response.service_id,
        }
    }

    /// Whether this connection supports sessions, and by extension retryable writes.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.initial_server_type != ServerType::Standalone
            && self.logical_session_timeout.is_some()
            && self.max_wire_version.map_or(false, |version| version >= 6)
    }

    /// A stream description for testing purposes, with limits matching a modern mongod.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self {
            server_address: Default::default(),
            initial_server_type: ServerType::RsPrimary,
            max_wire_version: Some(17),
            min_wire_version: Some(0),
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            max_bson_object_size: 16 * 1024 * 1024,
            max_message_size_bytes: 48 * 1024 * 1024,
            max_write_batch_size: 100_000,
            round_trip_time: None,
            service_id: None,
        }
    }
}
