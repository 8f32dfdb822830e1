use bson::oid::ObjectId;

use crate::event::{
    command::{
        CommandEventHandler,
        CommandFailedEvent,
        CommandStartedEvent,
        CommandSucceededEvent,
    },
    sdam::{
        SdamEventHandler,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
};

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_core::command";
pub(crate) const SDAM_TRACING_EVENT_TARGET: &str = "mongodb_core::sdam";
pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

/// Emits tracing events at debug level for every command event. Always registered; the
/// events are no-ops unless a subscriber enables the target.
pub(crate) struct CommandTracingEventEmitter {
    max_document_length_bytes: usize,
}

impl CommandTracingEventEmitter {
    pub(crate) fn new() -> CommandTracingEventEmitter {
        CommandTracingEventEmitter {
            max_document_length_bytes: DEFAULT_MAX_DOCUMENT_LENGTH_BYTES,
        }
    }
}

impl CommandEventHandler for CommandTracingEventEmitter {
    fn handle_command_started_event(&self, event: CommandStartedEvent) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command = serialize_command_or_reply(event.command, self.max_document_length_bytes).as_str(),
            database_name = event.db.as_str(),
            command_name = event.command_name.as_str(),
            request_id = event.request_id,
            driver_connection_id = event.connection.id,
            server_host = event.connection.address.host(),
            server_port = event.connection.address.port(),
            "Command started"
        );
    }

    fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            reply = serialize_command_or_reply(event.reply, self.max_document_length_bytes).as_str(),
            command_name = event.command_name.as_str(),
            request_id = event.request_id,
            driver_connection_id = event.connection.id,
            server_host = event.connection.address.host(),
            server_port = event.connection.address.port(),
            duration_ms = event.duration.as_millis() as u64,
            "Command succeeded"
        );
    }

    fn handle_command_failed_event(&self, event: CommandFailedEvent) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            failure = event.failure.tracing_representation().as_str(),
            command_name = event.command_name.as_str(),
            request_id = event.request_id,
            driver_connection_id = event.connection.id,
            server_host = event.connection.address.host(),
            server_port = event.connection.address.port(),
            duration_ms = event.duration.as_millis() as u64,
            "Command failed"
        );
    }
}

/// Emits tracing events at debug level for every SDAM event.
pub(crate) struct SdamTracingEventEmitter {
    topology_id: ObjectId,
}

impl SdamTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId) -> SdamTracingEventEmitter {
        SdamTracingEventEmitter { topology_id }
    }

    fn topology_id(&self) -> String {
        self.topology_id.to_hex()
    }
}

impl SdamEventHandler for SdamTracingEventEmitter {
    fn handle_server_description_changed_event(&self, event: ServerDescriptionChangedEvent) {
        tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = self.topology_id().as_str(),
            server_host = event.address.host(),
            server_port = event.address.port(),
            previous_type = format!("{:?}", event.previous_description.info().server_type()).as_str(),
            new_type = format!("{:?}", event.new_description.info().server_type()).as_str(),
            "Server description changed"
        );
    }

    fn handle_server_opening_event(&self, event: ServerOpeningEvent) {
        tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = self.topology_id().as_str(),
            server_host = event.address.host(),
            server_port = event.address.port(),
            "Starting server monitoring"
        );
    }

    fn handle_server_closed_event(&self, event: ServerClosedEvent) {
        tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = self.topology_id().as_str(),
            server_host = event.address.host(),
            server_port = event.address.port(),
            "Stopped server monitoring"
        );
    }

    fn handle_topology_description_changed_event(&self, event: TopologyDescriptionChangedEvent) {
        tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = self.topology_id().as_str(),
            previous_type = format!("{:?}", event.previous_description.topology_type()).as_str(),
            new_type = format!("{:?}", event.new_description.topology_type()).as_str(),
            "Topology description changed"
        );
    }

    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {
        tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = self.topology_id().as_str(),
            "Starting topology monitoring"
        );
    }

    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {
        tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = self.topology_id().as_str(),
            "Stopped topology monitoring"
        );
    }

    fn handle_server_heartbeat_started_event(&self, event: ServerHeartbeatStartedEvent) {
        tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = self.topology_id().as_str(),
            server_host = event.server_address.host(),
            server_port = event.server_address.port(),
            "Server heartbeat started"
        );
    }

    fn handle_server_heartbeat_succeeded_event(&self, event: ServerHeartbeatSucceededEvent) {
        tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = self.topology_id().as_str(),
            server_host = event.server_address.host(),
            server_port = event.server_address.port(),
            duration_ms = event.duration.as_millis() as u64,
            reply = serialize_command_or_reply(event.reply, DEFAULT_MAX_DOCUMENT_LENGTH_BYTES).as_str(),
            "Server heartbeat succeeded"
        );
    }

    fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
        tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = self.topology_id().as_str(),
            server_host = event.server_address.host(),
            server_port = event.server_address.port(),
            duration_ms = event.duration.as_millis() as u64,
            failure = event.failure.tracing_representation().as_str(),
            "Server heartbeat failed"
        );
    }
}

trait TracingRepresentation {
    fn tracing_representation(&self) -> String;
}

impl TracingRepresentation for crate::error::Error {
    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

fn serialize_command_or_reply(doc: bson::Document, max_length_bytes: usize) -> String {
    let mut ext_json = bson::Bson::Document(doc).into_canonical_extjson().to_string();
    truncate_on_char_boundary(&mut ext_json, max_length_bytes);
    ext_json
}

/// Truncates the given string at the closest UTF-8 character boundary >= the provided
/// length. If the new length is >= the current length, does nothing.
pub(crate) fn truncate_on_char_boundary(s: &mut String, new_len: usize) {
    if s.len() > new_len {
        // to avoid generating invalid UTF-8, find the first index >= max_length_bytes that
        // is the end of a character.
        let mut truncate_index = new_len;
        // is_char_boundary returns true when the provided value == the length of the
        // string, so if we reach the end of the string this loop will terminate.
        while !s.is_char_boundary(truncate_index) {
            truncate_index += 1;
        }
        s.truncate(truncate_index);
    }
}

#[cfg(test)]
mod test {
    use super::truncate_on_char_boundary;

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = "heck".to_string();
        truncate_on_char_boundary(&mut s, 2);
        assert_eq!(s, "he");

        // a multi-byte character straddling the boundary is kept whole
        let mut s = "héck".to_string();
        truncate_on_char_boundary(&mut s, 2);
        assert_eq!(s, "hé");

        let mut s = "ok".to_string();
        truncate_on_char_boundary(&mut s, 10);
        assert_eq!(s, "ok");
    }
}
