//! Contains the events and functionality related to monitoring changes in the topology.

use std::time::Duration;

use bson::{oid::ObjectId, Document};

use crate::{
    error::Error,
    options::ServerAddress,
    sdam::public::{ServerInfo, TopologyDescription},
};

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub previous_description: ServerDescription,

    /// The server's new description.
    pub new_description: ServerDescription,
}

/// A description of the most up-to-date information known about a server, for use in events.
#[derive(Clone, Debug)]
pub struct ServerDescription(pub(crate) crate::sdam::ServerDescription);

impl ServerDescription {
    /// A view of this description's contents.
    pub fn info(&self) -> ServerInfo {
        ServerInfo::new_borrowed(&self.0)
    }
}

/// Published when a server is added to the topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server is removed from the topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when the topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub previous_description: TopologyDescription,

    /// The topology's new description.
    pub new_description: TopologyDescription,
}

/// Published when the topology is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when the topology is shut down.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a monitor sends a heartbeat (hello) to its server.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Published when a monitor's heartbeat succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The duration of the heartbeat round trip.
    pub duration: Duration,

    /// The server's reply to the hello command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Published when a monitor's heartbeat fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The duration until the failure was detected.
    pub duration: Duration,

    /// The error that caused the heartbeat to fail.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event.
pub trait SdamEventHandler: Send + Sync {
    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// server's description changes.
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// server is added to the topology.
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// server is removed from the topology.
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever the
    /// topology description changes.
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when the
    /// topology is first opened.
    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when the
    /// topology is shut down.
    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// monitor starts a heartbeat.
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// monitor's heartbeat succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// monitor's heartbeat fails.
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}
