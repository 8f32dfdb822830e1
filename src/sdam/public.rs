//! Public views of the driver's topology model.

use std::{borrow::Cow, time::Duration};

use serde::Serialize;

use crate::{options::ServerAddress, selection_criteria::TagSet};

pub use crate::sdam::description::{server::ServerType, topology::TopologyType};

/// A description of the most up-to-date information known about a server.
#[derive(Clone, Debug, Serialize)]
pub struct ServerInfo<'a> {
    #[serde(flatten)]
    description: Cow<'a, crate::sdam::ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a crate::sdam::ServerDescription) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a server check to round-trip
    /// to the server.
    ///
    /// This is the value that the driver uses internally to determine the latency window as
    /// part of server selection.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the tags associated with the server, if it is a replica set member.
    pub fn tags(&self) -> Option<&TagSet> {
        self.description.tags()
    }

    /// Gets the error that caused the server to be marked Unknown, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.description.error_message()
    }
}

/// A description of the cluster as seen in SDAM events.
#[derive(Clone, Debug)]
pub struct TopologyDescription(pub(crate) crate::sdam::description::topology::TopologyDescription);

impl TopologyDescription {
    /// The type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.0.topology_type
    }

    /// The replica set name, if one is known.
    pub fn set_name(&self) -> Option<&str> {
        self.0.set_name.as_deref()
    }

    /// How the deployment is incompatible with this driver, if it is.
    pub fn compatibility_error(&self) -> Option<&str> {
        self.0.compatibility_error.as_deref()
    }

    /// A view of each server in the topology.
    pub fn servers(&self) -> Vec<ServerInfo> {
        self.0
            .servers
            .values()
            .map(ServerInfo::new_borrowed)
            .collect()
    }
}
