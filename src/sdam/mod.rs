pub(crate) mod description;
pub(crate) mod monitor;
pub mod public;
mod server;
mod topology;

pub(crate) use self::{
    description::{
        server::{ServerDescription, ServerType, TopologyVersion},
        topology::{
            server_selection, SessionSupportStatus, TopologyType, TransactionSupportStatus,
        },
    },
    server::{SelectedServer, Server},
    topology::{HandshakePhase, Topology, TopologyUpdater, TopologyWatcher},
};
