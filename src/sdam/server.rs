use std::sync::Arc;

use crate::{
    cmap::{options::ConnectionPoolOptions, ConnectionPool},
    options::{ClientOptions, ServerAddress},
};

/// Contains the state for a given server in the topology: its address and the pool of
/// connections the driver holds to it.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,
    pub(crate) pool: ConnectionPool,
}

impl Server {
    pub(crate) fn new(address: ServerAddress, options: &ClientOptions) -> Arc<Self> {
        Arc::new(Self {
            pool: ConnectionPool::new(
                address.clone(),
                ConnectionPoolOptions::from_client_options(options),
            ),
            address,
        })
    }
}

/// A server selected for an operation. Holding it keeps the server's pool alive even if the
/// topology drops the server mid-operation.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    pub(crate) fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.server.address
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.server.pool
    }
}
