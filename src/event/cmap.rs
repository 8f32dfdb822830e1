//! Contains the events and functionality for monitoring the behavior of the connection pools.

use crate::options::ServerAddress;

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// The maximum number of connections the pool will hand out concurrently.
    pub max_pool_size: u32,
}

/// Event emitted when a connection pool is cleared.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections connected to.
    pub address: ServerAddress,
}

/// Event emitted when a connection is created.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The reason the connection was closed.
    pub reason: ConnectionClosedReason,
}

/// The reasons that a connection may be closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection pool has been cleared since the connection was created.
    Stale,

    /// An error occurred while using the connection.
    Error,

    /// The connection was dropped during an operation.
    Dropped,

    /// The pool that the connection belongs to has been closed.
    PoolClosed,
}

/// Event emitted when a thread begins checking out a connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server whose pool is being checked out from.
    pub address: ServerAddress,
}

/// Event emitted when checking out a connection fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server whose pool was being checked out from.
    pub address: ServerAddress,

    /// The reason the checkout failed.
    pub reason: ConnectionCheckoutFailedReason,
}

/// The reasons a connection checkout can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The operation's deadline expired before a connection became available.
    Timeout,

    /// An error occurred while trying to establish a connection.
    ConnectionError,
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is checked back into its pool.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// Applications can implement this trait to specify custom logic to run on each CMAP event.
pub trait CmapEventHandler: Send + Sync {
    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// connection pool is created.
    fn handle_pool_created_event(&self, _event: PoolCreatedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// connection pool is cleared.
    fn handle_pool_cleared_event(&self, _event: PoolClearedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// connection pool is closed.
    fn handle_pool_closed_event(&self, _event: PoolClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// connection is created.
    fn handle_connection_created_event(&self, _event: ConnectionCreatedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// connection is closed.
    fn handle_connection_closed_event(&self, _event: ConnectionClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// thread begins checking out a connection to use for an operation.
    fn handle_connection_checkout_started_event(&self, _event: ConnectionCheckoutStartedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// thread is unable to check out a connection.
    fn handle_connection_checkout_failed_event(&self, _event: ConnectionCheckoutFailedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// connection is successfully checked out.
    fn handle_connection_checked_out_event(&self, _event: ConnectionCheckedOutEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler whenever a
    /// connection is checked back into a connection pool.
    fn handle_connection_checked_in_event(&self, _event: ConnectionCheckedInEvent) {}
}
