pub(crate) mod conn;
mod establish;
pub(crate) mod options;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use derivative::Derivative;
use tokio::sync::Semaphore;

pub(crate) use self::{
    conn::{Command, Connection, RawCommandResponse, StreamDescription},
    establish::Handshaker,
};
use self::options::ConnectionPoolOptions;
use crate::{
    error::{Error, ErrorKind, Result},
    event::cmap::{
        CmapEventHandler,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionCreatedEvent,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolCreatedEvent,
    },
    options::ServerAddress,
    runtime,
};

/// The default maximum number of connections checked out of a pool per server.
pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// A pool of connections to a single server. All state is kept internally in an `Arc`; clones
/// share the pool.
///
/// Checked-out connections are owned exclusively by one operation; they check themselves back
/// in when dropped. Over-budget checkouts wait on the pool's semaphore until a connection is
/// returned or the operation's deadline expires.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct PoolInner {
    address: ServerAddress,
    semaphore: Arc<Semaphore>,
    available: Mutex<VecDeque<Connection>>,
    generation: AtomicU32,
    next_conn_id: AtomicU32,
    handshaker: Handshaker,
    options: ConnectionPoolOptions,
    #[derivative(Debug = "ignore")]
    event_handler: Option<Arc<dyn CmapEventHandler>>,
}

impl ConnectionPool {
    pub(crate) fn new(address: ServerAddress, options: ConnectionPoolOptions) -> Self {
        let max_pool_size = options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let event_handler = options.cmap_event_handler.clone();
        let handshaker = Handshaker::new(&options);

        let pool = Self {
            inner: Arc::new(PoolInner {
                address: address.clone(),
                semaphore: Arc::new(Semaphore::new(max_pool_size as usize)),
                available: Mutex::new(VecDeque::new()),
                generation: AtomicU32::new(0),
                next_conn_id: AtomicU32::new(1),
                handshaker,
                options,
                event_handler,
            }),
        };

        pool.emit_event(|handler| {
            handler.handle_pool_created_event(PoolCreatedEvent {
                address,
                max_pool_size,
            })
        });

        pool
    }

    fn emit_event(&self, emit: impl FnOnce(&Arc<dyn CmapEventHandler>)) {
        self.inner.emit_event(emit)
    }

    /// The current generation of the pool. Connections established under an older generation
    /// are stale and will be closed on check-in.
    pub(crate) fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Checks out a connection, establishing a new one if none are available. Waits for a
    /// checkout slot (bounded by `max_pool_size`) until `deadline`, if one is given.
    pub(crate) async fn check_out(&self, deadline: Option<Instant>) -> Result<Connection> {
        self.emit_event(|handler| {
            handler.handle_connection_checkout_started_event(ConnectionCheckoutStartedEvent {
                address: self.inner.address.clone(),
            })
        });

        let permit = match runtime::timeout_opt(
            deadline,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                self.emit_event(|handler| {
                    handler.handle_connection_checkout_failed_event(ConnectionCheckoutFailedEvent {
                        address: self.inner.address.clone(),
                        reason: ConnectionCheckoutFailedReason::Timeout,
                    })
                });
                return Err(ErrorKind::Io(Arc::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "timed out waiting for a connection to {} to become available",
                        self.inner.address
                    ),
                )))
                .into());
            }
        };

        // Prefer a pooled connection from the current generation.
        let generation = self.generation();
        let pooled = {
            let mut available = self.inner.available.lock().unwrap();
            loop {
                match available.pop_front() {
                    Some(conn) if conn.generation == generation => break Some(conn),
                    Some(stale) => {
                        self.emit_event(|handler| {
                            handler.handle_connection_closed_event(ConnectionClosedEvent {
                                address: self.inner.address.clone(),
                                connection_id: stale.id,
                                reason: ConnectionClosedReason::Stale,
                            })
                        });
                        drop(stale);
                    }
                    None => break None,
                }
            }
        };

        let mut conn = match pooled {
            Some(conn) => conn,
            None => match self.establish_connection(deadline).await {
                Ok(conn) => conn,
                Err(error) => {
                    self.emit_event(|handler| {
                        handler.handle_connection_checkout_failed_event(
                            ConnectionCheckoutFailedEvent {
                                address: self.inner.address.clone(),
                                reason: ConnectionCheckoutFailedReason::ConnectionError,
                            },
                        )
                    });
                    return Err(error);
                }
            },
        };

        conn.attach_to_pool(Arc::downgrade(&self.inner), permit);
        self.emit_event(|handler| {
            handler.handle_connection_checked_out_event(ConnectionCheckedOutEvent {
                address: self.inner.address.clone(),
                connection_id: conn.id,
            })
        });
        Ok(conn)
    }

    async fn establish_connection(&self, deadline: Option<Instant>) -> Result<Connection> {
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let generation = self.generation();
        let stream = runtime::timeout_opt(
            deadline,
            self.inner.options.stream_connector.connect(
                self.inner.address.clone(),
                self.inner.options.connect_timeout,
            ),
        )
        .await??;

        let mut conn = Connection::new(
            id,
            self.inner.address.clone(),
            generation,
            stream,
            self.inner.options.connect_timeout,
        );
        self.emit_event(|handler| {
            handler.handle_connection_created_event(ConnectionCreatedEvent {
                address: self.inner.address.clone(),
                connection_id: id,
            })
        });

        self.inner.handshaker.handshake(&mut conn).await?;
        Ok(conn)
    }

    /// Increments the generation of the pool, closing all idle connections and flagging
    /// checked-out connections as stale so they are closed on check-in.
    pub(crate) fn clear(&self, _cause: &Error) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let drained: Vec<Connection> = {
            let mut available = self.inner.available.lock().unwrap();
            available.drain(..).collect()
        };
        for conn in drained {
            self.emit_event(|handler| {
                handler.handle_connection_closed_event(ConnectionClosedEvent {
                    address: self.inner.address.clone(),
                    connection_id: conn.id,
                    reason: ConnectionClosedReason::Stale,
                })
            });
        }
        self.emit_event(|handler| {
            handler.handle_pool_cleared_event(PoolClearedEvent {
                address: self.inner.address.clone(),
            })
        });
    }

    /// Closes the pool, dropping all idle connections.
    pub(crate) fn close(&self) {
        let drained: Vec<Connection> = {
            let mut available = self.inner.available.lock().unwrap();
            available.drain(..).collect()
        };
        for conn in drained {
            self.emit_event(|handler| {
                handler.handle_connection_closed_event(ConnectionClosedEvent {
                    address: self.inner.address.clone(),
                    connection_id: conn.id,
                    reason: ConnectionClosedReason::PoolClosed,
                })
            });
        }
        self.emit_event(|handler| {
            handler.handle_pool_closed_event(PoolClosedEvent {
                address: self.inner.address.clone(),
            })
        });
    }

    #[cfg(test)]
    pub(crate) fn available_len(&self) -> usize {
        self.inner.available.lock().unwrap().len()
    }
}

impl PoolInner {
    fn emit_event(&self, emit: impl FnOnce(&Arc<dyn CmapEventHandler>)) {
        if let Some(ref handler) = self.event_handler {
            emit(handler);
        }
    }
}

/// Returns a connection to its pool. Called from `Connection::drop`.
pub(crate) fn check_in(pool: &Arc<PoolInner>, conn: Connection) {
    pool.emit_event(|handler| {
        handler.handle_connection_checked_in_event(ConnectionCheckedInEvent {
            address: pool.address.clone(),
            connection_id: conn.id,
        })
    });

    let current_generation = pool.generation.load(Ordering::SeqCst);
    if conn.has_errored() || conn.generation != current_generation {
        let reason = if conn.has_errored() {
            ConnectionClosedReason::Error
        } else {
            ConnectionClosedReason::Stale
        };
        pool.emit_event(|handler| {
            handler.handle_connection_closed_event(ConnectionClosedEvent {
                address: pool.address.clone(),
                connection_id: conn.id,
                reason,
            })
        });
        return;
    }

    pool.available.lock().unwrap().push_back(conn);
}
