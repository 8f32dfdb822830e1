mod command;
mod stream_description;
pub(crate) mod wire;

use std::{sync::Weak, time::Duration};

use derivative::Derivative;
use tokio::sync::OwnedSemaphorePermit;

pub(crate) use self::{
    command::{Command, RawCommandResponse},
    stream_description::StreamDescription,
    wire::next_request_id,
};
use self::wire::Message;
use crate::{
    error::{Error, Result},
    event::command::ConnectionInfo,
    options::ServerAddress,
    runtime::AsyncStream,
};

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use self::wire::Compressor;

/// A wrapper around a single TCP-level stream to a server. A `Connection` is owned exclusively
/// for the duration of a single operation; pooled connections return themselves to the pool
/// when dropped.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct Connection {
    /// Driver-generated id, unique per pool.
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    /// The pool generation this connection was established under. Connections whose
    /// generation is behind the pool's are stale and are closed on check-in.
    pub(crate) generation: u32,

    #[derivative(Debug = "ignore")]
    stream: AsyncStream,

    stream_description: Option<StreamDescription>,

    /// Set when an error occurs while this connection is in use. Errored connections are
    /// discarded rather than returned to the pool.
    error: bool,

    /// Bound on individual socket reads and writes.
    io_timeout: Option<Duration>,

    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    pub(crate) compressor: Option<Compressor>,

    /// Present on pooled connections; dropping the permit frees a checkout slot.
    #[derivative(Debug = "ignore")]
    permit: Option<OwnedSemaphorePermit>,

    /// Back-reference used to return this connection to its pool on drop.
    #[derivative(Debug = "ignore")]
    pub(super) pool: Option<Weak<super::PoolInner>>,
}

impl Connection {
    pub(crate) fn new(
        id: u32,
        address: ServerAddress,
        generation: u32,
        stream: AsyncStream,
        io_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            address,
            generation,
            stream,
            stream_description: None,
            error: false,
            io_timeout,
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressor: None,
            permit: None,
            pool: None,
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The description of this connection's stream, populated during the handshake.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            Error::internal("stream description not available on unestablished connection")
        })
    }

    pub(crate) fn set_stream_description(&mut self, description: StreamDescription) {
        self.stream_description = Some(description);
    }

    pub(super) fn attach_to_pool(
        &mut self,
        pool: Weak<super::PoolInner>,
        permit: OwnedSemaphorePermit,
    ) {
        self.pool = Some(pool);
        self.permit = Some(permit);
    }

    pub(crate) fn has_errored(&self) -> bool {
        self.error
    }

    /// Sends a command over this connection and reads the reply.
    ///
    /// The I/O is bounded by this connection's timeout; a timeout or any other I/O failure
    /// marks the connection errored so it will not be reused.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<RawCommandResponse> {
        let request_id = request_id.into().unwrap_or_else(next_request_id);

        #[cfg(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        ))]
        let compressor = if command.should_compress() {
            self.compressor.clone()
        } else {
            None
        };

        let message = command.into_message()?;
        let result = self.send_message(message, request_id, {
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            {
                compressor
            }
            #[cfg(not(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            )))]
            {
                None
            }
        })
        .await;
        if result.is_err() {
            self.error = true;
        }
        result
    }

    async fn send_message(
        &mut self,
        message: Message,
        request_id: i32,
        #[cfg(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        ))]
        compressor: Option<Compressor>,
        #[cfg(not(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        )))]
        compressor: Option<()>,
    ) -> Result<RawCommandResponse> {
        let max_message_size = self
            .stream_description
            .as_ref()
            .map(|sd| sd.max_message_size_bytes);
        let stream = &mut self.stream;

        let io = async move {
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            match compressor {
                Some(ref compressor) => {
                    message
                        .write_compressed_to(stream, compressor, request_id)
                        .await?
                }
                None => message.write_to(stream, request_id).await?,
            }

            #[cfg(not(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            )))]
            {
                let _ = compressor;
                message.write_to(stream, request_id).await?;
            }

            Message::read_from(stream, max_message_size).await
        };

        let reply = match self.io_timeout {
            Some(timeout) => crate::runtime::timeout(timeout, io).await??,
            None => io.await?,
        };

        if reply.response_to != request_id {
            return Err(Error::invalid_response(format!(
                "expected a response to request {} but got a response to request {}",
                request_id, reply.response_to
            )));
        }

        Ok(RawCommandResponse::new(
            self.address.clone(),
            reply.into_reply_body()?,
        ))
    }

    /// Moves the transferable parts of this connection into a fresh value for check-in,
    /// leaving `self` inert.
    fn take(&mut self) -> Connection {
        // Replace the stream with a closed placeholder; self is dropped immediately after.
        let stream: AsyncStream = std::mem::replace(&mut self.stream, Box::new(tokio::io::empty()));
        Connection {
            id: self.id,
            address: self.address.clone(),
            generation: self.generation,
            stream,
            stream_description: self.stream_description.take(),
            error: self.error,
            io_timeout: self.io_timeout,
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressor: self.compressor.take(),
            permit: None,
            pool: None,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Free the checkout slot before the connection is stored so a waiting task can
        // proceed immediately.
        let _permit = self.permit.take();
        if let Some(pool) = self.pool.take().and_then(|weak| weak.upgrade()) {
            super::check_in(&pool, self.take());
        }
    }
}
