use std::{sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{error::Result, options::ServerAddress, BoxFuture};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The byte stream the driver reads and writes wire messages on.
///
/// TLS/DNS concerns live in the connector that produces the stream; the driver core only
/// requires an ordered, reliable byte stream with async read/write.
pub(crate) type AsyncStream = Box<dyn AsyncReadWrite>;

pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncReadWrite for T {}

/// Produces connected streams to servers. The default implementation dials plain TCP;
/// alternative implementations supply TLS or in-memory streams (tests).
pub(crate) trait StreamConnector: Send + Sync {
    fn connect(
        &self,
        address: ServerAddress,
        connect_timeout: Option<Duration>,
    ) -> BoxFuture<'static, Result<AsyncStream>>;
}

/// Connects plain TCP streams with `TCP_NODELAY` set.
#[derive(Debug, Default)]
pub(crate) struct TcpStreamConnector;

impl StreamConnector for TcpStreamConnector {
    fn connect(
        &self,
        address: ServerAddress,
        connect_timeout: Option<Duration>,
    ) -> BoxFuture<'static, Result<AsyncStream>> {
        Box::pin(async move {
            let timeout = match connect_timeout {
                Some(timeout) if timeout != Duration::ZERO => timeout,
                _ => DEFAULT_CONNECT_TIMEOUT,
            };
            let stream = super::timeout(timeout, async {
                let ServerAddress::Tcp { ref host, port } = address;
                let stream =
                    tokio::net::TcpStream::connect((host.as_str(), port.unwrap_or(27017))).await?;
                stream.set_nodelay(true)?;
                Ok::<_, crate::error::Error>(stream)
            })
            .await??;
            Ok(Box::new(stream) as AsyncStream)
        })
    }
}

pub(crate) type SharedStreamConnector = Arc<dyn StreamConnector>;

pub(crate) fn default_connector() -> SharedStreamConnector {
    Arc::new(TcpStreamConnector)
}
