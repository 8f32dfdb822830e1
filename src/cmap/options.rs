use std::{sync::Arc, time::Duration};

use derivative::Derivative;

use crate::{
    event::cmap::CmapEventHandler,
    options::ClientOptions,
    runtime::stream::{default_connector, SharedStreamConnector},
};

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use crate::cmap::conn::wire::Compressor;

/// Options used to configure a connection pool, derived from the client options.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub(crate) struct ConnectionPoolOptions {
    /// The maximum number of connections that may be checked out concurrently.
    pub(crate) max_pool_size: Option<u32>,

    /// The timeout applied to establishing streams and to individual socket reads and writes.
    pub(crate) connect_timeout: Option<Duration>,

    /// Whether the pool's server sits behind a load balancer.
    pub(crate) load_balanced: Option<bool>,

    /// The compressors offered to the server during the handshake.
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    pub(crate) compressors: Option<Vec<Compressor>>,

    #[derivative(Debug = "ignore")]
    pub(crate) cmap_event_handler: Option<Arc<dyn CmapEventHandler>>,

    #[derivative(Debug = "ignore")]
    pub(crate) stream_connector: SharedStreamConnector,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            connect_timeout: options.connect_timeout,
            load_balanced: options.load_balanced,
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressors: options.compressors.clone(),
            cmap_event_handler: options.cmap_event_handler.clone(),
            stream_connector: options
                .stream_connector
                .clone()
                .unwrap_or_else(default_connector),
        }
    }
}
