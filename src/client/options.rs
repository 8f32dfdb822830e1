//! Options used to configure a [`Client`](crate::Client).

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    concern::{ReadConcern, WriteConcern},
    error::{Error, Result},
    event::{cmap::CmapEventHandler, command::CommandEventHandler, sdam::SdamEventHandler},
    runtime::stream::SharedStreamConnector,
    selection_criteria::SelectionCriteria,
};

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use crate::cmap::conn::wire::Compressor;

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(untagged)]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host == other_host
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
        }
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let hostname = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address: \"{}\"",
                    address
                )))
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = part.parse::<u16>().map_err(|_| {
                    Error::invalid_argument(format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ))
                })?;
                Some(port)
            }
            None => None,
        };

        if parts.next().is_some() {
            return Err(Error::invalid_argument(format!(
                "invalid server address: \"{}\"",
                address
            )));
        }

        Ok(ServerAddress::Tcp {
            host: hostname.to_string(),
            port,
        })
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Derivative, TypedBuilder)]
#[derivative(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the Client should connect to.
    ///
    /// Note that by default, the driver will autodiscover other nodes in the cluster. To connect
    /// directly to a single server (rather than autodiscovering the rest of the cluster), set the
    /// `direct_connection` field to `true`.
    #[builder(!default)]
    pub hosts: Vec<ServerAddress>,

    /// The compressors that the Client is willing to use in the order they are specified
    /// in the configuration. The Client sends this list of compressors to the server.
    /// The server responds with the intersection of its supported list of compressors.
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    pub compressors: Option<Vec<Compressor>>,

    /// The connect timeout passed to each underlying TcpStream when attempting to connect to the
    /// server.
    ///
    /// The default value is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// Specifies whether the Client should directly connect to a single host rather than
    /// autodiscover all servers in the cluster.
    ///
    /// The default value is false.
    pub direct_connection: Option<bool>,

    /// The amount of time each monitoring task waits between sending hello commands to its
    /// respective server.
    ///
    /// The default value is 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// Whether or not the client is connecting to a MongoDB cluster through a load balancer.
    pub load_balanced: Option<bool>,

    /// When running a read operation with a ReadPreference that allows selecting secondaries,
    /// `local_threshold` is used to determine how much longer the average round trip time between
    /// the driver and server is allowed compared to the least round trip time of all the suitable
    /// servers.
    ///
    /// The default value is 15 ms.
    pub local_threshold: Option<Duration>,

    /// The maximum amount of connections that the Client should allow to be created in a
    /// connection pool for a given server.
    ///
    /// The default value is 100.
    pub max_pool_size: Option<u32>,

    /// The default read concern for operations performed on the Client.
    pub read_concern: Option<ReadConcern>,

    /// The name of the replica set that the Client should connect to.
    pub repl_set_name: Option<String>,

    /// Whether or not the client should retry a read operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether or not the client should retry a write operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// The default selection criteria for operations performed on the Client.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The amount of time the Client should attempt to select a server for an operation before
    /// timing out.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The default database for this client.
    pub default_database: Option<String>,

    /// The default write concern for operations performed on the Client.
    pub write_concern: Option<WriteConcern>,

    /// The application-provided handler for command-related events.
    #[derivative(Debug = "ignore")]
    pub command_event_handler: Option<Arc<dyn CommandEventHandler>>,

    /// The application-provided handler for connection-pool-related events.
    #[derivative(Debug = "ignore")]
    pub cmap_event_handler: Option<Arc<dyn CmapEventHandler>>,

    /// The application-provided handler for SDAM events.
    #[derivative(Debug = "ignore")]
    pub sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,

    /// The producer of the byte streams that connections run over. Swapped out in tests to
    /// script server behavior without sockets.
    #[derivative(Debug = "ignore")]
    #[builder(setter(skip))]
    pub(crate) stream_connector: Option<SharedStreamConnector>,

    /// The floor on how frequently a monitor is allowed to rescan its server, regardless of how
    /// many scan requests are coalesced into one.
    #[builder(setter(skip))]
    pub(crate) min_heartbeat_freq: Option<Duration>,
}

impl ClientOptions {
    /// Validates that the options are consistent before they are used to construct a client.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("hosts list must not be empty"));
        }

        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(Error::invalid_argument(
                "cannot specify multiple seeds with directConnection set to true",
            ));
        }

        if self.load_balanced == Some(true) {
            if self.hosts.len() > 1 {
                return Err(Error::invalid_argument(
                    "cannot specify multiple seeds with loadBalanced set to true",
                ));
            }
            if self.repl_set_name.is_some() {
                return Err(Error::invalid_argument(
                    "cannot specify replicaSet with loadBalanced set to true",
                ));
            }
            if self.direct_connection == Some(true) {
                return Err(Error::invalid_argument(
                    "cannot specify directConnection with loadBalanced set to true",
                ));
            }
        }

        if let Some(ref write_concern) = self.write_concern {
            write_concern.validate()?;
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq < self.min_heartbeat_frequency() {
                return Err(Error::invalid_argument(format!(
                    "heartbeatFrequencyMS must be at least {}ms",
                    self.min_heartbeat_frequency().as_millis()
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn min_heartbeat_frequency(&self) -> Duration {
        self.min_heartbeat_freq
            .unwrap_or(Duration::from_millis(500))
    }

    #[cfg(test)]
    pub(crate) fn set_stream_connector(&mut self, connector: SharedStreamConnector) {
        self.stream_connector = Some(connector);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_parsing() {
        let address = ServerAddress::parse("example.com:1234").unwrap();
        assert_eq!(address.host(), "example.com");
        assert_eq!(address.port(), Some(1234));

        let default_port = ServerAddress::parse("example.com").unwrap();
        assert_eq!(default_port.port(), None);
        assert_eq!(default_port.to_string(), "example.com:27017");

        assert!(ServerAddress::parse("").is_err());
        assert!(ServerAddress::parse("host:notaport").is_err());
        assert!(ServerAddress::parse("host:123:456").is_err());
    }

    #[test]
    fn validation_catches_conflicts() {
        let options = ClientOptions::builder()
            .hosts(vec![
                ServerAddress::parse("a:27017").unwrap(),
                ServerAddress::parse("b:27017").unwrap(),
            ])
            .direct_connection(true)
            .build();
        assert!(options.validate().is_err());

        let options = ClientOptions::builder().hosts(vec![]).build();
        assert!(options.validate().is_err());
    }
}
