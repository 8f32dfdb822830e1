use super::{conn::StreamDescription, options::ConnectionPoolOptions, Connection};
use crate::{
    error::Result,
    hello::{hello_command, run_hello, HelloReply},
};

/// Performs the hello handshake on freshly established connections, populating the stream
/// description and negotiating compression.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    load_balanced: Option<bool>,
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    compressors: Option<Vec<super::conn::wire::Compressor>>,
}

impl Handshaker {
    pub(crate) fn new(options: &ConnectionPoolOptions) -> Self {
        Self {
            load_balanced: options.load_balanced,
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressors: options.compressors.clone(),
        }
    }

    /// Runs hello on the connection, recording the resulting stream description. The reply is
    /// returned so monitors can feed it into the topology.
    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HelloReply> {
        let command = hello_command(self.load_balanced, None);
        let reply = run_hello(conn, command).await?;
        conn.set_stream_description(StreamDescription::from_hello_reply(&reply));

        // The usable compressor is the first client choice the server also supports.
        #[cfg(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        ))]
        if let (Some(client_compressors), Some(server_compressors)) = (
            self.compressors.as_ref(),
            reply.command_response.compressors.as_ref(),
        ) {
            conn.compressor = client_compressors
                .iter()
                .find(|c| server_compressors.iter().any(|s| s == c.name()))
                .cloned();
        }

        Ok(reply)
    }
}
