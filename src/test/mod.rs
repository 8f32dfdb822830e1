//! In-process test infrastructure: a scripted server that speaks just enough OP_MSG to
//! exercise the full command pipeline without sockets.

mod executor;
mod sdam;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bson::{doc, Document};

use crate::{
    bson_util,
    cmap::conn::wire::Message,
    error::Result,
    options::{ClientOptions, ServerAddress},
    runtime::{
        stream::{AsyncStream, StreamConnector},
        spawn,
    },
    BoxFuture, Client,
};

/// A handler invoked once per command the mock server receives. Receives the fully
/// reassembled command document (document sequences folded back into the body) and
/// returns the reply body.
pub(crate) type CommandHandler = Arc<dyn Fn(Document) -> Document + Send + Sync>;

/// A `StreamConnector` that terminates every connection at an in-process scripted server.
#[derive(Clone)]
pub(crate) struct MockServer {
    handler: CommandHandler,
    /// Every non-handshake command received, in arrival order.
    commands: Arc<Mutex<Vec<Document>>>,
    connection_count: Arc<AtomicUsize>,
}

impl MockServer {
    pub(crate) fn new(handler: impl Fn(Document) -> Document + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            commands: Arc::new(Mutex::new(Vec::new())),
            connection_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The non-handshake commands the server has received so far.
    pub(crate) fn received_commands(&self) -> Vec<Document> {
        self.commands.lock().unwrap().clone()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Client options pointing at this mock server with fast timeouts.
    pub(crate) fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::builder()
            .hosts(vec![ServerAddress::Tcp {
                host: "mock.test".to_string(),
                port: Some(27017),
            }])
            .connect_timeout(Duration::from_secs(5))
            .server_selection_timeout(Duration::from_secs(5))
            .heartbeat_freq(Duration::from_secs(10))
            .build();
        options.set_stream_connector(Arc::new(self.clone()));
        options
    }

    pub(crate) fn client(&self) -> Result<Client> {
        Client::with_options(self.client_options())
    }

    async fn serve(self, mut stream: tokio::io::DuplexStream) {
        loop {
            let message = match Message::read_from(&mut stream, None).await {
                Ok(message) => message,
                // The client hung up.
                Err(_) => return,
            };
            let request_id = message.request_id.unwrap_or(0);
            let command: Document = match message
                .into_reply_body()
                .and_then(|raw| raw.try_into().map_err(crate::error::Error::from))
            {
                Ok(doc) => doc,
                Err(_) => return,
            };

            let is_handshake = command.contains_key("isMaster")
                || command.contains_key("ismaster")
                || command.contains_key("hello");
            if !is_handshake {
                self.commands.lock().unwrap().push(command.clone());
            }

            let reply_body = (self.handler)(command);
            let raw = match bson_util::to_raw_document_buf(&reply_body) {
                Ok(raw) => raw,
                Err(_) => return,
            };
            let mut reply = Message::new(raw);
            reply.response_to = request_id;
            if reply.write_to(&mut stream, 0).await.is_err() {
                return;
            }
        }
    }
}

impl StreamConnector for MockServer {
    fn connect(
        &self,
        _address: ServerAddress,
        _connect_timeout: Option<Duration>,
    ) -> BoxFuture<'static, Result<AsyncStream>> {
        let server = self.clone();
        Box::pin(async move {
            server.connection_count.fetch_add(1, Ordering::SeqCst);
            let (client_end, server_end) = tokio::io::duplex(1024 * 1024);
            spawn(server.clone().serve(server_end));
            Ok(Box::new(client_end) as AsyncStream)
        })
    }
}

/// A hello reply describing a standalone-like writable server with modern limits. Tests
/// overlay whatever fields they need.
pub(crate) fn hello_reply() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "helloOk": true,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "maxMessageSizeBytes": 48 * 1024 * 1024,
        "maxWriteBatchSize": 100_000,
        "logicalSessionTimeoutMinutes": 30,
        "minWireVersion": 0,
        "maxWireVersion": 25,
    }
}

/// A hello reply describing a mongos.
pub(crate) fn mongos_hello_reply() -> Document {
    let mut reply = hello_reply();
    reply.insert("msg", "isdbgrid");
    reply
}
