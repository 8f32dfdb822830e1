mod executor;
pub mod options;
pub mod session;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use derivative::Derivative;

use crate::{
    bson::Document,
    bulk_write::BulkWrite,
    change_stream::{options::ChangeStreamOptions, ChangeStream},
    concern::{ReadConcern, WriteConcern},
    db::Database,
    error::{ErrorKind, Result},
    event::command::CommandEventHandler,
    operation::AggregateTarget,
    options::{ClientOptions, DatabaseOptions, SessionOptions},
    sdam::{server_selection, SelectedServer, SessionSupportStatus, Topology},
    selection_criteria::{ReadPreference, SelectionCriteria},
    trace::CommandTracingEventEmitter,
    ClientSession,
};

use session::{ServerSession, ServerSessionPool};

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// This is the main entry point for the API. A `Client` is used to connect to a MongoDB
/// cluster. By default, it will monitor the topology of the cluster, keeping track of any
/// changes, such as servers being added or removed.
///
/// `Client` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html)
/// internally, so it can safely be shared across threads or async tasks. For example:
///
/// ```no_run
/// # use mongodb_core::{bson::Document, Client, error::Result};
/// # async fn start_workers(client: Client) -> Result<()> {
/// for i in 0..5 {
///     let client_ref = client.clone();
///
///     tokio::task::spawn(async move {
///         let collection = client_ref.database("items").collection(&format!("coll{}", i));
///
///         // Do something with the collection
///     });
/// }
/// #
/// # Ok(())
/// # }
/// ```
///
/// A `Client` spawns background tasks (one monitor per discovered server); call
/// [`Client::shutdown`] to stop them and release their connections deterministically.
#[derive(Clone, Debug)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct ClientInner {
    pub(crate) topology: Topology,
    pub(crate) options: ClientOptions,
    session_pool: ServerSessionPool,
    #[derivative(Debug = "ignore")]
    command_event_handlers: Vec<Arc<dyn CommandEventHandler>>,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `options`.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let mut command_event_handlers: Vec<Arc<dyn CommandEventHandler>> = Vec::new();
        if let Some(ref handler) = options.command_event_handler {
            command_event_handlers.push(handler.clone());
        }
        command_event_handlers.push(Arc::new(CommandTracingEventEmitter::new()));

        let inner = Arc::new(ClientInner {
            topology: Topology::new(options.clone())?,
            session_pool: ServerSessionPool::new(),
            command_event_handlers,
            options,
        });
        Ok(Self { inner })
    }

    pub(crate) fn emit_command_event(&self, emit: impl Fn(&Arc<dyn CommandEventHandler>)) {
        for handler in &self.inner.command_event_handlers {
            emit(handler);
        }
    }

    /// Gets the default selection criteria the `Client` uses for operations.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.options.selection_criteria.as_ref()
    }

    /// Gets the default read concern the `Client` uses for operations.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.options.read_concern.as_ref()
    }

    /// Gets the default write concern the `Client` uses for operations.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.options.write_concern.as_ref()
    }

    /// Gets a handle to a database specified by `name` in the cluster the `Client` is
    /// connected to. The `Database` options (e.g. read preference and write concern) will
    /// default to those of the `Client`.
    ///
    /// This method does not send or receive anything across the wire to the database, so it
    /// can be used repeatedly without incurring any costs from I/O.
    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name, None)
    }

    /// Gets a handle to a database specified by `name` with the given options.
    pub fn database_with_options(&self, name: &str, options: DatabaseOptions) -> Database {
        Database::new(self.clone(), name, Some(options))
    }

    /// Gets a handle to the default database specified in the `ClientOptions`, if one is
    /// set.
    pub fn default_database(&self) -> Option<Database> {
        self.inner
            .options
            .default_database
            .as_ref()
            .map(|db_name| self.database(db_name))
    }

    /// Starts a new [`ClientSession`].
    pub async fn start_session(
        &self,
        options: impl Into<Option<SessionOptions>>,
    ) -> Result<ClientSession> {
        let options = options.into();
        if let Some(ref options) = options {
            options.validate()?;
        }
        match self.get_session_support_status().await? {
            SessionSupportStatus::Supported {
                logical_session_timeout,
            } => Ok(self
                .start_session_with_timeout(logical_session_timeout, options, false)
                .await),
            _ => Err(ErrorKind::SessionsNotSupported.into()),
        }
    }

    /// Starts a new [`ChangeStream`] that receives events for all changes in the cluster.
    /// The stream does not observe changes from system collections or the "config",
    /// "local" or "admin" databases.
    ///
    /// Change streams require either a "majority" read concern or no read concern.
    /// Anything else will cause a server error.
    ///
    /// Note that using a `$project` stage to remove any of the `_id`, `operationType` or
    /// `ns` fields will cause an error. The driver requires these fields to support
    /// resumability.
    pub async fn watch(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<ChangeStreamOptions>>,
    ) -> Result<ChangeStream> {
        let mut options = options.into();
        options
            .get_or_insert_with(Default::default)
            .all_changes_for_cluster = Some(true);
        let target = AggregateTarget::Database("admin".to_string());
        ChangeStream::execute(self.clone(), target, pipeline.into_iter().collect(), options).await
    }

    /// Creates a new [`BulkWrite`] in its append phase. Writes appended to it may target
    /// any namespace in the cluster.
    pub fn bulk_write(&self) -> BulkWrite {
        BulkWrite::new(self.clone())
    }

    /// Shuts this client down: broadcasts shutdown to every server monitor, joins them,
    /// and closes all connection pools. In-flight operations fail once their connections
    /// are closed. Any clone of this client is shut down as well.
    pub async fn shutdown(&self) {
        self.inner.topology.shutdown().await;
    }

    /// Check in a server session to the server session pool. The session will be discarded
    /// if it is expired or dirty, or if the topology no longer supports sessions.
    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        let session_support_status = self.inner.topology.session_support_status();
        if let SessionSupportStatus::Supported {
            logical_session_timeout,
        } = session_support_status
        {
            self.inner
                .session_pool
                .check_in(session, logical_session_timeout)
                .await;
        }
    }

    /// Starts a `ClientSession`, reusing a pooled server session that is not about to
    /// expire when one is available.
    pub(crate) async fn start_session_with_timeout(
        &self,
        logical_session_timeout: Option<Duration>,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> ClientSession {
        ClientSession::new(
            self.inner
                .session_pool
                .check_out(logical_session_timeout)
                .await,
            self.clone(),
            options,
            is_implicit,
        )
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    fn selection_timeout(&self) -> Duration {
        self.inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT)
    }

    pub(crate) fn selection_deadline(&self) -> Option<Instant> {
        Some(Instant::now() + self.selection_timeout())
    }

    /// Select a server using the provided criteria. If none is provided, a primary read
    /// preference is used. Servers in `deprioritized` are avoided when any alternative is
    /// selectable, but never at the cost of failing an otherwise viable selection.
    pub(crate) async fn select_server(
        &self,
        criteria: Option<&SelectionCriteria>,
        deprioritized: &[crate::options::ServerAddress],
    ) -> Result<SelectedServer> {
        let criteria = criteria
            .or_else(|| self.inner.options.selection_criteria.as_ref())
            .unwrap_or(&SelectionCriteria::ReadPreference(ReadPreference::Primary));

        let start_time = Instant::now();
        let timeout = self.selection_timeout();

        let mut watcher = self.inner.topology.watch();
        loop {
            let state = watcher.observe_latest();

            if let Some(server) = server_selection::attempt_to_select_server(
                criteria,
                &state.description,
                state.servers(),
                deprioritized,
            )? {
                return Ok(server);
            }

            watcher.request_immediate_check();

            let change_occurred = start_time.elapsed() < timeout
                && watcher
                    .wait_for_update(timeout - start_time.elapsed())
                    .await;
            if !change_occurred {
                return Err(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                }
                .into());
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn clear_session_pool(&self) {
        self.inner.session_pool.clear().await;
    }

    #[cfg(test)]
    pub(crate) async fn is_session_checked_in(&self, id: &Document) -> bool {
        self.inner.session_pool.contains(id).await
    }

    #[cfg(test)]
    pub(crate) fn topology_description(&self) -> crate::sdam::public::TopologyDescription {
        crate::sdam::public::TopologyDescription(
            self.inner
                .topology
                .watch()
                .peek_latest()
                .description
                .clone(),
        )
    }
}
