use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bson::oid::ObjectId;
use tokio::sync::{mpsc, oneshot, watch};

use super::{
    description::topology::{
        SessionSupportStatus, TopologyDescription, TransactionSupportStatus,
    },
    monitor::{Monitor, MonitorRequestReceiver},
    Server, ServerDescription, ServerType, TopologyType,
};
use crate::{
    client::session::ClusterTime,
    cmap::Connection,
    error::{Error, Result},
    event::sdam::{
        SdamEventHandler,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, AsyncJoinHandle},
    trace::SdamTracingEventEmitter,
};

/// The driver's view of the deployment it is connected to, shared by all operations of one
/// client.
///
/// Mutation of the topology is serialized through a single worker task; readers observe
/// immutable published snapshots, so any number of operations can select servers
/// concurrently without locking.
#[derive(Clone, Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Self> {
        let description = TopologyDescription::new(&options)?;
        let id = ObjectId::new();

        let mut event_handlers: Vec<Arc<dyn SdamEventHandler>> = Vec::new();
        if let Some(ref handler) = options.sdam_event_handler {
            event_handlers.push(handler.clone());
        }
        event_handlers.push(Arc::new(SdamTracingEventEmitter::new(id)));
        let emitter = SdamEventEmitter {
            handlers: event_handlers,
            topology_id: id,
        };

        emitter.emit(|handler| {
            handler.handle_topology_opening_event(TopologyOpeningEvent { topology_id: id })
        });

        let (update_sender, update_receiver) = mpsc::unbounded_channel();
        let updater = TopologyUpdater {
            sender: update_sender,
        };

        let (check_request_tx, _) = watch::channel(());
        let check_request_tx = Arc::new(check_request_tx);

        let (state_tx, state_rx) = watch::channel(Arc::new(TopologyState {
            description: description.clone(),
            servers: HashMap::new(),
        }));

        let watcher = TopologyWatcher {
            receiver: state_rx,
            check_requester: check_request_tx.clone(),
        };

        let mut worker = TopologyWorker {
            id,
            description,
            servers: HashMap::new(),
            monitors: HashMap::new(),
            receiver: update_receiver,
            publisher: state_tx,
            check_request_tx,
            watcher: watcher.clone(),
            updater: updater.clone(),
            options,
            emitter,
        };
        worker.initialize()?;
        runtime::spawn(worker.run());

        Ok(Self { watcher, updater })
    }

    /// Begin watching the topology for changes. The returned watcher observes the state at
    /// the point of this call and all published states after it.
    pub(crate) fn watch(&self) -> TopologyWatcher {
        let mut watcher = self.watcher.clone();
        // Mark the current state as seen so wait_for_update only reacts to new states.
        watcher.receiver.borrow_and_update();
        watcher
    }

    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher
            .peek_latest()
            .description
            .cluster_time()
            .cloned()
    }

    pub(crate) async fn advance_cluster_time(&self, cluster_time: ClusterTime) {
        self.updater.advance_cluster_time(cluster_time).await;
    }

    pub(crate) fn session_support_status(&self) -> SessionSupportStatus {
        self.watcher.peek_latest().description.session_support_status
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.watcher
            .peek_latest()
            .description
            .transaction_support_status
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.watcher.peek_latest().description.topology_type
    }

    /// Handles an error that occurred while executing an operation against `address`,
    /// marking the server Unknown and invalidating its pool when the SDAM rules call for it.
    /// Returns whether the topology changed.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Broadcasts shutdown to every monitor, joins them, and closes all connection pools.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }
}

/// The topology state visible to readers: the current description plus the live server
/// handles (address + connection pool) backing it.
#[derive(Debug)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    servers: HashMap<ServerAddress, Arc<Server>>,
}

impl TopologyState {
    pub(crate) fn servers(&self) -> &HashMap<ServerAddress, Arc<Server>> {
        &self.servers
    }
}

/// A read handle onto the topology. Cheap to clone; each clone tracks its own notion of
/// which published state it has seen.
#[derive(Clone, Debug)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<Arc<TopologyState>>,
    check_requester: Arc<watch::Sender<()>>,
}

impl TopologyWatcher {
    /// The most recently published state, marking it as seen.
    pub(crate) fn observe_latest(&mut self) -> Arc<TopologyState> {
        self.receiver.borrow_and_update().clone()
    }

    /// The most recently published state without affecting change tracking.
    pub(crate) fn peek_latest(&self) -> Arc<TopologyState> {
        self.receiver.borrow().clone()
    }

    /// Waits up to `timeout` for a state newer than the last observed one. Returns whether
    /// an update occurred.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        matches!(
            runtime::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }

    /// Asks every monitor to scan its server as soon as the minimum heartbeat frequency
    /// allows.
    pub(crate) fn request_immediate_check(&self) {
        let _ = self.check_requester.send(());
    }

    pub(crate) fn subscribe_to_check_requests(&self) -> watch::Receiver<()> {
        self.check_requester.subscribe()
    }

    /// The current type of the given server, or `None` if it is no longer in the topology.
    pub(crate) fn server_type(&self, address: &ServerAddress) -> Option<ServerType> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .map(|description| description.server_type)
    }

    /// Whether the topology worker is still alive.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }
}

/// A write handle onto the topology; all mutations funnel through the worker task.
#[derive(Clone, Debug)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<UpdateMessage>,
}

impl TopologyUpdater {
    /// Applies a server description produced by a monitor check. Returns whether the
    /// topology changed.
    pub(crate) async fn update(&self, description: ServerDescription) -> bool {
        self.send_and_wait(|ack| UpdateMessage::ServerUpdate {
            description: Box::new(description),
            ack,
        })
        .await
        .unwrap_or(false)
    }

    /// Reports an error encountered by a monitor, marking the server Unknown.
    pub(crate) async fn monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_and_wait(|ack| UpdateMessage::MonitorError {
            address,
            error,
            ack,
        })
        .await
        .unwrap_or(false)
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_and_wait(|ack| UpdateMessage::ApplicationError {
            address,
            error,
            phase,
            ack,
        })
        .await
        .unwrap_or(false)
    }

    pub(crate) async fn advance_cluster_time(&self, cluster_time: ClusterTime) {
        let _ = self
            .send_and_wait(|ack| UpdateMessage::AdvanceClusterTime { cluster_time, ack })
            .await;
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self
            .send_and_wait(|ack| UpdateMessage::Shutdown { ack })
            .await;
    }

    async fn send_and_wait<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> UpdateMessage,
    ) -> Option<T> {
        let (ack, receiver) = oneshot::channel();
        self.sender.send(message(ack)).ok()?;
        receiver.await.ok()
    }
}

/// Where in a connection's lifecycle an application error was observed. Errors from stale
/// connections (whose pool generation has already moved on) are ignored.
#[derive(Clone, Debug)]
pub(crate) enum HandshakePhase {
    /// The error occurred before a connection could be established.
    PreHandshake,

    /// The error occurred on an established connection.
    PostHandshake {
        generation: u32,
        max_wire_version: Option<i32>,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(conn: &Connection) -> Self {
        Self::PostHandshake {
            generation: conn.generation,
            max_wire_version: conn
                .stream_description()
                .ok()
                .and_then(|sd| sd.max_wire_version),
        }
    }

    fn wire_version(&self) -> Option<i32> {
        match self {
            Self::PreHandshake => None,
            Self::PostHandshake {
                max_wire_version, ..
            } => *max_wire_version,
        }
    }
}

enum UpdateMessage {
    ServerUpdate {
        description: Box<ServerDescription>,
        ack: oneshot::Sender<bool>,
    },
    MonitorError {
        address: ServerAddress,
        error: Error,
        ack: oneshot::Sender<bool>,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
        ack: oneshot::Sender<bool>,
    },
    AdvanceClusterTime {
        cluster_time: ClusterTime,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    join_handle: AsyncJoinHandle<()>,
}

struct SdamEventEmitter {
    handlers: Vec<Arc<dyn SdamEventHandler>>,
    topology_id: ObjectId,
}

impl SdamEventEmitter {
    fn emit(&self, emit: impl Fn(&Arc<dyn SdamEventHandler>)) {
        for handler in &self.handlers {
            emit(handler);
        }
    }
}

/// The single task through which all topology mutation is serialized.
struct TopologyWorker {
    id: ObjectId,
    description: TopologyDescription,
    servers: HashMap<ServerAddress, Arc<Server>>,
    monitors: HashMap<ServerAddress, MonitorHandle>,
    receiver: mpsc::UnboundedReceiver<UpdateMessage>,
    publisher: watch::Sender<Arc<TopologyState>>,
    check_request_tx: Arc<watch::Sender<()>>,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    options: ClientOptions,
    emitter: SdamEventEmitter,
}

impl TopologyWorker {
    /// Creates servers and monitors for the seed list and publishes the initial state.
    fn initialize(&mut self) -> Result<()> {
        let previous = self.description.clone();

        if self.options.load_balanced == Some(true) {
            // Load-balanced topologies have no monitors; the balancer is immediately
            // selectable with a zero RTT.
            let addresses: Vec<ServerAddress> =
                self.description.server_addresses().cloned().collect();
            for address in addresses {
                let mut description = ServerDescription::new(address.clone());
                description.server_type = ServerType::LoadBalancer;
                description.average_round_trip_time = Some(Duration::from_nanos(0));
                self.description.servers.insert(address, description);
            }
        }

        let addresses: Vec<ServerAddress> = self.description.server_addresses().cloned().collect();
        for address in addresses {
            self.emitter.emit(|handler| {
                handler.handle_server_opening_event(ServerOpeningEvent {
                    topology_id: self.id,
                    address: address.clone(),
                })
            });
            self.add_server(address);
        }

        self.emit_topology_changed(&previous);
        self.publish();
        Ok(())
    }

    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            match message {
                UpdateMessage::ServerUpdate { description, ack } => {
                    let changed = self.apply_update(*description);
                    let _ = ack.send(changed);
                }
                UpdateMessage::MonitorError {
                    address,
                    error,
                    ack,
                } => {
                    let changed = self.mark_server_as_unknown(&address, &error);
                    if changed {
                        if let Some(server) = self.servers.get(&address) {
                            server.pool.clear(&error);
                        }
                    }
                    let _ = ack.send(changed);
                }
                UpdateMessage::ApplicationError {
                    address,
                    error,
                    phase,
                    ack,
                } => {
                    let changed = self.handle_application_error(address, error, phase);
                    let _ = ack.send(changed);
                }
                UpdateMessage::AdvanceClusterTime { cluster_time, ack } => {
                    self.description.advance_cluster_time(&cluster_time);
                    self.publish();
                    let _ = ack.send(());
                }
                UpdateMessage::Shutdown { ack } => {
                    self.shutdown().await;
                    let _ = ack.send(());
                    return;
                }
            }
        }
        // All updaters dropped without an explicit shutdown; stop monitors anyway.
        self.shutdown().await;
    }

    /// Applies a server description to the topology, reconciling monitors and emitting
    /// events if anything changed.
    fn apply_update(&mut self, description: ServerDescription) -> bool {
        let previous = self.description.clone();
        let changed = match self.description.update(description) {
            Ok(changed) => changed,
            Err(_) => return false,
        };

        if changed {
            self.sync_servers_with_description(&previous);
            self.emit_topology_changed(&previous);
            self.publish();
        }

        changed
    }

    fn mark_server_as_unknown(&mut self, address: &ServerAddress, error: &Error) -> bool {
        if !self.description.servers.contains_key(address) {
            return false;
        }
        let description = ServerDescription::new_from_error(address.clone(), error);
        self.apply_update(description)
    }

    fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.servers.get(&address) {
            Some(server) => server.clone(),
            None => return false,
        };

        // Ignore errors from connections the pool has already invalidated.
        if let HandshakePhase::PostHandshake { generation, .. } = phase {
            if generation != server.pool.generation() {
                return false;
            }
        }

        if error.is_state_change_error() {
            let updated = self.mark_server_as_unknown(&address, &error);
            if updated && (error.is_shutting_down() || phase.wire_version().unwrap_or(0) < 8) {
                server.pool.clear(&error);
            }
            let _ = self.check_request_tx.send(());
            updated
        } else if error.is_non_timeout_network_error()
            || (matches!(phase, HandshakePhase::PreHandshake)
                && (error.is_network_timeout() || error.is_command_error()))
        {
            let updated = self.mark_server_as_unknown(&address, &error);
            if updated {
                server.pool.clear(&error);
            }
            updated
        } else {
            false
        }
    }

    /// Starts and stops servers and monitors so that one of each exists exactly for the
    /// addresses in the current description.
    fn sync_servers_with_description(&mut self, previous: &TopologyDescription) {
        let current: HashSet<ServerAddress> =
            self.description.server_addresses().cloned().collect();
        let before: HashSet<ServerAddress> = previous.server_addresses().cloned().collect();

        for added in current.difference(&before) {
            self.emitter.emit(|handler| {
                handler.handle_server_opening_event(ServerOpeningEvent {
                    topology_id: self.id,
                    address: added.clone(),
                })
            });
            self.add_server(added.clone());
        }

        for removed in before.difference(&current) {
            if let Some(server) = self.servers.remove(removed) {
                server.pool.close();
            }
            if let Some(monitor) = self.monitors.remove(removed) {
                let _ = monitor.shutdown_tx.send(true);
                // The task observes the signal and winds down on its own, releasing its
                // stream; reconciliation does not block on it.
                drop(monitor.join_handle);
            }
            self.emitter.emit(|handler| {
                handler.handle_server_closed_event(ServerClosedEvent {
                    topology_id: self.id,
                    address: removed.clone(),
                })
            });
        }
    }

    fn add_server(&mut self, address: ServerAddress) {
        let server = Server::new(address.clone(), &self.options);
        self.servers.insert(address.clone(), server);

        if self.options.load_balanced == Some(true) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let request_receiver = MonitorRequestReceiver {
            check_requests: self.watcher.subscribe_to_check_requests(),
            shutdown: shutdown_rx,
        };
        let join_handle = Monitor::start(
            address.clone(),
            self.updater.clone(),
            self.watcher.clone(),
            request_receiver,
            self.emitter.handlers.clone(),
            self.options.clone(),
        );
        self.monitors.insert(
            address,
            MonitorHandle {
                shutdown_tx,
                join_handle,
            },
        );
    }

    /// Broadcast shutdown to all monitors first, then join each one; a monitor may only be
    /// freed after its task has acknowledged shutdown.
    ///
    /// Update messages that arrive while joining are acknowledged without effect: a monitor
    /// mid-check may be blocked waiting on an ack, and joining it without answering would
    /// deadlock.
    async fn shutdown(&mut self) {
        for monitor in self.monitors.values() {
            let _ = monitor.shutdown_tx.send(true);
        }
        let monitors: Vec<MonitorHandle> =
            self.monitors.drain().map(|(_, monitor)| monitor).collect();
        for monitor in monitors {
            let mut join_handle = monitor.join_handle;
            loop {
                tokio::select! {
                    _ = &mut join_handle => break,
                    message = self.receiver.recv() => {
                        if let Some(message) = message {
                            acknowledge_ignored(message);
                        }
                    }
                }
            }
        }
        for (_, server) in self.servers.drain() {
            server.pool.close();
        }
        self.emitter.emit(|handler| {
            handler.handle_topology_closed_event(TopologyClosedEvent {
                topology_id: self.id,
            })
        });
    }

    fn emit_topology_changed(&self, previous: &TopologyDescription) {
        let diff = match self.description.diff(previous) {
            Some(diff) => diff,
            None => return,
        };

        for (address, (previous_description, new_description)) in diff.changed_servers {
            self.emitter.emit(|handler| {
                handler.handle_server_description_changed_event(ServerDescriptionChangedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                    previous_description: crate::event::sdam::ServerDescription(
                        (*previous_description).clone(),
                    ),
                    new_description: crate::event::sdam::ServerDescription(
                        (*new_description).clone(),
                    ),
                })
            });
        }

        self.emitter.emit(|handler| {
            handler.handle_topology_description_changed_event(TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description: crate::sdam::public::TopologyDescription(previous.clone()),
                new_description: crate::sdam::public::TopologyDescription(
                    self.description.clone(),
                ),
            })
        });
    }

    fn publish(&mut self) {
        let state = TopologyState {
            description: self.description.clone(),
            servers: self.servers.clone(),
        };
        let _ = self.publisher.send(Arc::new(state));
    }
}

/// Answers an update message's ack without applying it. Used while the worker is shutting
/// down and the topology no longer changes.
fn acknowledge_ignored(message: UpdateMessage) {
    match message {
        UpdateMessage::ServerUpdate { ack, .. } => {
            let _ = ack.send(false);
        }
        UpdateMessage::MonitorError { ack, .. } => {
            let _ = ack.send(false);
        }
        UpdateMessage::ApplicationError { ack, .. } => {
            let _ = ack.send(false);
        }
        UpdateMessage::AdvanceClusterTime { ack, .. } => {
            let _ = ack.send(());
        }
        UpdateMessage::Shutdown { ack } => {
            let _ = ack.send(());
        }
    }
}
