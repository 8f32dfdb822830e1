use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::watch;

use super::{ServerDescription, ServerType, TopologyUpdater, TopologyWatcher};
use crate::{
    cmap::{options::ConnectionPoolOptions, Connection, Handshaker},
    error::Result,
    event::sdam::{
        SdamEventHandler,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime::{self, AsyncJoinHandle},
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// The frequency floor: no matter how many scan requests arrive, a monitor never contacts
/// its server more often than this.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The weight given to the latest sample when updating the average round trip time.
const RTT_SAMPLE_WEIGHT: f64 = 0.2;

/// Signals a monitor reacts to while sleeping between scans.
pub(crate) struct MonitorRequestReceiver {
    pub(crate) check_requests: watch::Receiver<()>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl MonitorRequestReceiver {
    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Monitors the state of one server, running hello checks on its own dedicated connection
/// and feeding the results into the topology.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    handshaker: Handshaker,
    updater: TopologyUpdater,
    watcher: TopologyWatcher,
    request_receiver: MonitorRequestReceiver,
    event_handlers: Vec<Arc<dyn SdamEventHandler>>,
    options: ClientOptions,
    average_round_trip_time: Option<Duration>,
    hello_ok: Option<bool>,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        updater: TopologyUpdater,
        watcher: TopologyWatcher,
        request_receiver: MonitorRequestReceiver,
        event_handlers: Vec<Arc<dyn SdamEventHandler>>,
        options: ClientOptions,
    ) -> AsyncJoinHandle<()> {
        let handshaker = Handshaker::new(&ConnectionPoolOptions::from_client_options(&options));
        let monitor = Self {
            address,
            connection: None,
            handshaker,
            updater,
            watcher,
            request_receiver,
            event_handlers,
            options,
            average_round_trip_time: None,
            hello_ok: None,
        };
        runtime::spawn(monitor.execute())
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);
        let min_frequency = self.options.min_heartbeat_frequency();

        while !self.request_receiver.is_shutdown() && self.watcher.is_alive() {
            let last_scan = Instant::now();
            self.check_server().await;
            self.wait_for_next_check(last_scan, heartbeat_frequency, min_frequency)
                .await;
        }

        // Dropping the connection releases the monitor's stream; the topology worker joins
        // this task before freeing the monitor's slot.
        self.connection = None;
    }

    /// Runs one scan of the server, applying the outcome to the topology.
    ///
    /// A check that fails against a server previously known to be healthy is retried once
    /// immediately on a fresh connection; only the retry's failure marks the server
    /// Unknown.
    async fn check_server(&mut self) -> bool {
        match self.perform_hello().await {
            Ok(reply) => self.apply_reply(reply).await,
            Err(first_error) => {
                self.connection = None;

                let previously_known = self
                    .watcher
                    .server_type(&self.address)
                    .map_or(false, |server_type| server_type != ServerType::Unknown);

                if previously_known {
                    match self.perform_hello().await {
                        Ok(reply) => return self.apply_reply(reply).await,
                        Err(retry_error) => {
                            self.connection = None;
                            return self
                                .updater
                                .monitor_error(self.address.clone(), retry_error)
                                .await;
                        }
                    }
                }

                self.updater
                    .monitor_error(self.address.clone(), first_error)
                    .await
            }
        }
    }

    async fn apply_reply(&mut self, reply: HelloReply) -> bool {
        self.hello_ok = reply.command_response.hello_ok;
        let description = ServerDescription::new_from_hello_reply(
            self.address.clone(),
            reply,
            self.average_round_trip_time
                .unwrap_or(Duration::from_millis(0)),
        );
        self.updater.update(description).await
    }

    /// Sends a single hello on the monitor's connection, establishing it first if needed,
    /// and emits the heartbeat events.
    async fn perform_hello(&mut self) -> Result<HelloReply> {
        self.emit_event(|handler| {
            handler.handle_server_heartbeat_started_event(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
            })
        });

        let start = Instant::now();
        let result = self.hello().await;
        let round_trip_time = start.elapsed();

        match result {
            Ok(ref reply) => {
                self.update_average_round_trip_time(round_trip_time);
                let reply_document: bson::Document = reply
                    .raw_command_response
                    .to_owned()
                    .try_into()
                    .unwrap_or_default();
                self.emit_event(|handler| {
                    handler.handle_server_heartbeat_succeeded_event(
                        ServerHeartbeatSucceededEvent {
                            duration: round_trip_time,
                            reply: reply_document.clone(),
                            server_address: self.address.clone(),
                        },
                    )
                });
            }
            Err(ref error) => {
                self.average_round_trip_time = None;
                self.emit_event(|handler| {
                    handler.handle_server_heartbeat_failed_event(ServerHeartbeatFailedEvent {
                        duration: round_trip_time,
                        failure: error.clone(),
                        server_address: self.address.clone(),
                    })
                });
            }
        }

        result
    }

    async fn hello(&mut self) -> Result<HelloReply> {
        match self.connection {
            Some(ref mut conn) => {
                let command = hello_command(self.options.load_balanced, self.hello_ok);
                run_hello(conn, command).await
            }
            None => {
                let connector = self
                    .options
                    .stream_connector
                    .clone()
                    .unwrap_or_else(crate::runtime::stream::default_connector);
                let stream = connector
                    .connect(self.address.clone(), self.options.connect_timeout)
                    .await?;
                let mut conn = Connection::new(
                    0,
                    self.address.clone(),
                    0,
                    stream,
                    self.options.connect_timeout,
                );
                let reply = self.handshaker.handshake(&mut conn).await?;
                self.connection = Some(conn);
                Ok(reply)
            }
        }
    }

    fn update_average_round_trip_time(&mut self, sample: Duration) {
        self.average_round_trip_time = Some(match self.average_round_trip_time {
            Some(old_average) => {
                let new_average = RTT_SAMPLE_WEIGHT * sample.as_secs_f64()
                    + (1.0 - RTT_SAMPLE_WEIGHT) * old_average.as_secs_f64();
                Duration::from_secs_f64(new_average)
            }
            None => sample,
        });
    }

    /// Sleeps until the next scan is due, reacting to scan requests and shutdown.
    ///
    /// Scan requests pull the next scan forward, but never closer than the minimum
    /// heartbeat frequency after the last scan; multiple requests coalesce into one
    /// rescheduled scan.
    async fn wait_for_next_check(
        &mut self,
        last_scan: Instant,
        heartbeat_frequency: Duration,
        min_frequency: Duration,
    ) {
        let mut scan_due = last_scan + heartbeat_frequency;

        loop {
            let now = Instant::now();
            if now >= scan_due || self.request_receiver.is_shutdown() {
                return;
            }

            let MonitorRequestReceiver {
                check_requests,
                shutdown,
            } = &mut self.request_receiver;

            tokio::select! {
                _ = tokio::time::sleep(scan_due - now) => return,
                changed = check_requests.changed() => {
                    if changed.is_err() {
                        // Topology is gone; exit via the liveness check in execute.
                        return;
                    }
                    let earliest = last_scan + min_frequency;
                    if earliest < scan_due {
                        scan_due = earliest;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    fn emit_event(&self, emit: impl Fn(&Arc<dyn SdamEventHandler>)) {
        for handler in &self.event_handlers {
            emit(handler);
        }
    }
}
