use std::sync::{Arc, Mutex};

use bson::doc;

use super::{mongos_hello_reply, MockServer};
use crate::{
    event::sdam::{
        SdamEventHandler,
        ServerDescriptionChangedEvent,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
    },
    sdam::public::{ServerType, TopologyType},
    Client,
};

/// Buffers the names of SDAM events as they are emitted.
#[derive(Clone, Default)]
struct EventBuffer {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventBuffer {
    fn contains(&self, name: &str) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == name)
    }
}

impl SdamEventHandler for EventBuffer {
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {
        self.events
            .lock()
            .unwrap()
            .push("server_description_changed".to_string());
    }

    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {
        self.events
            .lock()
            .unwrap()
            .push("topology_description_changed".to_string());
    }

    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {
        self.events.lock().unwrap().push("topology_closed".to_string());
    }

    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {
        self.events
            .lock()
            .unwrap()
            .push("heartbeat_started".to_string());
    }

    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {
        self.events
            .lock()
            .unwrap()
            .push("heartbeat_succeeded".to_string());
    }

    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {
        self.events
            .lock()
            .unwrap()
            .push("heartbeat_failed".to_string());
    }
}

#[tokio::test]
async fn monitor_discovers_server_and_emits_heartbeat_events() {
    let server = MockServer::new(|command| {
        if command.contains_key("ping") {
            doc! { "ok": 1 }
        } else {
            mongos_hello_reply()
        }
    });

    let buffer = EventBuffer::default();
    let mut options = server.client_options();
    options.sdam_event_handler = Some(Arc::new(buffer.clone()));
    let client = Client::with_options(options).unwrap();

    // Force discovery by running an operation.
    client
        .database("admin")
        .run_command(doc! { "ping": 1 }, None)
        .await
        .unwrap();

    let description = client.topology_description();
    assert_eq!(description.topology_type(), TopologyType::Sharded);
    let servers = description.servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].server_type(), ServerType::Mongos);

    assert!(buffer.contains("heartbeat_started"));
    assert!(buffer.contains("heartbeat_succeeded"));
    assert!(buffer.contains("server_description_changed"));
    assert!(buffer.contains("topology_description_changed"));

    client.shutdown().await;
    assert!(buffer.contains("topology_closed"));
}

#[tokio::test]
async fn monitor_connection_failure_marks_server_unknown() {
    // A connector whose streams immediately fail the handshake: the hello reply is an
    // error document.
    let server = MockServer::new(|_| doc! { "ok": 0, "code": 18, "errmsg": "refused" });

    let buffer = EventBuffer::default();
    let mut options = server.client_options();
    options.sdam_event_handler = Some(Arc::new(buffer.clone()));
    options.server_selection_timeout = Some(std::time::Duration::from_millis(500));
    let client = Client::with_options(options).unwrap();

    let error = client
        .database("admin")
        .run_command(doc! { "ping": 1 }, None)
        .await
        .unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        crate::error::ErrorKind::ServerSelection { .. }
    ));

    assert!(buffer.contains("heartbeat_failed"));
    let description = client.topology_description();
    assert_eq!(description.servers()[0].server_type(), ServerType::Unknown);
    assert!(description.servers()[0].error_message().is_some());

    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_joins_monitors_and_is_idempotent() {
    let server = MockServer::new(|_| mongos_hello_reply());
    let client = server.client().unwrap();

    // Give the monitor a chance to establish its stream.
    client
        .topology()
        .watch()
        .wait_for_update(std::time::Duration::from_secs(5))
        .await;

    client.shutdown().await;
    // A second shutdown is a no-op rather than a hang or panic.
    client.shutdown().await;
}
