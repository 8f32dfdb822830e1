use std::time::Duration;

use bson::{doc, oid::ObjectId, Timestamp};
use pretty_assertions::assert_eq;

use super::{TopologyDescription, TopologyType};
use crate::{
    client::session::ClusterTime,
    error::{Error, ErrorKind},
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{ServerDescription, ServerType},
};

fn address(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn options_with_hosts(hosts: &[&str]) -> ClientOptions {
    ClientOptions::builder()
        .hosts(hosts.iter().map(|h| address(h)).collect::<Vec<_>>())
        .build()
}

fn reply(server_address: &ServerAddress, command_response: HelloCommandResponse) -> HelloReply {
    HelloReply {
        server_address: server_address.clone(),
        command_response,
        raw_command_response: bson::RawDocumentBuf::new(),
        cluster_time: None,
    }
}

fn base_response() -> HelloCommandResponse {
    HelloCommandResponse {
        min_wire_version: Some(0),
        max_wire_version: Some(17),
        max_bson_object_size: 16 * 1024 * 1024,
        max_message_size_bytes: 48 * 1024 * 1024,
        max_write_batch_size: Some(100_000),
        logical_session_timeout_minutes: Some(30),
        ..Default::default()
    }
}

pub(crate) fn primary_description(
    addr: &str,
    set_name: &str,
    hosts: &[&str],
    set_version: i32,
    election_id: ObjectId,
) -> ServerDescription {
    let mut response = base_response();
    response.is_writable_primary = Some(true);
    response.set_name = Some(set_name.to_string());
    response.hosts = Some(hosts.iter().map(|h| h.to_string()).collect());
    response.set_version = Some(set_version);
    response.election_id = Some(election_id);
    let addr = address(addr);
    ServerDescription::new_from_hello_reply(
        addr.clone(),
        reply(&addr, response),
        Duration::from_millis(5),
    )
}

pub(crate) fn secondary_description(addr: &str, set_name: &str, hosts: &[&str]) -> ServerDescription {
    let mut response = base_response();
    response.secondary = Some(true);
    response.set_name = Some(set_name.to_string());
    response.hosts = Some(hosts.iter().map(|h| h.to_string()).collect());
    let addr = address(addr);
    ServerDescription::new_from_hello_reply(
        addr.clone(),
        reply(&addr, response),
        Duration::from_millis(5),
    )
}

pub(crate) fn mongos_description(addr: &str) -> ServerDescription {
    let mut response = base_response();
    response.msg = Some("isdbgrid".to_string());
    let addr = address(addr);
    ServerDescription::new_from_hello_reply(
        addr.clone(),
        reply(&addr, response),
        Duration::from_millis(5),
    )
}

pub(crate) fn standalone_description(addr: &str) -> ServerDescription {
    let mut response = base_response();
    response.is_writable_primary = Some(true);
    let addr = address(addr);
    ServerDescription::new_from_hello_reply(
        addr.clone(),
        reply(&addr, response),
        Duration::from_millis(5),
    )
}

fn oid(byte: u8) -> ObjectId {
    ObjectId::from_bytes([byte; 12])
}

fn primary_count(description: &TopologyDescription) -> usize {
    description
        .servers
        .values()
        .filter(|s| s.server_type == ServerType::RsPrimary)
        .count()
}

#[test]
fn discovers_replica_set_from_primary() {
    let mut topology =
        TopologyDescription::new(&options_with_hosts(&["a:27017"])).unwrap();

    topology
        .update(primary_description(
            "a:27017",
            "rs0",
            &["a:27017", "b:27017", "c:27017"],
            1,
            oid(1),
        ))
        .unwrap();

    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.set_name.as_deref(), Some("rs0"));
    assert_eq!(topology.servers.len(), 3);
    assert!(topology.servers.contains_key(&address("b:27017")));
    assert!(topology.servers.contains_key(&address("c:27017")));
}

#[test]
fn at_most_one_primary() {
    let hosts = ["a:27017", "b:27017"];
    let mut topology = TopologyDescription::new(&options_with_hosts(&hosts)).unwrap();

    topology
        .update(primary_description("a:27017", "rs0", &hosts, 1, oid(1)))
        .unwrap();
    assert_eq!(primary_count(&topology), 1);

    // b wins an election; a must be demoted atomically.
    topology
        .update(primary_description("b:27017", "rs0", &hosts, 1, oid(2)))
        .unwrap();

    assert_eq!(primary_count(&topology), 1);
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(
        topology.servers[&address("a:27017")].server_type,
        ServerType::Unknown
    );
    assert_eq!(
        topology.servers[&address("b:27017")].server_type,
        ServerType::RsPrimary
    );
}

#[test]
fn stale_primary_demoted_by_election_id() {
    let hosts = ["a:27017", "b:27017"];
    let mut topology = TopologyDescription::new(&options_with_hosts(&hosts)).unwrap();

    topology
        .update(primary_description("a:27017", "rs0", &hosts, 1, oid(5)))
        .unwrap();

    // A reply from a primary that lost an election it hasn't noticed yet: same set
    // version, older election id.
    topology
        .update(primary_description("b:27017", "rs0", &hosts, 1, oid(3)))
        .unwrap();

    assert_eq!(
        topology.servers[&address("b:27017")].server_type,
        ServerType::Unknown
    );
    assert_eq!(
        topology.servers[&address("a:27017")].server_type,
        ServerType::RsPrimary
    );
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
}

#[test]
fn newer_set_version_wins() {
    let hosts = ["a:27017", "b:27017"];
    let mut topology = TopologyDescription::new(&options_with_hosts(&hosts)).unwrap();

    topology
        .update(primary_description("a:27017", "rs0", &hosts, 1, oid(5)))
        .unwrap();
    topology
        .update(primary_description("b:27017", "rs0", &hosts, 2, oid(1)))
        .unwrap();

    assert_eq!(
        topology.servers[&address("b:27017")].server_type,
        ServerType::RsPrimary
    );
    assert_eq!(
        topology.servers[&address("a:27017")].server_type,
        ServerType::Unknown
    );
    assert_eq!(topology.max_set_version, Some(2));
}

#[test]
fn network_error_marks_server_unknown_and_topology_no_primary() {
    let hosts = ["a:27017", "b:27017"];
    let mut topology = TopologyDescription::new(&options_with_hosts(&hosts)).unwrap();

    topology
        .update(primary_description("a:27017", "rs0", &hosts, 1, oid(1)))
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);

    let error: Error = ErrorKind::Io(std::sync::Arc::new(
        std::io::ErrorKind::ConnectionReset.into(),
    ))
    .into();
    topology
        .update(ServerDescription::new_from_error(address("a:27017"), &error))
        .unwrap();

    let description = &topology.servers[&address("a:27017")];
    assert_eq!(description.server_type, ServerType::Unknown);
    assert!(description.error_message().is_some());
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
}

#[test]
fn primary_host_list_prunes_departed_members() {
    let mut topology =
        TopologyDescription::new(&options_with_hosts(&["a:27017", "b:27017"])).unwrap();

    // The primary no longer lists b as a member.
    topology
        .update(primary_description("a:27017", "rs0", &["a:27017"], 1, oid(1)))
        .unwrap();

    assert!(!topology.servers.contains_key(&address("b:27017")));
    assert_eq!(topology.servers.len(), 1);
}

#[test]
fn standalone_removed_from_multi_seed_topology() {
    let mut topology =
        TopologyDescription::new(&options_with_hosts(&["a:27017", "b:27017"])).unwrap();

    topology
        .update(standalone_description("a:27017"))
        .unwrap();

    assert!(!topology.servers.contains_key(&address("a:27017")));
    assert_eq!(topology.topology_type, TopologyType::Unknown);
}

#[test]
fn single_seed_standalone_becomes_single_topology() {
    let mut topology = TopologyDescription::new(&options_with_hosts(&["a:27017"])).unwrap();

    topology
        .update(standalone_description("a:27017"))
        .unwrap();

    assert_eq!(topology.topology_type, TopologyType::Single);
    assert_eq!(
        topology.servers[&address("a:27017")].server_type,
        ServerType::Standalone
    );
}

#[test]
fn mongos_switches_topology_to_sharded_and_prunes_others() {
    let mut topology =
        TopologyDescription::new(&options_with_hosts(&["a:27017", "b:27017"])).unwrap();

    topology.update(mongos_description("a:27017")).unwrap();
    assert_eq!(topology.topology_type, TopologyType::Sharded);

    // A replica-set member in a sharded topology is removed.
    topology
        .update(secondary_description("b:27017", "rs0", &["b:27017"]))
        .unwrap();
    assert!(!topology.servers.contains_key(&address("b:27017")));
}

#[test]
fn wire_version_intersection_failure_is_fatal() {
    let mut topology = TopologyDescription::new(&options_with_hosts(&["a:27017"])).unwrap();

    let mut response = base_response();
    response.is_writable_primary = Some(true);
    response.max_wire_version = Some(2);
    let addr = address("a:27017");
    topology
        .update(ServerDescription::new_from_hello_reply(
            addr.clone(),
            reply(&addr, response),
            Duration::from_millis(1),
        ))
        .unwrap();

    assert!(topology.compatibility_error.is_some());

    let criteria = crate::selection_criteria::SelectionCriteria::ReadPreference(
        crate::selection_criteria::ReadPreference::Primary,
    );
    let result = topology.suitable_servers_in_latency_window(&criteria);
    assert!(matches!(
        result.unwrap_err().kind.as_ref(),
        ErrorKind::IncompatibleServer { .. }
    ));
}

#[test]
fn out_of_order_hello_discarded_by_topology_version() {
    let mut topology = TopologyDescription::new(&options_with_hosts(&["a:27017"])).unwrap();
    let process_id = oid(9);
    let addr = address("a:27017");

    let description_with_version = |counter: i64, secondary: bool| {
        let mut response = base_response();
        if secondary {
            response.secondary = Some(true);
        } else {
            response.is_writable_primary = Some(true);
        }
        response.set_name = Some("rs0".to_string());
        response.hosts = Some(vec!["a:27017".to_string()]);
        response.topology_version = Some(crate::sdam::TopologyVersion {
            process_id,
            counter,
        });
        ServerDescription::new_from_hello_reply(
            addr.clone(),
            reply(&addr, response),
            Duration::from_millis(1),
        )
    };

    topology.update(description_with_version(2, false)).unwrap();
    assert_eq!(topology.servers[&addr].server_type, ServerType::RsPrimary);

    // A reply with an older counter from the same process arrived late; it must not
    // regress the description.
    let changed = topology.update(description_with_version(1, true)).unwrap();
    assert!(!changed);
    assert_eq!(topology.servers[&addr].server_type, ServerType::RsPrimary);

    // A newer counter applies normally.
    let changed = topology.update(description_with_version(3, true)).unwrap();
    assert!(changed);
    assert_eq!(topology.servers[&addr].server_type, ServerType::RsSecondary);
}

#[test]
fn cluster_time_never_moves_backward() {
    let mut topology = TopologyDescription::new(&options_with_hosts(&["a:27017"])).unwrap();

    let later = ClusterTime {
        cluster_time: Timestamp {
            time: 100,
            increment: 1,
        },
        signature: doc! {},
    };
    let earlier = ClusterTime {
        cluster_time: Timestamp {
            time: 99,
            increment: 9,
        },
        signature: doc! {},
    };

    topology.advance_cluster_time(&later);
    topology.advance_cluster_time(&earlier);
    assert_eq!(topology.cluster_time(), Some(&later));

    let even_later = ClusterTime {
        cluster_time: Timestamp {
            time: 100,
            increment: 2,
        },
        signature: doc! {},
    };
    topology.advance_cluster_time(&even_later);
    assert_eq!(topology.cluster_time(), Some(&even_later));
}

#[test]
fn diff_reports_membership_changes() {
    let mut topology =
        TopologyDescription::new(&options_with_hosts(&["a:27017"])).unwrap();
    let previous = topology.clone();

    topology
        .update(primary_description(
            "a:27017",
            "rs0",
            &["a:27017", "b:27017"],
            1,
            oid(1),
        ))
        .unwrap();

    let diff = topology.diff(&previous).unwrap();
    let added = address("b:27017");
    assert!(diff.added_addresses.contains(&&added));
    assert!(diff.removed_addresses.is_empty());
    let changed = address("a:27017");
    assert!(diff.changed_servers.contains_key(&&changed));

    assert!(topology.diff(&topology.clone()).is_none());
}

#[test]
fn session_support_follows_logical_session_timeouts() {
    let hosts = ["a:27017", "b:27017"];
    let mut topology = TopologyDescription::new(&options_with_hosts(&hosts)).unwrap();

    topology
        .update(primary_description("a:27017", "rs0", &hosts, 1, oid(1)))
        .unwrap();

    match topology.session_support_status {
        super::SessionSupportStatus::Supported {
            logical_session_timeout,
        } => assert_eq!(logical_session_timeout, Some(Duration::from_secs(30 * 60))),
        other => panic!("expected sessions supported, got {:?}", other),
    }

    // A data-bearing server without a session timeout makes sessions unsupported.
    let mut response = base_response();
    response.secondary = Some(true);
    response.set_name = Some("rs0".to_string());
    response.hosts = Some(hosts.iter().map(|h| h.to_string()).collect());
    response.logical_session_timeout_minutes = None;
    let addr = address("b:27017");
    topology
        .update(ServerDescription::new_from_hello_reply(
            addr.clone(),
            reply(&addr, response),
            Duration::from_millis(1),
        ))
        .unwrap();

    assert_eq!(
        topology.session_support_status,
        super::SessionSupportStatus::Unsupported
    );
}
