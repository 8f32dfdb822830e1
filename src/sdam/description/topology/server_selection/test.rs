use std::{collections::HashMap, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use super::attempt_to_select_server;
use crate::{
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::{
            server::ServerDescription,
            topology::{test as topology_test, TopologyDescription},
        },
        Server,
    },
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};

fn address(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn options_with_hosts(hosts: &[&str]) -> ClientOptions {
    ClientOptions::builder()
        .hosts(hosts.iter().map(|h| address(h)).collect::<Vec<_>>())
        .build()
}

/// A replica set topology with one primary and two secondaries, with the given RTTs.
fn replica_set() -> TopologyDescription {
    let hosts = ["a:27017", "b:27017", "c:27017"];
    let mut topology = TopologyDescription::new(&options_with_hosts(&hosts)).unwrap();
    topology
        .update(topology_test::primary_description(
            "a:27017",
            "rs0",
            &hosts,
            1,
            bson::oid::ObjectId::new(),
        ))
        .unwrap();
    topology
        .update(topology_test::secondary_description("b:27017", "rs0", &hosts))
        .unwrap();
    topology
        .update(topology_test::secondary_description("c:27017", "rs0", &hosts))
        .unwrap();
    topology
}

fn set_rtt(topology: &mut TopologyDescription, addr: &str, rtt: Duration) {
    topology
        .servers
        .get_mut(&address(addr))
        .unwrap()
        .average_round_trip_time = Some(rtt);
}

fn set_tags(topology: &mut TopologyDescription, addr: &str, tags: &[(&str, &str)]) {
    let tag_set: TagSet = tags
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let description = topology.servers.get_mut(&address(addr)).unwrap();
    if let Ok(Some(ref mut reply)) = description.reply {
        reply.command_response.tags = Some(tag_set);
    }
}

fn suitable_addresses(
    topology: &TopologyDescription,
    criteria: &SelectionCriteria,
) -> Vec<ServerAddress> {
    let mut addresses: Vec<ServerAddress> = topology
        .suitable_servers_in_latency_window(criteria)
        .unwrap()
        .into_iter()
        .map(|description| description.address.clone())
        .collect();
    addresses.sort_by_key(|a| a.to_string());
    addresses
}

fn servers_for(topology: &TopologyDescription) -> HashMap<ServerAddress, Arc<Server>> {
    let options = options_with_hosts(&["a:27017"]);
    topology
        .servers
        .keys()
        .map(|addr| (addr.clone(), Server::new(addr.clone(), &options)))
        .collect()
}

#[test]
fn primary_mode_selects_only_the_primary() {
    let topology = replica_set();
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    assert_eq!(suitable_addresses(&topology, &criteria), vec![address("a:27017")]);
}

#[test]
fn secondary_mode_excludes_the_primary() {
    let topology = replica_set();
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::secondary());
    assert_eq!(
        suitable_addresses(&topology, &criteria),
        vec![address("b:27017"), address("c:27017")]
    );
}

#[test]
fn primary_preferred_falls_back_to_secondaries() {
    let mut topology = replica_set();
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred {
        options: Default::default(),
    });
    assert_eq!(suitable_addresses(&topology, &criteria), vec![address("a:27017")]);

    // Remove the primary; the secondaries become eligible.
    let error = crate::error::Error::internal("gone");
    topology
        .update(ServerDescription::new_from_error(address("a:27017"), &error))
        .unwrap();
    assert_eq!(
        suitable_addresses(&topology, &criteria),
        vec![address("b:27017"), address("c:27017")]
    );
}

#[test]
fn nearest_mode_includes_all_data_bearing_members() {
    let topology = replica_set();
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::nearest());
    assert_eq!(
        suitable_addresses(&topology, &criteria),
        vec![address("a:27017"), address("b:27017"), address("c:27017")]
    );
}

#[test]
fn tag_sets_filter_candidates_in_order() {
    let mut topology = replica_set();
    set_tags(&mut topology, "b:27017", &[("dc", "east")]);
    set_tags(&mut topology, "c:27017", &[("dc", "west")]);

    let east: TagSet = [("dc".to_string(), "east".to_string())].into_iter().collect();
    let moon: TagSet = [("dc".to_string(), "moon".to_string())].into_iter().collect();

    // The first tag set with any match wins.
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: ReadPreferenceOptions::builder()
            .tag_sets(vec![moon.clone(), east.clone()])
            .build(),
    });
    assert_eq!(suitable_addresses(&topology, &criteria), vec![address("b:27017")]);

    // An empty tag set matches every server.
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: ReadPreferenceOptions::builder()
            .tag_sets(vec![moon.clone(), TagSet::new()])
            .build(),
    });
    assert_eq!(
        suitable_addresses(&topology, &criteria),
        vec![address("b:27017"), address("c:27017")]
    );

    // No tag set matches: no candidates.
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: ReadPreferenceOptions::builder()
            .tag_sets(vec![moon])
            .build(),
    });
    assert!(suitable_addresses(&topology, &criteria).is_empty());
}

#[test]
fn latency_window_excludes_slow_servers() {
    let mut topology = replica_set();
    set_rtt(&mut topology, "a:27017", Duration::from_millis(5));
    set_rtt(&mut topology, "b:27017", Duration::from_millis(10));
    // Outside the 15ms default window around the 5ms minimum.
    set_rtt(&mut topology, "c:27017", Duration::from_millis(100));

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::nearest());
    assert_eq!(
        suitable_addresses(&topology, &criteria),
        vec![address("a:27017"), address("b:27017")]
    );
}

#[test]
fn deprioritized_server_avoided_when_alternative_exists() {
    let mut topology =
        TopologyDescription::new(&options_with_hosts(&["a:27017", "b:27017"])).unwrap();
    topology
        .update(topology_test::mongos_description("a:27017"))
        .unwrap();
    topology
        .update(topology_test::mongos_description("b:27017"))
        .unwrap();
    let servers = servers_for(&topology);

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    let deprioritized = vec![address("a:27017")];

    // With b available, the retry must never land on the deprioritized a.
    for _ in 0..50 {
        let selected =
            attempt_to_select_server(&criteria, &topology, &servers, &deprioritized)
                .unwrap()
                .expect("a server should be selectable");
        assert_eq!(selected.address(), &address("b:27017"));
    }
}

#[test]
fn deprioritization_is_best_effort() {
    let mut topology = TopologyDescription::new(&options_with_hosts(&["a:27017"])).unwrap();
    topology
        .update(topology_test::mongos_description("a:27017"))
        .unwrap();
    let servers = servers_for(&topology);

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    // The only server is deprioritized; selection must restore it rather than fail.
    let deprioritized = vec![address("a:27017")];
    let selected = attempt_to_select_server(&criteria, &topology, &servers, &deprioritized)
        .unwrap()
        .expect("deprioritization must not block the only viable server");
    assert_eq!(selected.address(), &address("a:27017"));
}

#[test]
fn unknown_topology_selects_nothing() {
    let topology = TopologyDescription::new(&options_with_hosts(&["a:27017"])).unwrap();
    let servers = servers_for(&topology);
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    let selected = attempt_to_select_server(&criteria, &topology, &servers, &[]).unwrap();
    assert!(selected.is_none());
}

#[test]
fn predicate_criteria_filters_servers() {
    let topology = replica_set();
    let servers = servers_for(&topology);
    let target = address("c:27017");
    let target_for_predicate = target.clone();
    let criteria = SelectionCriteria::Predicate(Arc::new(move |info| {
        info.address() == &target_for_predicate
    }));

    let selected = attempt_to_select_server(&criteria, &topology, &servers, &[])
        .unwrap()
        .expect("predicate should match");
    assert_eq!(selected.address(), &target);
}
