//! End-to-end properties of the state machine and the selector, driven with
//! generated update sequences.
use mongodb_sdam::common::{ReadMode, ReadPreference};
use mongodb_sdam::connstring::Host;
use mongodb_sdam::error::Error;
use mongodb_sdam::topology::description::{TopologyDescription, TopologyType};
use mongodb_sdam::topology::selection::{self, SelectionCriteria};
use mongodb_sdam::topology::server::{IsMasterResult, ServerDescription, ServerType};

use bson::oid::ObjectId;
use bson::{Bson, Document};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use crate::support::{self, host};

const MEMBERS: [&str; 3] = ["a", "b", "c"];

fn seeds() -> Vec<Host> {
    MEMBERS.iter().map(|name| host(name)).collect()
}

fn unknown_topology() -> TopologyDescription {
    TopologyDescription::new(&seeds(), None, Duration::from_secs(10), Duration::from_millis(15))
}

fn election_id(n: u8) -> ObjectId {
    let mut bytes = [0u8; 12];
    bytes[11] = n;
    ObjectId::with_bytes(bytes)
}

fn described(name: &str, reply: Document) -> ServerDescription {
    let ismaster = IsMasterResult::new(reply).unwrap();
    ServerDescription::from_is_master(host(name), ismaster, Some(1.0))
}

fn primary_report(name: &str, set_version: i32, election: u8) -> ServerDescription {
    let mut reply = support::primary("rs0", &MEMBERS);
    reply.insert("setVersion", Bson::I32(set_version));
    reply.insert("electionId", Bson::ObjectId(election_id(election)));
    described(name, reply)
}

fn random_update<R: Rng>(rng: &mut R) -> ServerDescription {
    let name = *MEMBERS.choose(rng).unwrap();
    match rng.gen_range(0, 4) {
        0 => ServerDescription::with_error(host(name), "simulated network error".to_owned()),
        1 => described(name, support::secondary("rs0", &MEMBERS)),
        _ => primary_report(name, rng.gen_range(1, 4), rng.gen_range(1, 4)),
    }
}

fn primaries(description: &TopologyDescription) -> Vec<Host> {
    description
        .servers
        .values()
        .filter(|server| server.server_type == ServerType::RSPrimary)
        .map(|server| server.address.clone())
        .collect()
}

#[test]
fn primary_fails_over_to_a_member_with_the_same_election() {
    let topology = unknown_topology().update(primary_report("a", 1, 1));
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.primary().map(|p| p.address.clone()), Some(host("a")));
    assert_eq!(topology.set_name, Some("rs0".to_owned()));

    let topology = topology.update(ServerDescription::with_error(
        host("a"),
        "simulated network error".to_owned(),
    ));
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
    assert_eq!(topology.servers[&host("a")].server_type, ServerType::Unknown);
    assert_eq!(topology.servers.len(), 3);
    assert_eq!(topology.servers[&host("b")].server_type, ServerType::Unknown);
    assert_eq!(topology.servers[&host("c")].server_type, ServerType::Unknown);

    // Same (setVersion, electionId) as the last recorded primary: not stale.
    let topology = topology.update(primary_report("b", 1, 1));
    assert_eq!(topology.primary().map(|p| p.address.clone()), Some(host("b")));
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
}

#[test]
fn stale_primary_never_displaces_the_current_one() {
    let topology = unknown_topology().update(primary_report("a", 2, 2));

    for &(set_version, election) in &[(1, 3), (2, 1), (1, 1)] {
        let next = topology.update(primary_report("b", set_version, election));
        assert_eq!(primaries(&next), vec![host("a")]);
        assert_eq!(next.servers[&host("b")].server_type, ServerType::Unknown);
        assert!(next.servers[&host("b")].error.is_some());
        assert_eq!(next.max_set_version, Some(2));
        assert_eq!(next.max_election_id, Some(election_id(2)));
    }
}

#[test]
fn random_updates_never_produce_two_primaries() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..200 {
        let mut topology = unknown_topology();
        for _ in 0..30 {
            topology = topology.update(random_update(&mut rng));
            assert!(primaries(&topology).len() <= 1, "two primaries in {}", topology);

            let has_primary = topology.topology_type == TopologyType::ReplicaSetWithPrimary;
            assert_eq!(has_primary, topology.primary().is_some());
        }
    }
}

// Equality up to the update timestamps that fresh Unknown descriptions carry.
fn same_topology(left: &TopologyDescription, right: &TopologyDescription) -> bool {
    left.topology_type == right.topology_type
        && left.set_name == right.set_name
        && left.max_set_version == right.max_set_version
        && left.max_election_id == right.max_election_id
        && left.compatible == right.compatible
        && left.logical_session_timeout_minutes == right.logical_session_timeout_minutes
        && left.servers.len() == right.servers.len()
        && left.servers.iter().all(|(host, server)| {
            right
                .servers
                .get(host)
                .map_or(false, |other| server.same_state_as(other))
        })
}

#[test]
fn applying_an_update_twice_changes_nothing_more() {
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..200 {
        let mut topology = unknown_topology();
        for _ in 0..10 {
            topology = topology.update(random_update(&mut rng));
        }

        let update = random_update(&mut rng);
        let once = topology.update(update.clone());
        let twice = once.update(update);
        assert!(same_topology(&once, &twice), "{} became {}", once, twice);
    }
}

fn secondary_with_rtt(name: &str, rtt: f64) -> ServerDescription {
    let mut server = described(name, support::secondary("rs0", &MEMBERS));
    server.round_trip_time = Some(rtt);
    server
}

#[test]
fn primary_preferred_without_primary_stays_in_the_latency_window() {
    let topology = unknown_topology()
        .update(secondary_with_rtt("a", 5.0))
        .update(secondary_with_rtt("b", 40.0));
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);

    let criteria = SelectionCriteria::Read(ReadPreference::new(ReadMode::PrimaryPreferred, None));
    for _ in 0..100 {
        let selected = selection::select(&topology, &criteria).unwrap().unwrap();
        assert_eq!(selected.address, host("a"));
    }
}

#[test]
fn nearest_never_exceeds_the_latency_window() {
    let mut rng = StdRng::seed_from_u64(42);
    let criteria = SelectionCriteria::Read(ReadPreference::new(ReadMode::Nearest, None));

    for _ in 0..100 {
        let mut topology = unknown_topology();
        for name in MEMBERS.iter() {
            topology = topology.update(secondary_with_rtt(name, rng.gen_range(0.0, 100.0)));
        }

        let fastest = topology
            .servers
            .values()
            .filter_map(|server| server.round_trip_time)
            .fold(::std::f64::MAX, f64::min);

        let selected = selection::select(&topology, &criteria).unwrap().unwrap();
        assert!(selected.round_trip_time.unwrap() <= fastest + 15.0);
    }
}

#[test]
fn secondary_reads_reject_small_staleness_before_looking_at_servers() {
    // Nothing about this topology could ever satisfy the read, which must
    // not matter.
    let topology = TopologyDescription::new(&[], None, Duration::from_secs(10), Duration::from_millis(15));

    for secs in &[1, 10, 19] {
        let criteria = SelectionCriteria::Read(
            ReadPreference::new(ReadMode::Secondary, None).with_max_staleness(Duration::from_secs(*secs)),
        );
        match selection::select(&topology, &criteria) {
            Err(Error::ConfigurationError(_)) => (),
            other => panic!("expected a configuration error for {}s, got {:?}", secs, other),
        }
    }
}
