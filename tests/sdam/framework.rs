use mongodb_sdam::options::ClientOptions;
use mongodb_sdam::topology::description::TopologyDescription;
use mongodb_sdam::topology::server::{IsMasterResult, ServerDescription};

use serde_json::Value;

use crate::json::sdam::reader::SuiteContainer;
use crate::json::suite_files;

pub fn run_suite(file: &str) {
    let json = Value::from_file(file).unwrap();
    let suite = json.get_suite().unwrap();
    let options = ClientOptions::parse(&suite.uri).unwrap();

    let mut description = TopologyDescription::new(
        &options.hosts,
        options.replica_set.clone(),
        options.heartbeat_frequency,
        options.local_threshold,
    );

    for (i, phase) in suite.phases.into_iter().enumerate() {
        let context = format!("{} ({}), phase {}", file, suite.description, i + 1);

        for (host, response) in phase.operation.data {
            let server = if response.is_empty() {
                ServerDescription::with_error(host, "Simulated network error.".to_owned())
            } else {
                let ismaster = IsMasterResult::new(response).unwrap();
                ServerDescription::from_is_master(host, ismaster, Some(0.0))
            };

            description = description.update(server);
        }

        // Check server and topology descriptions.
        let outcome = phase.outcome;

        assert_eq!(
            outcome.servers.len(),
            description.servers.len(),
            "{}: server count in {}",
            context,
            description
        );

        for (host, expected) in outcome.servers.iter() {
            let actual = match description.servers.get(host) {
                Some(actual) => actual,
                None => panic!("{}: missing host {} in {}", context, host, description),
            };

            assert_eq!(expected.stype, actual.server_type, "{}: type of {}", context, host);
            assert_eq!(expected.set_name, actual.set_name, "{}: setName of {}", context, host);

            if let Some(ref set_version) = expected.set_version {
                assert_eq!(*set_version, actual.set_version, "{}: setVersion of {}", context, host);
            }
            if let Some(ref election_id) = expected.election_id {
                assert_eq!(*election_id, actual.election_id, "{}: electionId of {}", context, host);
            }
        }

        assert_eq!(outcome.ttype, description.topology_type, "{}: topology type", context);
        assert_eq!(outcome.set_name, description.set_name, "{}: setName", context);
        assert_eq!(
            outcome.logical_session_timeout_minutes,
            description.logical_session_timeout_minutes,
            "{}: logicalSessionTimeoutMinutes",
            context
        );
        assert_eq!(outcome.compatible, description.compatible, "{}: compatible", context);

        if let Some(ref max_set_version) = outcome.max_set_version {
            assert_eq!(*max_set_version, description.max_set_version, "{}: maxSetVersion", context);
        }
        if let Some(ref max_election_id) = outcome.max_election_id {
            assert_eq!(*max_election_id, description.max_election_id, "{}: maxElectionId", context);
        }
    }
}

pub fn run_dir(dir: &str) {
    for file in suite_files(dir) {
        run_suite(&file);
    }
}
