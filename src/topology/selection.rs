//! Server selection over an immutable topology description.
use crate::common::{ReadMode, ReadPreference, TagSet};
use crate::connstring::Host;
use crate::error::Error::IncompatibleTopology;
use crate::error::Result;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::thread_rng;

use std::fmt;
use std::time::Duration;

use super::description::{TopologyDescription, TopologyType};
use super::server::{ServerDescription, ServerType};

/// What an operation needs from the server it runs on.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectionCriteria {
    Read(ReadPreference),
    /// The primary, any router, or the single server.
    Write,
}

impl SelectionCriteria {
    pub fn read_preference(&self) -> Option<&ReadPreference> {
        match *self {
            SelectionCriteria::Read(ref read_preference) => Some(read_preference),
            SelectionCriteria::Write => None,
        }
    }
}

impl fmt::Display for SelectionCriteria {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SelectionCriteria::Write => write!(fmt, "write"),
            SelectionCriteria::Read(ref rp) => {
                write!(fmt, "read with mode {}", rp.mode)?;
                if !rp.tag_sets.is_empty() {
                    write!(fmt, ", tag sets {:?}", rp.tag_sets)?;
                }
                if let Some(max) = rp.max_staleness {
                    write!(fmt, ", maxStalenessSeconds {}", max.as_secs())?;
                }
                Ok(())
            }
        }
    }
}

/// The server a secondary's staleness is measured against.
#[derive(Clone, Copy, Debug)]
pub enum StalenessReference<'a> {
    Primary(&'a ServerDescription),
    /// The secondary with the most recent write, used when there is no primary.
    MostRecentSecondary(&'a ServerDescription),
}

fn millis(date: Option<DateTime<Utc>>) -> i64 {
    date.map_or(0, |date| date.timestamp_millis())
}

/// Estimates how far `secondary` lags behind `reference`.
pub fn staleness(
    secondary: &ServerDescription,
    reference: StalenessReference,
    heartbeat_frequency: Duration,
) -> Duration {
    let heartbeat = heartbeat_frequency.as_millis() as i64;

    let estimate = match reference {
        StalenessReference::Primary(primary) => {
            (secondary.last_update_time.timestamp_millis() - millis(secondary.last_write_date))
                - (primary.last_update_time.timestamp_millis() - millis(primary.last_write_date))
                + heartbeat
        }
        StalenessReference::MostRecentSecondary(smax) => {
            millis(smax.last_write_date) - millis(secondary.last_write_date) + heartbeat
        }
    };

    Duration::from_millis(estimate.max(0) as u64)
}

fn staleness_reference(description: &TopologyDescription) -> Option<StalenessReference> {
    if let Some(primary) = description.primary() {
        return Some(StalenessReference::Primary(primary));
    }

    description
        .servers
        .values()
        .filter(|server| server.server_type == ServerType::RSSecondary)
        .max_by_key(|server| millis(server.last_write_date))
        .map(StalenessReference::MostRecentSecondary)
}

fn is_fresh(
    description: &TopologyDescription,
    server: &ServerDescription,
    max_staleness: Option<Duration>,
) -> bool {
    let max = match max_staleness {
        Some(max) => max,
        None => return true,
    };

    if server.server_type != ServerType::RSSecondary {
        return true;
    }

    match staleness_reference(description) {
        Some(reference) => staleness(server, reference, description.heartbeat_frequency) <= max,
        None => true,
    }
}

/// Keeps the servers matching the first tag set that matches anything.
/// An empty list of tag sets matches every server.
pub fn filter_by_tags<'a>(
    servers: Vec<&'a ServerDescription>,
    tag_sets: &[TagSet],
) -> Vec<&'a ServerDescription> {
    if tag_sets.is_empty() {
        return servers;
    }

    for tag_set in tag_sets {
        let matches: Vec<&ServerDescription> = servers
            .iter()
            .cloned()
            .filter(|server| server.matches_tag_set(tag_set))
            .collect();

        if !matches.is_empty() {
            return matches;
        }
    }

    Vec::new()
}

fn servers_of_type<'a>(
    description: &'a TopologyDescription,
    types: &[ServerType],
) -> Vec<&'a ServerDescription> {
    description
        .servers
        .values()
        .filter(|server| types.contains(&server.server_type))
        .collect()
}

fn suitable_for_replica_set<'a>(
    description: &'a TopologyDescription,
    read_preference: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    let primary = description.primary();

    let eligible_secondaries = || {
        let fresh = servers_of_type(description, &[ServerType::RSSecondary])
            .into_iter()
            .filter(|server| is_fresh(description, server, read_preference.max_staleness))
            .collect();
        filter_by_tags(fresh, &read_preference.tag_sets)
    };

    match read_preference.mode {
        ReadMode::Primary => primary.into_iter().collect(),
        ReadMode::PrimaryPreferred => match primary {
            Some(primary) => vec![primary],
            None => eligible_secondaries(),
        },
        ReadMode::Secondary => eligible_secondaries(),
        ReadMode::SecondaryPreferred => {
            let secondaries = eligible_secondaries();
            if secondaries.is_empty() {
                primary.into_iter().collect()
            } else {
                secondaries
            }
        }
        ReadMode::Nearest => {
            let members = servers_of_type(
                description,
                &[ServerType::RSPrimary, ServerType::RSSecondary],
            )
            .into_iter()
            .filter(|server| is_fresh(description, server, read_preference.max_staleness))
            .collect();
            filter_by_tags(members, &read_preference.tag_sets)
        }
    }
}

/// Returns the servers eligible for `criteria` before latency narrowing.
///
/// Fails immediately when the topology is incompatible or the read
/// preference can never be satisfied.
pub fn select_suitable<'a>(
    description: &'a TopologyDescription,
    criteria: &SelectionCriteria,
) -> Result<Vec<&'a ServerDescription>> {
    if let Some(read_preference) = criteria.read_preference() {
        read_preference.validate(description.heartbeat_frequency)?;
    }

    if !description.compatible {
        return Err(IncompatibleTopology(
            description
                .compatibility_error
                .clone()
                .unwrap_or_else(|| "The topology is incompatible with this driver.".to_owned()),
        ));
    }

    let suitable = match description.topology_type {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single => description
            .servers
            .values()
            .filter(|server| server.server_type.is_known())
            .collect(),
        TopologyType::Sharded => {
            servers_of_type(description, &[ServerType::Mongos, ServerType::LoadBalancer])
        }
        TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
            match *criteria {
                SelectionCriteria::Write => description.primary().into_iter().collect(),
                SelectionCriteria::Read(ref read_preference) => {
                    suitable_for_replica_set(description, read_preference)
                }
            }
        }
    };

    Ok(suitable)
}

/// Narrows `servers` to those within `local_threshold` of the fastest one.
/// A server without a measured round trip counts as instantaneous.
pub fn in_latency_window<'a>(
    servers: Vec<&'a ServerDescription>,
    local_threshold: Duration,
) -> Vec<&'a ServerDescription> {
    let rtt = |server: &ServerDescription| server.round_trip_time.unwrap_or(0.0);

    let fastest = servers
        .iter()
        .map(|server| rtt(server))
        .fold(None, |min: Option<f64>, value| {
            Some(min.map_or(value, |min| min.min(value)))
        });

    let fastest = match fastest {
        Some(fastest) => fastest,
        None => return servers,
    };

    let limit = fastest + local_threshold.as_secs_f64() * 1000.0;
    servers.into_iter().filter(|server| rtt(server) <= limit).collect()
}

/// Picks one server uniformly at random.
pub fn pick_random<'a>(servers: &[&'a ServerDescription]) -> Option<&'a ServerDescription> {
    servers.choose(&mut thread_rng()).cloned()
}

/// Runs the full selection pipeline once against a snapshot.
pub fn select<'a>(
    description: &'a TopologyDescription,
    criteria: &SelectionCriteria,
) -> Result<Option<&'a ServerDescription>> {
    let suitable = select_suitable(description, criteria)?;
    let window = in_latency_window(suitable, description.local_threshold);
    Ok(pick_random(&window))
}

// Whether the server's role could ever satisfy the criteria in this topology.
fn role_matches(
    description: &TopologyDescription,
    server: &ServerDescription,
    criteria: &SelectionCriteria,
) -> bool {
    match description.topology_type {
        TopologyType::Unknown => false,
        TopologyType::Single => server.server_type.is_known(),
        TopologyType::Sharded => {
            server.server_type == ServerType::Mongos
                || server.server_type == ServerType::LoadBalancer
        }
        TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
            let mode = match *criteria {
                SelectionCriteria::Write => ReadMode::Primary,
                SelectionCriteria::Read(ref rp) => rp.mode,
            };
            match (mode, server.server_type) {
                (ReadMode::Primary, ServerType::RSPrimary) => true,
                (ReadMode::Secondary, ServerType::RSSecondary) => true,
                (ReadMode::Primary, _) | (ReadMode::Secondary, _) => false,
                (_, ServerType::RSPrimary) | (_, ServerType::RSSecondary) => true,
                _ => false,
            }
        }
    }
}

/// Explains, per known server, why it was not selected for `criteria`.
pub fn explain_rejections(
    description: &TopologyDescription,
    criteria: &SelectionCriteria,
) -> Vec<(Host, String)> {
    let selected: Vec<Host> = select_suitable(description, criteria)
        .map(|suitable| {
            in_latency_window(suitable, description.local_threshold)
                .into_iter()
                .map(|server| server.address.clone())
                .collect()
        })
        .unwrap_or_default();

    let read_preference = criteria.read_preference();

    description
        .server_addresses()
        .into_iter()
        .filter(|host| !selected.contains(host))
        .map(|host| {
            let server = &description.servers[&host];

            let reason = if !description.compatible {
                "the topology is incompatible with this driver".to_owned()
            } else if !server.server_type.is_known() {
                match server.error {
                    Some(ref error) => format!("server is {}: {}", server.server_type, error),
                    None => format!("server is {} and has not been checked", server.server_type),
                }
            } else if !role_matches(description, server, criteria) {
                format!(
                    "a {} cannot serve a {} in a {} topology",
                    server.server_type, criteria, description.topology_type
                )
            } else if !is_fresh(description, server, read_preference.and_then(|rp| rp.max_staleness))
            {
                "server is too stale".to_owned()
            } else if read_preference.map_or(false, |rp| {
                filter_by_tags(vec![server], &rp.tag_sets).is_empty()
            }) {
                "server does not match any tag set".to_owned()
            } else if server.round_trip_time.is_some() {
                "server is outside the latency window or not preferred".to_owned()
            } else {
                "server was not preferred".to_owned()
            };

            (host, reason)
        })
        .collect()
}

impl TopologyDescription {
    /// Whether any server could serve reads with `read_preference` right now.
    pub fn has_readable_server(&self, read_preference: &ReadPreference) -> bool {
        select_suitable(self, &SelectionCriteria::Read(read_preference.clone()))
            .map_or(false, |suitable| !suitable.is_empty())
    }

    /// Whether any server could accept writes right now.
    pub fn has_writable_server(&self) -> bool {
        select_suitable(self, &SelectionCriteria::Write).map_or(false, |suitable| !suitable.is_empty())
    }
}
