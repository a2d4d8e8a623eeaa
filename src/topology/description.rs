//! The topology description and the state transitions that produce it.
use crate::connstring::Host;
use crate::error::Error::{self, ArgumentError};
use crate::error::Result;

use bson::oid;
use tracing::{debug, info, warn};

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::server::{ServerDescription, ServerType};

/// The oldest wire version this driver can speak (MongoDB 2.6).
pub const MIN_WIRE_VERSION: i32 = 2;
/// The newest wire version this driver can speak (MongoDB 4.2).
pub const MAX_WIRE_VERSION: i32 = 8;

/// Describes the type of topology for a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    Unknown,
}

impl FromStr for TopologyType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Single" => TopologyType::Single,
            "ReplicaSetNoPrimary" => TopologyType::ReplicaSetNoPrimary,
            "ReplicaSetWithPrimary" => TopologyType::ReplicaSetWithPrimary,
            "Sharded" => TopologyType::Sharded,
            "Unknown" => TopologyType::Unknown,
            _ => return Err(ArgumentError(format!("Unknown topology type '{}'.", s))),
        })
    }
}

impl fmt::Display for TopologyType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}

/// Topology information gathered from server set monitoring.
///
/// A description is never modified once published; `update` returns a new one.
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    /// The replica set name, once configured or discovered.
    pub set_name: Option<String>,
    /// The largest set version seen from a primary.
    pub max_set_version: Option<i32>,
    /// The largest election id seen from a primary.
    pub max_election_id: Option<oid::ObjectId>,
    /// Known servers within the topology.
    pub servers: HashMap<Host, ServerDescription>,
    /// False when some server's wire version range doesn't overlap the driver's.
    pub compatible: bool,
    pub compatibility_error: Option<String>,
    /// Minimum across data-bearing servers; `None` if any of them lacks one.
    pub logical_session_timeout_minutes: Option<i64>,
    /// The server connection health check frequency.
    pub heartbeat_frequency: Duration,
    /// Width of the selection latency window.
    pub local_threshold: Duration,
    // Whether the seed list had exactly one host.
    single_seed: bool,
}

impl TopologyDescription {
    /// Returns the initial description for a seed list. A configured replica
    /// set name starts the topology as ReplicaSetNoPrimary.
    pub fn new(
        seeds: &[Host],
        set_name: Option<String>,
        heartbeat_frequency: Duration,
        local_threshold: Duration,
    ) -> TopologyDescription {
        let topology_type = if set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        TopologyDescription {
            topology_type: topology_type,
            set_name: set_name,
            max_set_version: None,
            max_election_id: None,
            servers: seeds
                .iter()
                .map(|host| (host.clone(), ServerDescription::new(host.clone())))
                .collect(),
            compatible: true,
            compatibility_error: None,
            logical_session_timeout_minutes: None,
            heartbeat_frequency: heartbeat_frequency,
            local_threshold: local_threshold,
            single_seed: seeds.len() == 1,
        }
    }

    /// Returns the replica set primary, if one is known.
    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|server| server.server_type == ServerType::RSPrimary)
    }

    /// Known addresses in a stable order.
    pub fn server_addresses(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.servers.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Returns a new description reflecting `description`, leaving `self` untouched.
    pub fn update(&self, description: ServerDescription) -> TopologyDescription {
        let mut next = self.clone();
        next.apply(description);
        next
    }

    fn apply(&mut self, description: ServerDescription) {
        let host = description.address.clone();

        // Servers that have already been removed stay removed.
        if !self.servers.contains_key(&host) {
            debug!(%host, "ignoring description for a server no longer in the topology");
            return;
        }

        let previous_type = self.topology_type;
        let stype = description.server_type;
        self.servers.insert(host.clone(), description.clone());

        match self.topology_type {
            TopologyType::Single => (),
            TopologyType::Unknown => match stype {
                ServerType::Standalone => self.update_unknown_with_standalone(&host),
                ServerType::Mongos | ServerType::LoadBalancer => {
                    self.topology_type = TopologyType::Sharded
                }
                ServerType::RSPrimary => self.update_rs_from_primary(&description),
                ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                    self.topology_type = TopologyType::ReplicaSetNoPrimary;
                    self.update_rs_without_primary(&description);
                }
                _ => (),
            },
            TopologyType::Sharded => match stype {
                ServerType::Unknown | ServerType::Mongos | ServerType::LoadBalancer => (),
                _ => self.remove_server(&host, "it is not a mongos"),
            },
            TopologyType::ReplicaSetNoPrimary => match stype {
                ServerType::Standalone | ServerType::Mongos | ServerType::LoadBalancer => {
                    self.remove_server(&host, "it is not a replica set member")
                }
                ServerType::RSPrimary => self.update_rs_from_primary(&description),
                ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                    self.update_rs_without_primary(&description)
                }
                _ => (),
            },
            TopologyType::ReplicaSetWithPrimary => match stype {
                ServerType::Standalone | ServerType::Mongos | ServerType::LoadBalancer => {
                    self.remove_server(&host, "it is not a replica set member");
                    self.check_if_has_primary();
                }
                ServerType::RSPrimary => self.update_rs_from_primary(&description),
                ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                    self.update_rs_with_primary_from_member(&description)
                }
                _ => self.check_if_has_primary(),
            },
        }

        self.update_compatibility();
        self.update_logical_session_timeout();

        if previous_type != self.topology_type {
            info!(from = %previous_type, to = %self.topology_type, "topology type changed");
        }
    }

    fn remove_server(&mut self, host: &Host, reason: &str) {
        if self.servers.remove(host).is_some() {
            warn!(%host, reason, "removing server from topology");
        }
    }

    // Sets the correct replica set topology type.
    fn check_if_has_primary(&mut self) {
        self.topology_type = if self.primary().is_some() {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    // Updates an unknown topology with a new standalone server description.
    fn update_unknown_with_standalone(&mut self, host: &Host) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.remove_server(host, "a standalone cannot join a multi-seed topology");
        }
    }

    // Whether a primary's (setVersion, electionId) is older than the largest seen.
    fn is_stale_primary(&self, description: &ServerDescription) -> bool {
        let set_version_order = match (self.max_set_version, description.set_version) {
            (Some(max), Some(version)) => max.cmp(&version),
            _ => Ordering::Equal,
        };

        match set_version_order {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match (self.max_election_id.as_ref(), description.election_id.as_ref()) {
                (Some(max), Some(id)) => max.bytes() > id.bytes(),
                _ => false,
            },
        }
    }

    // Updates a replica set topology with a new primary server description.
    fn update_rs_from_primary(&mut self, description: &ServerDescription) {
        let host = &description.address;

        if self.set_name.is_none() {
            self.set_name = description.set_name.clone();
        } else if self.set_name != description.set_name {
            // Primary found, but it doesn't have the setName
            // provided by the user or previously discovered.
            self.remove_server(host, "its replica set name does not match the topology's");
            self.check_if_has_primary();
            return;
        }

        if description.set_version.is_some() && description.election_id.is_some() {
            if self.is_stale_primary(description) {
                warn!(%host, "ignoring stale primary report");
                self.servers.insert(
                    host.clone(),
                    ServerDescription::with_error(
                        host.clone(),
                        "primary marked stale due to electionId/setVersion mismatch".to_owned(),
                    ),
                );
                self.check_if_has_primary();
                return;
            }

            self.max_election_id = description.election_id.clone();
        }

        if let Some(version) = description.set_version {
            if self.max_set_version.map_or(true, |max| version > max) {
                self.max_set_version = Some(version);
            }
        }

        // Invalidate any old primaries
        let old_primaries: Vec<Host> = self
            .servers
            .iter()
            .filter(|&(other, server)| other != host && server.server_type == ServerType::RSPrimary)
            .map(|(other, _)| other.clone())
            .collect();

        for old in old_primaries {
            debug!(host = %old, "invalidating previous primary");
            self.servers.insert(old.clone(), ServerDescription::new(old));
        }

        self.add_missing_hosts(description);

        // Remove hosts that are not reported by the primary.
        let unlisted: Vec<Host> = self
            .servers
            .keys()
            .filter(|known| !description.all_hosts().any(|listed| listed == *known))
            .cloned()
            .collect();

        for known in unlisted {
            self.remove_server(&known, "the primary does not list it");
        }

        self.check_if_has_primary();
    }

    // Updates a replica set topology with a missing primary.
    fn update_rs_without_primary(&mut self, description: &ServerDescription) {
        let host = &description.address;

        if self.set_name.is_none() {
            self.set_name = description.set_name.clone();
        } else if self.set_name != description.set_name {
            self.remove_server(host, "its replica set name does not match the topology's");
            return;
        }

        self.add_missing_hosts(description);

        if let Some(ref me) = description.me {
            if me != host {
                self.remove_server(host, "it reports a different address for itself");
                return;
            }
        }

        if let Some(ref primary) = description.primary {
            let unknown = self
                .servers
                .get(primary)
                .map_or(false, |server| server.server_type == ServerType::Unknown);

            if unknown {
                self.servers.insert(
                    primary.clone(),
                    ServerDescription {
                        server_type: ServerType::PossiblePrimary,
                        ..ServerDescription::new(primary.clone())
                    },
                );
            }
        }
    }

    // Updates a replica set topology with an updated member description.
    fn update_rs_with_primary_from_member(&mut self, description: &ServerDescription) {
        let host = &description.address;

        if self.set_name != description.set_name {
            self.remove_server(host, "its replica set name does not match the topology's");
        } else if let Some(ref me) = description.me {
            if me != host {
                self.remove_server(host, "it reports a different address for itself");
            }
        }

        self.check_if_has_primary();
    }

    // Adds hosts reported by a member that are not yet part of the topology.
    fn add_missing_hosts(&mut self, description: &ServerDescription) {
        for host in description.all_hosts() {
            if !self.servers.contains_key(host) {
                debug!(%host, "discovered new server");
                self.servers.insert(host.clone(), ServerDescription::new(host.clone()));
            }
        }
    }

    fn update_compatibility(&mut self) {
        self.compatible = true;
        self.compatibility_error = None;

        let mut servers: Vec<&ServerDescription> = self
            .servers
            .values()
            .filter(|server| server.server_type.is_known())
            .collect();
        servers.sort_by(|a, b| a.address.cmp(&b.address));

        for server in servers {
            let error = if server.min_wire_version > MAX_WIRE_VERSION {
                Some(format!(
                    "Server at {} requires wire version {}, but this version of the driver \
                     only supports up to {}.",
                    server.address, server.min_wire_version, MAX_WIRE_VERSION
                ))
            } else if server.max_wire_version < MIN_WIRE_VERSION {
                Some(format!(
                    "Server at {} reports wire version {}, but this version of the driver \
                     requires at least {}.",
                    server.address, server.max_wire_version, MIN_WIRE_VERSION
                ))
            } else {
                None
            };

            if error.is_some() {
                self.compatible = false;
                self.compatibility_error = error;
                return;
            }
        }
    }

    fn update_logical_session_timeout(&mut self) {
        let mut minimum: Option<i64> = None;

        for server in self.servers.values() {
            if !server.server_type.is_data_bearing() {
                continue;
            }

            match server.logical_session_timeout_minutes {
                None => {
                    self.logical_session_timeout_minutes = None;
                    return;
                }
                Some(timeout) => {
                    minimum = Some(minimum.map_or(timeout, |current| current.min(timeout)));
                }
            }
        }

        self.logical_session_timeout_minutes = minimum;
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{{ type: {}", self.topology_type)?;
        if let Some(ref name) = self.set_name {
            write!(fmt, ", setName: {}", name)?;
        }
        write!(fmt, ", servers: [")?;

        for (i, host) in self.server_addresses().iter().enumerate() {
            let server = &self.servers[host];
            if i > 0 {
                write!(fmt, ", ")?;
            }
            write!(fmt, "{{ address: {}, type: {}", host, server.server_type)?;
            if let Some(rtt) = server.round_trip_time {
                write!(fmt, ", rtt: {:.1}ms", rtt)?;
            }
            if let Some(ref error) = server.error {
                write!(fmt, ", error: {}", error)?;
            }
            write!(fmt, " }}")?;
        }

        write!(fmt, "] }}")
    }
}
