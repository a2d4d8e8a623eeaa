use crate::connstring::{self, Host};
use crate::error::Error::{self, ArgumentError};
use crate::error::Result;

use bson::{oid, Bson, Document};
use chrono::{DateTime, Utc};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const MONGOS_MSG: &str = "isdbgrid";

/// Describes the server role within a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerType {
    /// Standalone server.
    Standalone,
    /// Shard router.
    Mongos,
    /// Replica set primary.
    RSPrimary,
    /// Replica set secondary.
    RSSecondary,
    /// Replica set arbiter.
    RSArbiter,
    /// Replica set member of some other type, such as a hidden or recovering member.
    RSOther,
    /// Replica set member that has not been initiated or was removed from its set.
    RSGhost,
    /// A load balancer fronting a set of routers.
    LoadBalancer,
    /// Named as primary by another member, but not yet checked directly.
    PossiblePrimary,
    /// Server type is currently unknown.
    Unknown,
}

impl FromStr for ServerType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Standalone" => ServerType::Standalone,
            "Mongos" => ServerType::Mongos,
            "RSPrimary" => ServerType::RSPrimary,
            "RSSecondary" => ServerType::RSSecondary,
            "RSArbiter" => ServerType::RSArbiter,
            "RSOther" => ServerType::RSOther,
            "RSGhost" => ServerType::RSGhost,
            "LoadBalancer" => ServerType::LoadBalancer,
            "PossiblePrimary" => ServerType::PossiblePrimary,
            "Unknown" => ServerType::Unknown,
            _ => return Err(ArgumentError(format!("Unknown server type '{}'.", s))),
        })
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, fmt)
    }
}

impl ServerType {
    /// Whether servers of this type hold data that operations may read.
    pub fn is_data_bearing(self) -> bool {
        match self {
            ServerType::Standalone
            | ServerType::Mongos
            | ServerType::RSPrimary
            | ServerType::RSSecondary
            | ServerType::LoadBalancer => true,
            _ => false,
        }
    }

    /// Whether the server has answered its last handshake.
    pub fn is_known(self) -> bool {
        self != ServerType::Unknown && self != ServerType::PossiblePrimary
    }
}

/// The result of an isMaster operation.
#[derive(Clone, Debug, PartialEq)]
pub struct IsMasterResult {
    pub ok: bool,
    pub is_master: bool,
    pub min_wire_version: i32,
    pub max_wire_version: i32,

    /// Shard-specific. mongos instances will add this field to the
    /// isMaster reply, and it will contain the value "isdbgrid".
    pub msg: String,

    // Replica Set specific
    pub is_replica_set: bool,
    pub is_secondary: bool,
    pub me: Option<Host>,
    pub hosts: Vec<Host>,
    pub passives: Vec<Host>,
    pub arbiters: Vec<Host>,
    pub arbiter_only: bool,
    pub tags: BTreeMap<String, String>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<oid::ObjectId>,
    pub primary: Option<Host>,
    pub hidden: bool,
    pub last_write_date: Option<DateTime<Utc>>,
    pub logical_session_timeout_minutes: Option<i64>,
}

fn as_i64(value: &Bson) -> Option<i64> {
    match *value {
        Bson::I32(v) => Some(v as i64),
        Bson::I64(v) => Some(v),
        Bson::FloatingPoint(v) => Some(v as i64),
        _ => None,
    }
}

fn as_bool(value: &Bson) -> bool {
    match *value {
        Bson::Boolean(b) => b,
        _ => as_i64(value).map_or(false, |v| v != 0),
    }
}

fn host_list(doc: &Document, key: &str) -> Vec<Host> {
    match doc.get(key) {
        Some(&Bson::Array(ref arr)) => arr
            .iter()
            .filter_map(|bson| match *bson {
                Bson::String(ref s) => connstring::parse_host(s).ok(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

impl IsMasterResult {
    /// Parses an isMaster response document from the server.
    pub fn new(doc: Document) -> Result<IsMasterResult> {
        let ok = match doc.get("ok") {
            Some(value) => as_bool(value),
            None => return Err(ArgumentError("result does not contain `ok`.".to_owned())),
        };

        let mut result = IsMasterResult {
            ok: ok,
            is_master: false,
            min_wire_version: 0,
            max_wire_version: 0,
            msg: String::new(),
            is_secondary: false,
            is_replica_set: false,
            me: None,
            hosts: host_list(&doc, "hosts"),
            passives: host_list(&doc, "passives"),
            arbiters: host_list(&doc, "arbiters"),
            arbiter_only: false,
            tags: BTreeMap::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            hidden: false,
            last_write_date: None,
            logical_session_timeout_minutes: None,
        };

        if let Some(value) = doc.get("ismaster") {
            result.is_master = as_bool(value);
        }

        if let Some(v) = doc.get("minWireVersion").and_then(as_i64) {
            result.min_wire_version = v as i32;
        }

        if let Some(v) = doc.get("maxWireVersion").and_then(as_i64) {
            result.max_wire_version = v as i32;
        }

        if let Some(&Bson::String(ref s)) = doc.get("msg") {
            result.msg = s.to_owned();
        }

        if let Some(value) = doc.get("secondary") {
            result.is_secondary = as_bool(value);
        }

        if let Some(value) = doc.get("isreplicaset") {
            result.is_replica_set = as_bool(value);
        }

        if let Some(value) = doc.get("arbiterOnly") {
            result.arbiter_only = as_bool(value);
        }

        if let Some(value) = doc.get("hidden") {
            result.hidden = as_bool(value);
        }

        if let Some(&Bson::String(ref s)) = doc.get("setName") {
            result.set_name = Some(s.to_owned());
        }

        if let Some(v) = doc.get("setVersion").and_then(as_i64) {
            result.set_version = Some(v as i32);
        }

        if let Some(&Bson::String(ref s)) = doc.get("me") {
            result.me = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::String(ref s)) = doc.get("primary") {
            result.primary = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::Document(ref tags)) = doc.get("tags") {
            for (k, v) in tags.iter() {
                if let Bson::String(ref tag) = *v {
                    result.tags.insert(k.to_owned(), tag.to_owned());
                }
            }
        }

        match doc.get("electionId") {
            Some(&Bson::ObjectId(ref id)) => result.election_id = Some(id.clone()),
            Some(&Bson::Document(ref id)) => {
                if let Some(&Bson::String(ref s)) = id.get("$oid") {
                    result.election_id = Some(oid::ObjectId::with_string(s)?);
                }
            }
            _ => (),
        }

        if let Some(&Bson::Document(ref last_write)) = doc.get("lastWrite") {
            match last_write.get("lastWriteDate") {
                Some(&Bson::UtcDatetime(ref date)) => result.last_write_date = Some(*date),
                Some(&Bson::Document(ref date)) => {
                    if let Some(millis) = date.get("$date").and_then(as_i64) {
                        result.last_write_date = Some(datetime_from_millis(millis));
                    }
                }
                _ => (),
            }
        }

        if let Some(v) = doc.get("logicalSessionTimeoutMinutes").and_then(as_i64) {
            result.logical_session_timeout_minutes = Some(v);
        }

        Ok(result)
    }

    /// Derives the server's role from the reply.
    pub fn server_type(&self) -> ServerType {
        if !self.ok {
            ServerType::Unknown
        } else if self.msg == MONGOS_MSG {
            ServerType::Mongos
        } else if self.is_replica_set {
            ServerType::RSGhost
        } else if self.set_name.is_some() {
            if self.hidden {
                ServerType::RSOther
            } else if self.is_master {
                ServerType::RSPrimary
            } else if self.is_secondary {
                ServerType::RSSecondary
            } else if self.arbiter_only {
                ServerType::RSArbiter
            } else {
                ServerType::RSOther
            }
        } else {
            ServerType::Standalone
        }
    }
}

/// Converts milliseconds since the epoch into a UTC date.
pub fn datetime_from_millis(millis: i64) -> DateTime<Utc> {
    use chrono::TimeZone;
    Utc.timestamp_millis(millis)
}

/// Server information gathered from server monitoring.
///
/// Descriptions are values: every handshake produces a new one, and the
/// topology replaces the old description wholesale.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerDescription {
    /// The address this description is about.
    pub address: Host,
    /// The server type.
    pub server_type: ServerType,
    /// The last handshake error, if the last handshake failed.
    pub error: Option<String>,
    /// Moving average of handshake round trips, in milliseconds.
    pub round_trip_time: Option<f64>,
    /// When the server last wrote to its oplog, as reported by the server.
    pub last_write_date: Option<DateTime<Utc>>,
    /// When this description was produced.
    pub last_update_time: DateTime<Utc>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    /// The server's own address, as the server sees it.
    pub me: Option<Host>,
    pub hosts: Vec<Host>,
    pub passives: Vec<Host>,
    pub arbiters: Vec<Host>,
    /// Server tags for targeted read operations on specific replica set members.
    pub tags: BTreeMap<String, String>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<oid::ObjectId>,
    /// The server's opinion of who the primary is.
    pub primary: Option<Host>,
    pub logical_session_timeout_minutes: Option<i64>,
}

impl ServerDescription {
    /// Returns a default, unknown server description.
    pub fn new(address: Host) -> ServerDescription {
        ServerDescription {
            address: address,
            server_type: ServerType::Unknown,
            error: None,
            round_trip_time: None,
            last_write_date: None,
            last_update_time: Utc::now(),
            min_wire_version: 0,
            max_wire_version: 0,
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            tags: BTreeMap::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            logical_session_timeout_minutes: None,
        }
    }

    /// Returns an unknown description carrying the error that made it unknown.
    pub fn with_error(address: Host, error: String) -> ServerDescription {
        ServerDescription {
            error: Some(error),
            ..ServerDescription::new(address)
        }
    }

    /// Builds a description from a successful handshake.
    pub fn from_is_master(address: Host, ismaster: IsMasterResult, round_trip_time: Option<f64>)
        -> ServerDescription {
        if !ismaster.ok {
            return ServerDescription::with_error(
                address,
                "ismaster returned a not-ok response.".to_owned(),
            );
        }

        ServerDescription {
            server_type: ismaster.server_type(),
            round_trip_time: round_trip_time,
            last_write_date: ismaster.last_write_date,
            min_wire_version: ismaster.min_wire_version,
            max_wire_version: ismaster.max_wire_version,
            me: ismaster.me,
            hosts: ismaster.hosts,
            passives: ismaster.passives,
            arbiters: ismaster.arbiters,
            tags: ismaster.tags,
            set_name: ismaster.set_name,
            set_version: ismaster.set_version,
            election_id: ismaster.election_id,
            primary: ismaster.primary,
            logical_session_timeout_minutes: ismaster.logical_session_timeout_minutes,
            ..ServerDescription::new(address)
        }
    }

    /// Every member this server reports: hosts, passives and arbiters.
    pub fn all_hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter().chain(self.passives.iter()).chain(self.arbiters.iter())
    }

    /// Compares everything except the round trip time and update time, which
    /// change on every heartbeat.
    pub fn same_state_as(&self, other: &ServerDescription) -> bool {
        self.address == other.address
            && self.server_type == other.server_type
            && self.error == other.error
            && self.last_write_date == other.last_write_date
            && self.min_wire_version == other.min_wire_version
            && self.max_wire_version == other.max_wire_version
            && self.me == other.me
            && self.hosts == other.hosts
            && self.passives == other.passives
            && self.arbiters == other.arbiters
            && self.tags == other.tags
            && self.set_name == other.set_name
            && self.set_version == other.set_version
            && self.election_id == other.election_id
            && self.primary == other.primary
            && self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
    }

    /// Whether every tag in `tag_set` is present on this server.
    pub fn matches_tag_set(&self, tag_set: &BTreeMap<String, String>) -> bool {
        tag_set.iter().all(|(k, v)| self.tags.get(k) == Some(v))
    }
}
