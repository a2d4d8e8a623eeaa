use bson::oid::ObjectId;
use mongodb_sdam::connstring::{self, Host};
use mongodb_sdam::topology::description::TopologyType;
use mongodb_sdam::topology::server::ServerType;

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;

pub struct Server {
    pub set_name: Option<String>,
    pub stype: ServerType,
    /// Only checked when the test names it.
    pub set_version: Option<Option<i32>>,
    pub election_id: Option<Option<ObjectId>>,
}

pub struct Outcome {
    pub servers: HashMap<Host, Server>,
    pub set_name: Option<String>,
    pub ttype: TopologyType,
    pub logical_session_timeout_minutes: Option<i64>,
    pub compatible: bool,
    pub max_set_version: Option<Option<i32>>,
    pub max_election_id: Option<Option<ObjectId>>,
}

fn optional_string(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key) {
        Some(&Value::String(ref s)) => Some(s.to_owned()),
        _ => None,
    }
}

fn checked_i32(object: &Map<String, Value>, key: &str) -> Option<Option<i32>> {
    object.get(key).map(|value| value.as_i64().map(|v| v as i32))
}

fn checked_oid(object: &Map<String, Value>, key: &str) -> Result<Option<Option<ObjectId>>, String> {
    match object.get(key) {
        None => Ok(None),
        Some(&Value::Null) => Ok(Some(None)),
        Some(&Value::Object(ref obj)) => {
            let id = val_or_err!(obj.get("$oid"),
                                 Some(&Value::String(ref s)) => s,
                                 "ObjectIds must be written as {\"$oid\": \"...\"}.");
            let id = ObjectId::with_string(id).map_err(|err| err.to_string())?;
            Ok(Some(Some(id)))
        }
        _ => Err(format!("`{}` must be an ObjectId or null.", key)),
    }
}

impl Outcome {
    pub fn from_json(object: &Map<String, Value>) -> Result<Outcome, String> {
        let mut servers = HashMap::new();

        if let Some(&Value::Object(ref obj)) = object.get("servers") {
            for (host, json) in obj {
                let doc = val_or_err!(*json,
                                      Value::Object(ref obj) => obj,
                                      "`servers` must be an object map.");

                let server_type = val_or_err!(doc.get("type"),
                                              Some(&Value::String(ref s)) =>
                                              ServerType::from_str(s).map_err(|err| err.to_string())?,
                                              "`type` must be a string.");

                let server = Server {
                    set_name: optional_string(doc, "setName"),
                    stype: server_type,
                    set_version: checked_i32(doc, "setVersion"),
                    election_id: checked_oid(doc, "electionId")?,
                };

                let host = connstring::parse_host(host).map_err(|err| err.to_string())?;
                servers.insert(host, server);
            }
        }

        let ttype = val_or_err!(object.get("topologyType"),
                                Some(&Value::String(ref s)) =>
                                TopologyType::from_str(s).map_err(|err| err.to_string())?,
                                "`outcome` requires a topologyType.");

        let compatible = match object.get("compatible") {
            Some(&Value::Bool(b)) => b,
            _ => true,
        };

        Ok(Outcome {
            servers: servers,
            set_name: optional_string(object, "setName"),
            ttype: ttype,
            logical_session_timeout_minutes: object
                .get("logicalSessionTimeoutMinutes")
                .and_then(Value::as_i64),
            compatible: compatible,
            max_set_version: checked_i32(object, "maxSetVersion"),
            max_election_id: checked_oid(object, "maxElectionId")?,
        })
    }
}
