use serde_json::{Map, Value};

use crate::json;
use super::outcome::Outcome;
use super::responses::Responses;

pub struct Phase {
    pub operation: Responses,
    pub outcome: Outcome,
}

impl Phase {
    fn from_json(object: &Map<String, Value>) -> Result<Phase, String> {
        let operation = val_or_err!(object.get("responses"),
                                    Some(&Value::Array(ref array)) => Responses::from_json(array)?,
                                    "No `responses` array found.");

        let outcome = val_or_err!(object.get("outcome"),
                                  Some(&Value::Object(ref obj)) => Outcome::from_json(obj)?,
                                  "No `outcome` object found.");

        Ok(Phase {
            operation: operation,
            outcome: outcome,
        })
    }
}

pub struct Suite {
    pub description: String,
    pub uri: String,
    pub phases: Vec<Phase>,
}

fn get_phases(object: &Map<String, Value>) -> Result<Vec<Phase>, String> {
    let array = val_or_err!(object.get("phases"),
                            Some(&Value::Array(ref array)) => array,
                            "No `phases` array found");

    let mut phases = vec![];

    for json in array {
        let obj = val_or_err!(*json,
                              Value::Object(ref obj) => obj,
                              "`phases` array must only contain objects");

        phases.push(Phase::from_json(obj)?);
    }

    Ok(phases)
}

pub trait SuiteContainer: Sized {
    fn from_file(path: &str) -> Result<Self, String>;
    fn get_suite(&self) -> Result<Suite, String>;
}

impl SuiteContainer for Value {
    fn from_file(path: &str) -> Result<Value, String> {
        json::read_file(path)
    }

    fn get_suite(&self) -> Result<Suite, String> {
        let object = val_or_err!(*self,
                                 Value::Object(ref object) => object,
                                 "`get_suite` requires a JSON object");

        let uri = val_or_err!(object.get("uri"),
                              Some(&Value::String(ref s)) => s.clone(),
                              "`get_suite` requires a connection uri");

        let description = match object.get("description") {
            Some(&Value::String(ref s)) => s.clone(),
            _ => String::new(),
        };

        let phases = get_phases(object)?;
        Ok(Suite {
            description: description,
            uri: uri,
            phases: phases,
        })
    }
}
