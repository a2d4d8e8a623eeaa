use bson::Document;
use mongodb_sdam::connstring::{self, Host};
use serde_json::Value;

use crate::json::to_document;

/// The isMaster replies of one phase. An empty reply stands for a network error.
pub struct Responses {
    pub data: Vec<(Host, Document)>,
}

impl Responses {
    pub fn from_json(array: &[Value]) -> Result<Responses, String> {
        let mut data = Vec::new();

        for json in array {
            let inner_array = val_or_err!(*json,
                                          Value::Array(ref arr) => arr,
                                          "`responses` must be an array of arrays.");

            if inner_array.len() != 2 {
                return Err("Response item must contain the host string and ismaster object.".to_owned());
            }

            let host = val_or_err!(inner_array[0],
                                   Value::String(ref s) => s.to_owned(),
                                   "Response item must contain the host string as the first argument.");

            let ismaster = val_or_err!(inner_array[1],
                                       Value::Object(ref obj) => to_document(obj)?,
                                       "Response item must contain the ismaster object as \
                                        the second argument.");

            let host = connstring::parse_host(&host).map_err(|err| err.to_string())?;
            data.push((host, ismaster));
        }

        Ok(Responses { data: data })
    }
}
