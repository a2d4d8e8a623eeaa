use mongodb_sdam::common::{ReadMode, ReadPreference, TagSet};

use serde_json::{Map, Value};
use std::str::FromStr;
use std::time::Duration;

use crate::json::FromValueResult;

impl FromValueResult for ReadPreference {
    fn from_json(object: &Map<String, Value>) -> Result<ReadPreference, String> {
        let mode = val_or_err!(object.get("mode"),
                               Some(&Value::String(ref s)) =>
                               ReadMode::from_str(s).map_err(|err| err.to_string())?,
                               "read preference must have a mode.");

        let mut tag_sets = Vec::new();

        if let Some(&Value::Array(ref array)) = object.get("tag_sets") {
            for json in array {
                let obj = val_or_err!(*json,
                                      Value::Object(ref obj) => obj,
                                      "tags must be document objects.");

                let mut tags = TagSet::new();
                for (key, json) in obj {
                    let value = val_or_err!(*json,
                                            Value::String(ref s) => s.to_owned(),
                                            "tags must be string => string maps.");
                    tags.insert(key.to_owned(), value);
                }
                tag_sets.push(tags);
            }
        }

        let mut read_preference = ReadPreference::new(mode, Some(tag_sets));

        if let Some(secs) = object.get("maxStalenessSeconds").and_then(Value::as_u64) {
            read_preference = read_preference.with_max_staleness(Duration::from_secs(secs));
        }

        Ok(read_preference)
    }
}
