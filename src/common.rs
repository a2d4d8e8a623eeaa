//! Read preferences.
use crate::error::Error::{self, ArgumentError, ConfigurationError};
use crate::error::Result;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A set of server tags that must all be present on a server for it to match.
pub type TagSet = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl FromStr for ReadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<ReadMode> {
        Ok(match &s.to_ascii_lowercase()[..] {
            "primary" => ReadMode::Primary,
            "primarypreferred" => ReadMode::PrimaryPreferred,
            "secondary" => ReadMode::Secondary,
            "secondarypreferred" => ReadMode::SecondaryPreferred,
            "nearest" => ReadMode::Nearest,
            _ => return Err(ArgumentError(format!("Unknown read preference mode '{}'.", s))),
        })
    }
}

impl fmt::Display for ReadMode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        };
        fmt.write_str(name)
    }
}

/// Describes which servers may serve a read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPreference {
    pub mode: ReadMode,
    /// Tried in order; the first set matching any eligible server wins.
    /// An empty list matches every server.
    pub tag_sets: Vec<TagSet>,
    pub max_staleness: Option<Duration>,
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::new(ReadMode::Primary, None)
    }
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<TagSet>>) -> ReadPreference {
        ReadPreference {
            mode: mode,
            tag_sets: tag_sets.unwrap_or_default(),
            max_staleness: None,
        }
    }

    pub fn primary() -> ReadPreference {
        ReadPreference::new(ReadMode::Primary, None)
    }

    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> ReadPreference {
        self.tag_sets = tag_sets;
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> ReadPreference {
        self.max_staleness = Some(max_staleness);
        self
    }

    /// Checks that `max_staleness`, when set, is at least twice the heartbeat frequency.
    pub fn validate(&self, heartbeat_frequency: Duration) -> Result<()> {
        if self.mode == ReadMode::Primary {
            return Ok(());
        }

        if let Some(max_staleness) = self.max_staleness {
            let floor = heartbeat_frequency * 2;
            if max_staleness < floor {
                return Err(ConfigurationError(format!(
                    "maxStalenessSeconds must be at least {}s (twice the heartbeat frequency), \
                     but was {}s",
                    floor.as_secs_f64(),
                    max_staleness.as_secs_f64()
                )));
            }
        }

        Ok(())
    }
}

/// Parses a `readPreferenceTags` entry of the form `dc:ny,rack:1`.
///
/// The empty string is the empty tag set, which matches any server.
pub fn parse_tag_set(s: &str) -> Result<TagSet> {
    let mut tags = TagSet::new();
    for pair in s.split(',').filter(|pair| !pair.is_empty()) {
        match pair.find(':') {
            Some(idx) => {
                tags.insert(pair[..idx].to_owned(), pair[idx + 1..].to_owned());
            }
            None => {
                return Err(ArgumentError(format!(
                    "Read preference tags must be key:value pairs; found '{}'.",
                    pair
                )))
            }
        }
    }
    Ok(tags)
}
