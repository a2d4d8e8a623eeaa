//! Client configuration.
use crate::common::{self, ReadMode, ReadPreference, TagSet};
use crate::connstring::{self, ConnectionString, Host};
use crate::error::Error::{ArgumentError, ConfigurationError};
use crate::error::Result;

use serde_derive::Deserialize;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_HEARTBEAT_FREQUENCY_MS: u64 = 10000;
pub const MIN_HEARTBEAT_FREQUENCY_MS: u64 = 500;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10000;
pub const DEFAULT_SERVER_SELECTION_TIMEOUT_MS: u64 = 30000;
pub const DEFAULT_LOCAL_THRESHOLD_MS: u64 = 15;
pub const DEFAULT_MAX_POOL_SIZE: usize = 100;
pub const DEFAULT_WAIT_QUEUE_TIMEOUT_MS: u64 = 10000;

/// How server monitors are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MonitorMode {
    /// Every server gets its own monitoring thread.
    Threaded,
    /// Servers are scanned in one pass on the selecting thread.
    Cooperative,
}

/// Options governing discovery, monitoring, selection and pooling.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// The seed list.
    pub hosts: Vec<Host>,
    /// The required replica set name, if any.
    pub replica_set: Option<String>,
    pub heartbeat_frequency: Duration,
    pub connect_timeout: Duration,
    pub socket_timeout: Option<Duration>,
    pub server_selection_timeout: Duration,
    /// Width of the latency window above the fastest eligible server.
    pub local_threshold: Duration,
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    pub wait_queue_timeout: Duration,
    /// Reported to servers in the handshake's client metadata.
    pub app_name: Option<String>,
    pub monitor_mode: MonitorMode,
    /// Used by operations that don't specify their own.
    pub read_preference: ReadPreference,
}

// The JSON form of `ClientOptions`, using URI option names.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct OptionsDocument {
    #[serde(default)]
    hosts: Vec<String>,
    replica_set: Option<String>,
    #[serde(rename = "heartbeatFrequencyMS")]
    heartbeat_frequency_ms: Option<u64>,
    #[serde(rename = "connectTimeoutMS")]
    connect_timeout_ms: Option<u64>,
    #[serde(rename = "socketTimeoutMS")]
    socket_timeout_ms: Option<u64>,
    #[serde(rename = "serverSelectionTimeoutMS")]
    server_selection_timeout_ms: Option<u64>,
    #[serde(rename = "localThresholdMS")]
    local_threshold_ms: Option<u64>,
    max_pool_size: Option<usize>,
    min_pool_size: Option<usize>,
    #[serde(rename = "waitQueueTimeoutMS")]
    wait_queue_timeout_ms: Option<u64>,
    app_name: Option<String>,
    monitor_mode: Option<MonitorMode>,
    read_preference: Option<String>,
    #[serde(default)]
    read_preference_tags: Vec<TagSet>,
    max_staleness_seconds: Option<i64>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            hosts: vec![Host::new("localhost", connstring::DEFAULT_PORT)],
            replica_set: None,
            heartbeat_frequency: Duration::from_millis(DEFAULT_HEARTBEAT_FREQUENCY_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            socket_timeout: None,
            server_selection_timeout: Duration::from_millis(DEFAULT_SERVER_SELECTION_TIMEOUT_MS),
            local_threshold: Duration::from_millis(DEFAULT_LOCAL_THRESHOLD_MS),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            min_pool_size: 0,
            wait_queue_timeout: Duration::from_millis(DEFAULT_WAIT_QUEUE_TIMEOUT_MS),
            app_name: None,
            monitor_mode: MonitorMode::Threaded,
            read_preference: ReadPreference::default(),
        }
    }
}

impl ClientOptions {
    /// Returns default options with the given seed list.
    pub fn with_hosts(hosts: Vec<Host>) -> ClientOptions {
        ClientOptions {
            hosts: hosts,
            ..ClientOptions::default()
        }
    }

    /// Parses and validates options from a `mongodb://` URI.
    pub fn parse(uri: &str) -> Result<ClientOptions> {
        let config = connstring::parse(uri)?;
        ClientOptions::from_connection_string(&config)
    }

    /// Builds validated options from a parsed connection string. Unrecognized
    /// options are ignored with a warning.
    pub fn from_connection_string(config: &ConnectionString) -> Result<ClientOptions> {
        let mut options = ClientOptions::with_hosts(config.hosts.clone());
        let mut mode = None;
        let mut max_staleness = None;

        for (key, value) in config.options.options.iter() {
            match &key[..] {
                "replicaset" => options.replica_set = Some(value.to_owned()),
                "heartbeatfrequencyms" => options.heartbeat_frequency = parse_millis(key, value)?,
                "connecttimeoutms" => options.connect_timeout = parse_millis(key, value)?,
                "sockettimeoutms" => options.socket_timeout = Some(parse_millis(key, value)?),
                "serverselectiontimeoutms" => {
                    options.server_selection_timeout = parse_millis(key, value)?
                }
                "localthresholdms" => options.local_threshold = parse_millis(key, value)?,
                "maxpoolsize" => options.max_pool_size = parse_number(key, value)?,
                "minpoolsize" => options.min_pool_size = parse_number(key, value)?,
                "waitqueuetimeoutms" => options.wait_queue_timeout = parse_millis(key, value)?,
                "appname" => options.app_name = Some(value.to_owned()),
                "readpreference" => mode = Some(value.parse::<ReadMode>()?),
                "maxstalenessseconds" => max_staleness = Some(parse_number::<i64>(key, value)?),
                _ => warn!(option = %key, "ignoring unsupported connection string option"),
            }
        }

        let tag_sets = config
            .options
            .read_pref_tags
            .iter()
            .map(|tags| common::parse_tag_set(tags))
            .collect::<Result<Vec<_>>>()?;

        options.read_preference = build_read_preference(mode, tag_sets, max_staleness)?;
        options.validate()?;
        Ok(options)
    }

    /// Parses and validates options from a JSON document such as
    /// `{"hosts": ["a:27017"], "replicaSet": "rs0", "heartbeatFrequencyMS": 500}`.
    pub fn from_json(json: &str) -> Result<ClientOptions> {
        let doc: OptionsDocument = serde_json::from_str(json)
            .map_err(|err| ArgumentError(format!("invalid options document: {}", err)))?;

        let mut options = ClientOptions::default();

        if !doc.hosts.is_empty() {
            options.hosts = doc
                .hosts
                .iter()
                .map(|host| connstring::parse_host(host))
                .collect::<Result<Vec<_>>>()?;
        }

        options.replica_set = doc.replica_set;
        options.app_name = doc.app_name;
        options.socket_timeout = doc.socket_timeout_ms.map(Duration::from_millis);

        if let Some(ms) = doc.heartbeat_frequency_ms {
            options.heartbeat_frequency = Duration::from_millis(ms);
        }
        if let Some(ms) = doc.connect_timeout_ms {
            options.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = doc.server_selection_timeout_ms {
            options.server_selection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = doc.local_threshold_ms {
            options.local_threshold = Duration::from_millis(ms);
        }
        if let Some(size) = doc.max_pool_size {
            options.max_pool_size = size;
        }
        if let Some(size) = doc.min_pool_size {
            options.min_pool_size = size;
        }
        if let Some(ms) = doc.wait_queue_timeout_ms {
            options.wait_queue_timeout = Duration::from_millis(ms);
        }
        if let Some(mode) = doc.monitor_mode {
            options.monitor_mode = mode;
        }

        let mode = match doc.read_preference {
            Some(ref mode) => Some(mode.parse::<ReadMode>()?),
            None => None,
        };

        options.read_preference =
            build_read_preference(mode, doc.read_preference_tags, doc.max_staleness_seconds)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks option combinations that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ConfigurationError("at least one seed host is required".to_owned()));
        }

        if self.heartbeat_frequency < Duration::from_millis(MIN_HEARTBEAT_FREQUENCY_MS) {
            return Err(ConfigurationError(format!(
                "heartbeatFrequencyMS must be at least {}",
                MIN_HEARTBEAT_FREQUENCY_MS
            )));
        }

        if self.max_pool_size == 0 {
            return Err(ConfigurationError("maxPoolSize must be greater than zero".to_owned()));
        }

        if self.min_pool_size > self.max_pool_size {
            return Err(ConfigurationError(format!(
                "minPoolSize ({}) must not exceed maxPoolSize ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }

        self.read_preference.validate(self.heartbeat_frequency)
    }
}

fn build_read_preference(
    mode: Option<ReadMode>,
    tag_sets: Vec<TagSet>,
    max_staleness_seconds: Option<i64>,
) -> Result<ReadPreference> {
    let mode = mode.unwrap_or(ReadMode::Primary);

    if mode == ReadMode::Primary && !tag_sets.iter().all(|tags| tags.is_empty()) {
        return Err(ConfigurationError(
            "read preference tags cannot be combined with mode 'primary'".to_owned(),
        ));
    }

    let mut read_preference = ReadPreference::new(mode, Some(tag_sets));

    // -1 is the URI spelling of "no maximum".
    match max_staleness_seconds {
        None | Some(-1) => (),
        Some(secs) if secs > 0 => {
            read_preference.max_staleness = Some(Duration::from_secs(secs as u64));
        }
        Some(secs) => {
            return Err(ConfigurationError(format!(
                "maxStalenessSeconds must be positive or -1, but was {}",
                secs
            )))
        }
    }

    Ok(read_preference)
}

fn parse_number<T: ::std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| ArgumentError(format!("Option '{}' must be a number; found '{}'.", key, value)))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}
