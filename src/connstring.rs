//! Connection string parsing and host addresses.
use crate::error::Error::ArgumentError;
use crate::error::Result;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 27017;
pub const URI_SCHEME: &str = "mongodb://";

/// Encapsulates the hostname and port of a server. Host names are always lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    pub host_name: String,
    pub port: u16,
}

impl Host {
    pub fn new(host_name: &str, port: u16) -> Host {
        Host {
            host_name: host_name.to_ascii_lowercase(),
            port: port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.host_name.contains(':') {
            write!(fmt, "[{}]:{}", self.host_name, self.port)
        } else {
            write!(fmt, "{}:{}", self.host_name, self.port)
        }
    }
}

impl FromStr for Host {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Host> {
        parse_host(s)
    }
}

/// The options and read preference tags of a connection string.
///
/// Option keys are stored lowercased, since URI option names are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub options: BTreeMap<String, String>,
    pub read_pref_tags: Vec<String>,
}

impl ConnectionOptions {
    /// Looks up an option by name, ignoring case.
    pub fn get(&self, key: &str) -> Option<&String> {
        self.options.get(&key.to_ascii_lowercase())
    }
}

/// The seed list and options of a MongoDB deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub hosts: Vec<Host>,
    pub string: Option<String>,
    pub database: Option<String>,
    pub options: ConnectionOptions,
}

impl ConnectionString {
    /// Creates a connection string for a single host with no options.
    pub fn new(host_name: &str, port: u16) -> ConnectionString {
        ConnectionString::with_hosts(vec![Host::new(host_name, port)])
    }

    pub fn with_hosts(hosts: Vec<Host>) -> ConnectionString {
        ConnectionString {
            hosts: hosts,
            string: None,
            database: None,
            options: ConnectionOptions::default(),
        }
    }
}

/// Parses a MongoDB connection string URI as defined by
/// [the manual](http://docs.mongodb.org/manual/reference/connection-string/).
///
/// Credentials in the user info section are accepted but not retained.
pub fn parse(address: &str) -> Result<ConnectionString> {
    if !address.starts_with(URI_SCHEME) {
        return Err(ArgumentError(
            "MongoDB connection string must start with 'mongodb://'.".to_owned(),
        ));
    }

    let addr = &address[URI_SCHEME.len()..];
    let (host_str, path_str) = partition(addr, "/");

    if path_str.is_empty() && host_str.contains('?') {
        return Err(ArgumentError(
            "A '/' is required between the host list and any options.".to_owned(),
        ));
    }

    let host_str = if host_str.contains('@') {
        rpartition(host_str, "@").1
    } else {
        host_str
    };

    let hosts = split_hosts(host_str)?;

    let mut database = None;
    let mut opts = "";

    if !path_str.is_empty() {
        if path_str.starts_with('?') {
            opts = &path_str[1..];
        } else {
            let (dbase, options) = partition(path_str, "?");
            if !dbase.is_empty() {
                database = Some(dbase.to_owned());
            }
            opts = options;
        }
    }

    let options = if opts.is_empty() {
        ConnectionOptions::default()
    } else {
        split_options(opts)?
    };

    Ok(ConnectionString {
        hosts: hosts,
        string: Some(address.to_owned()),
        database: database,
        options: options,
    })
}

// Parses an IPv6 literal host entity of the form [host] or [host]:port.
fn parse_ipv6_literal_host(entity: &str) -> Result<Host> {
    match entity.find("]:") {
        Some(idx) => {
            let port = parse_port(&entity[idx + 2..])?;
            Ok(Host::new(&entity[1..idx], port))
        }
        None if entity.ends_with(']') => Ok(Host::new(&entity[1..entity.len() - 1], DEFAULT_PORT)),
        None => Err(ArgumentError(
            "An IPv6 address must be enclosed in '[' and ']' according to RFC 2732.".to_owned(),
        )),
    }
}

fn parse_port(port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ArgumentError(format!("Invalid port '{}'.", port))),
        Ok(val) => Ok(val),
    }
}

/// Parses a host entity of the form host or host:port.
pub fn parse_host(entity: &str) -> Result<Host> {
    if entity.is_empty() {
        return Err(ArgumentError("Empty host.".to_owned()));
    }

    if entity.starts_with('[') {
        parse_ipv6_literal_host(entity)
    } else if entity.contains(':') {
        let (host, port) = partition(entity, ":");
        if port.contains(':') {
            return Err(ArgumentError(
                "Reserved characters such as ':' must be escaped according to RFC 2396. \
                 An IPv6 address literal must be enclosed in '[' and ']' according to RFC 2732."
                    .to_owned(),
            ));
        }
        Ok(Host::new(host, parse_port(port)?))
    } else {
        Ok(Host::new(entity, DEFAULT_PORT))
    }
}

// Splits and parses comma-separated hosts, dropping duplicates.
fn split_hosts(host_str: &str) -> Result<Vec<Host>> {
    let mut hosts: Vec<Host> = Vec::new();
    for entity in host_str.split(',') {
        if entity.is_empty() {
            return Err(ArgumentError("Empty host, or extra comma in host list.".to_owned()));
        }
        let host = parse_host(entity)?;
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    Ok(hosts)
}

// Parses the delimited string into its options and read preference tags.
fn split_options(opts: &str) -> Result<ConnectionOptions> {
    let delim = match (opts.find('&'), opts.find(';')) {
        (Some(_), Some(_)) => {
            return Err(ArgumentError("Cannot mix '&' and ';' for option separators.".to_owned()))
        }
        (Some(_), None) => '&',
        _ => ';',
    };

    let mut options = ConnectionOptions::default();

    for opt in opts.split(delim).filter(|opt| !opt.is_empty()) {
        if !opt.contains('=') {
            return Err(ArgumentError(format!(
                "URI options are key=value pairs; found '{}'.",
                opt
            )));
        }

        let (key, val) = partition(opt, "=");
        let key = key.to_ascii_lowercase();
        if key == "readpreferencetags" {
            options.read_pref_tags.push(val.to_owned());
        } else {
            options.options.insert(key, val.to_owned());
        }
    }

    Ok(options)
}

// Partitions a string around the left-most occurrence of the separator, if it exists.
fn partition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.find(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}

// Partitions a string around the right-most occurrence of the separator, if it exists.
fn rpartition<'a>(string: &'a str, sep: &str) -> (&'a str, &'a str) {
    match string.rfind(sep) {
        Some(idx) => (&string[..idx], &string[idx + sep.len()..]),
        None => (string, ""),
    }
}
