//! Cooperative monitoring: the selecting thread drives a single pass over
//! every server, with no thread outliving the pass.
use crate::connstring::Host;
use crate::options::MIN_HEARTBEAT_FREQUENCY_MS;

use tracing::{debug, trace, warn};

use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::{Duration, Instant};

use super::monitor::Monitor;
use super::server::ServerType;
use super::Topology;

/// Scans all servers from the calling thread. Used by short-lived clients
/// that should not own background monitor threads.
pub struct Scanner {
    monitors: HashMap<Host, Monitor>,
    last_scan: Option<Instant>,
}

impl Default for Scanner {
    fn default() -> Self {
        Scanner::new()
    }
}

impl Scanner {
    pub fn new() -> Scanner {
        Scanner {
            monitors: HashMap::new(),
            last_scan: None,
        }
    }

    pub fn last_scan(&self) -> Option<Instant> {
        self.last_scan
    }

    /// How long until the next scan is due. A requested rescan is still held
    /// back until the minimum heartbeat interval has passed.
    pub fn until_due(&self, heartbeat_frequency: Duration, rescan_requested: bool) -> Duration {
        let last = match self.last_scan {
            Some(last) => last,
            None => return Duration::from_millis(0),
        };

        let interval = if rescan_requested {
            Duration::from_millis(MIN_HEARTBEAT_FREQUENCY_MS)
        } else {
            heartbeat_frequency
        };

        (last + interval)
            .checked_duration_since(Instant::now())
            .unwrap_or_default()
    }

    pub fn is_due(&self, heartbeat_frequency: Duration, rescan_requested: bool) -> bool {
        self.until_due(heartbeat_frequency, rescan_requested) == Duration::from_millis(0)
    }

    /// Checks every server in the topology once, including servers
    /// discovered during the pass. The servers of a round are checked at
    /// the same time, each on a short-lived thread, and every check is
    /// bounded by one shared deadline.
    pub fn scan(&mut self, topology: &Topology) {
        let options = topology.options();
        let deadline = Instant::now() + options.connect_timeout;
        let mut checked = HashSet::new();

        debug!("starting cooperative scan");

        loop {
            let description = topology.snapshot();
            let pending: HashMap<Host, ServerType> = description
                .servers
                .iter()
                .filter(|&(host, _)| !checked.contains(host))
                .map(|(host, server)| (host.clone(), server.server_type))
                .collect();

            if pending.is_empty() {
                break;
            }

            if Instant::now() >= deadline {
                trace!(
                    unchecked = pending.len(),
                    "scan deadline passed before every server was checked"
                );
                break;
            }

            for host in pending.keys() {
                if !self.monitors.contains_key(host) {
                    let monitor = Monitor::new(
                        host.clone(),
                        topology.connector(),
                        options,
                        topology.listener(),
                    );
                    self.monitors.insert(host.clone(), monitor);
                }
            }

            let round: Vec<(&mut Monitor, ServerType)> = self
                .monitors
                .iter_mut()
                .filter_map(|(host, monitor)| pending.get(host).map(|&stype| (monitor, stype)))
                .collect();

            check_round(topology, round, deadline);
            checked.extend(pending.into_iter().map(|(host, _)| host));
        }

        let current = topology.snapshot();
        self.monitors.retain(|host, _| current.servers.contains_key(host));
        self.last_scan = Some(Instant::now());
    }
}

// Runs one check per monitor concurrently and publishes each result as soon
// as it arrives. Returns once every check has finished.
fn check_round(topology: &Topology, round: Vec<(&mut Monitor, ServerType)>, deadline: Instant) {
    thread::scope(|scope| {
        for (monitor, previous_type) in round {
            let name = format!("scan-{}", monitor.host());
            let spawned = thread::Builder::new().name(name).spawn_scoped(scope, move || {
                let server = monitor.check(previous_type, Some(deadline));
                topology.apply_server_description(server);
            });

            if let Err(err) = spawned {
                warn!(error = %err, "failed to start a scan thread");
            }
        }
    });
}
