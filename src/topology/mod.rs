//! Server discovery and monitoring.
//!
//! A `Topology` owns the current `TopologyDescription`, applies the server
//! descriptions produced by monitors to it, and lets callers wait until the
//! description satisfies a selection.
pub mod description;
pub mod monitor;
pub mod scanner;
pub mod selection;
pub mod server;

use crate::apm::{Listener, TopologyEvent};
use crate::connection::Connector;
use crate::connstring::Host;
use crate::error::Error::{ServerSelectionTimeout, TopologyClosed};
use crate::error::Result;
use crate::options::{ClientOptions, MonitorMode};

use tracing::{debug, trace, warn};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError, Weak};
use std::time::{Duration, Instant};

use self::description::TopologyDescription;
use self::monitor::{Monitor, MonitorHandle};
use self::scanner::Scanner;
use self::selection::SelectionCriteria;
use self::server::{ServerDescription, ServerType};

struct TopologyState {
    description: Arc<TopologyDescription>,
    // Bumped on every publish.
    version: u64,
    closed: bool,
}

pub(crate) struct TopologyInner {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    listener: Arc<Listener>,
    state: Mutex<TopologyState>,
    // Notified whenever a new description is published.
    condvar: Condvar,
    // Threaded mode only.
    monitors: Mutex<HashMap<Host, MonitorHandle>>,
    // Cooperative mode only.
    scanner: Mutex<Scanner>,
    rescan_requested: AtomicBool,
}

/// Holds the live topology description of a server set.
#[derive(Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

// Recovers the guard from a poisoned lock. Every critical section leaves the
// state consistent, so a panicking hook elsewhere must not wedge the topology.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Topology {
    /// Returns a new topology seeded from `options`, starting monitors when
    /// running in threaded mode.
    pub fn new(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        listener: Arc<Listener>,
    ) -> Result<Topology> {
        options.validate()?;

        let description = TopologyDescription::new(
            &options.hosts,
            options.replica_set.clone(),
            options.heartbeat_frequency,
            options.local_threshold,
        );

        let topology = Topology {
            inner: Arc::new(TopologyInner {
                options: options,
                connector: connector,
                listener: listener,
                state: Mutex::new(TopologyState {
                    description: Arc::new(description),
                    version: 0,
                    closed: false,
                }),
                condvar: Condvar::new(),
                monitors: Mutex::new(HashMap::new()),
                scanner: Mutex::new(Scanner::new()),
                rescan_requested: AtomicBool::new(false),
            }),
        };

        for host in topology.snapshot().server_addresses() {
            topology.run_hooks(&TopologyEvent::ServerOpening { address: host });
        }

        topology.sync_monitors()?;
        Ok(topology)
    }

    pub(crate) fn from_inner(inner: Arc<TopologyInner>) -> Topology {
        Topology { inner: inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<TopologyInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        self.inner.connector.clone()
    }

    pub(crate) fn listener(&self) -> Arc<Listener> {
        self.inner.listener.clone()
    }

    /// Returns the current description. Never waits on I/O.
    pub fn snapshot(&self) -> Arc<TopologyDescription> {
        lock(&self.inner.state).description.clone()
    }

    /// The number of descriptions published so far.
    pub fn version(&self) -> u64 {
        lock(&self.inner.state).version
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// The current type of the server at `host`, if it is part of the topology.
    pub fn server_type(&self, host: &Host) -> Option<ServerType> {
        self.snapshot().servers.get(host).map(|server| server.server_type)
    }

    pub(crate) fn run_hooks(&self, event: &TopologyEvent) {
        if let Err(err) = self.inner.listener.run_hooks(event) {
            warn!(error = %err, "failed to run topology event hooks");
        }
    }

    /// Applies a server description and publishes the resulting topology
    /// description, waking every selection waiter. Descriptions for servers
    /// that are no longer part of the topology are ignored.
    ///
    /// Returns whether a new description was published.
    pub fn apply_server_description(&self, description: ServerDescription) -> bool {
        let (previous, next) = {
            let mut state = lock(&self.inner.state);
            if state.closed || !state.description.servers.contains_key(&description.address) {
                return false;
            }

            let previous = state.description.clone();
            let next = Arc::new(previous.update(description));
            state.description = next.clone();
            state.version += 1;
            self.inner.condvar.notify_all();
            (previous, next)
        };

        if let Err(err) = self.sync_monitors() {
            warn!(error = %err, "failed to start server monitors");
        }

        for event in diff_events(&previous, &next) {
            self.run_hooks(&event);
        }

        true
    }

    /// Marks a server Unknown ahead of its next heartbeat.
    pub fn mark_server_unknown(&self, host: &Host, error: &str) {
        debug!(%host, error, "marking server unknown");
        self.apply_server_description(ServerDescription::with_error(
            host.clone(),
            error.to_owned(),
        ));
    }

    /// Asks the monitor for `host` to check its server now.
    pub fn request_immediate_scan(&self, host: &Host) {
        match self.inner.options.monitor_mode {
            MonitorMode::Threaded => {
                if let Some(handle) = lock(&self.inner.monitors).get(host) {
                    handle.request_check();
                }
            }
            MonitorMode::Cooperative => {
                self.inner.rescan_requested.store(true, Ordering::SeqCst);
            }
        }
    }

    fn request_scan_of_all(&self) {
        match self.inner.options.monitor_mode {
            MonitorMode::Threaded => {
                for handle in lock(&self.inner.monitors).values() {
                    handle.request_check();
                }
            }
            MonitorMode::Cooperative => {
                self.inner.rescan_requested.store(true, Ordering::SeqCst);
            }
        }
    }

    // Starts monitors for new servers and stops those of removed servers.
    // The monitor map is reconciled against the latest snapshot, so racing
    // publishes converge on the same set of monitors.
    fn sync_monitors(&self) -> Result<()> {
        if self.inner.options.monitor_mode != MonitorMode::Threaded {
            return Ok(());
        }

        let mut monitors = lock(&self.inner.monitors);
        let (description, closed) = {
            let state = lock(&self.inner.state);
            (state.description.clone(), state.closed)
        };

        if closed {
            monitors.clear();
            return Ok(());
        }

        monitors.retain(|host, _| description.servers.contains_key(host));

        for host in description.server_addresses() {
            if monitors.contains_key(&host) {
                continue;
            }

            let monitor = Monitor::new(
                host.clone(),
                self.inner.connector.clone(),
                &self.inner.options,
                self.inner.listener.clone(),
            );
            let handle = MonitorHandle::spawn(monitor, self.downgrade())?;
            monitors.insert(host, handle);
        }

        Ok(())
    }

    // Runs a cooperative scan if one is due and no other thread is already
    // scanning. Returns whether a scan ran.
    fn scan_if_due(&self) -> bool {
        let mut scanner = match self.inner.scanner.try_lock() {
            Ok(scanner) => scanner,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };

        let requested = self.inner.rescan_requested.load(Ordering::SeqCst);
        if !scanner.is_due(self.inner.options.heartbeat_frequency, requested) {
            return false;
        }

        self.inner.rescan_requested.store(false, Ordering::SeqCst);
        scanner.scan(self);
        true
    }

    // How long a cooperative waiter may sleep before the next scan is due.
    fn until_next_scan(&self) -> Option<Duration> {
        if self.inner.options.monitor_mode != MonitorMode::Cooperative {
            return None;
        }

        // A scan in progress on another thread publishes as it goes.
        let scanner = match self.inner.scanner.try_lock() {
            Ok(scanner) => scanner,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };

        let requested = self.inner.rescan_requested.load(Ordering::SeqCst);
        Some(scanner.until_due(self.inner.options.heartbeat_frequency, requested))
    }

    /// Blocks until `predicate` holds for the current description or
    /// `deadline` passes. Returns the qualifying description, or `None` on
    /// timeout.
    pub fn wait_for_qualifying<F>(
        &self,
        mut predicate: F,
        deadline: Instant,
    ) -> Result<Option<Arc<TopologyDescription>>>
    where
        F: FnMut(&TopologyDescription) -> bool,
    {
        let cooperative = self.inner.options.monitor_mode == MonitorMode::Cooperative;

        loop {
            let (description, version) = {
                let state = lock(&self.inner.state);
                if state.closed {
                    return Err(TopologyClosed);
                }
                (state.description.clone(), state.version)
            };

            if predicate(&description) {
                return Ok(Some(description));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            if cooperative && self.scan_if_due() {
                continue;
            }

            self.request_scan_of_all();

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut wait = deadline - now;
            if let Some(next_scan) = self.until_next_scan() {
                wait = wait.min(next_scan);
            }

            trace!(version, wait_ms = wait.as_millis() as u64, "waiting for topology change");

            let state = lock(&self.inner.state);
            if state.version == version && !state.closed {
                let _ = self
                    .inner
                    .condvar
                    .wait_timeout(state, wait)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
    }

    /// Selects a server for `criteria`, waiting up to the server selection timeout.
    pub fn select_server(&self, criteria: &SelectionCriteria) -> Result<ServerDescription> {
        let deadline = Instant::now() + self.inner.options.server_selection_timeout;
        self.select_server_with_deadline(criteria, deadline)
    }

    /// Selects a server for `criteria`, waiting until `deadline` for one to qualify.
    pub fn select_server_with_deadline(
        &self,
        criteria: &SelectionCriteria,
        deadline: Instant,
    ) -> Result<ServerDescription> {
        if let Some(read_preference) = criteria.read_preference() {
            read_preference.validate(self.inner.options.heartbeat_frequency)?;
        }

        let start = Instant::now();
        let mut outcome = None;

        self.wait_for_qualifying(
            |description| match selection::select(description, criteria) {
                Ok(Some(server)) => {
                    outcome = Some(Ok(server.clone()));
                    true
                }
                Ok(None) => false,
                Err(err) => {
                    outcome = Some(Err(err));
                    true
                }
            },
            deadline,
        )?;

        match outcome {
            Some(Ok(server)) => {
                debug!(host = %server.address, %criteria, "selected server");
                Ok(server)
            }
            Some(Err(err)) => Err(err),
            None => Err(ServerSelectionTimeout(self.timeout_message(criteria, start.elapsed()))),
        }
    }

    fn timeout_message(&self, criteria: &SelectionCriteria, waited: Duration) -> String {
        let description = self.snapshot();
        let rejections: Vec<String> = selection::explain_rejections(&description, criteria)
            .into_iter()
            .map(|(host, reason)| format!("{}: {}", host, reason))
            .collect();

        format!(
            "Server selection timed out after {} ms for {}. Topology: {}. Rejected servers: [{}]",
            waited.as_millis(),
            criteria,
            description,
            rejections.join("; ")
        )
    }

    /// Stops monitoring and fails every pending and future selection.
    pub fn close(&self) {
        let description = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            self.inner.condvar.notify_all();
            state.description.clone()
        };

        lock(&self.inner.monitors).clear();
        debug!("topology closed");

        for host in description.server_addresses() {
            self.run_hooks(&TopologyEvent::ServerClosed { address: host });
        }
    }
}

// The events describing the step from `previous` to `next`.
fn diff_events(previous: &TopologyDescription, next: &TopologyDescription) -> Vec<TopologyEvent> {
    let mut events = Vec::new();
    let mut changed = previous.topology_type != next.topology_type
        || previous.set_name != next.set_name
        || previous.compatible != next.compatible;

    for host in next.server_addresses() {
        let server = &next.servers[&host];
        match previous.servers.get(&host) {
            None => {
                changed = true;
                events.push(TopologyEvent::ServerOpening {
                    address: host.clone(),
                });
            }
            Some(old) if !old.same_state_as(server) => {
                changed = true;
                events.push(TopologyEvent::ServerDescriptionChanged {
                    address: host.clone(),
                    previous: old.clone(),
                    new: server.clone(),
                });
            }
            Some(_) => (),
        }
    }

    for host in previous.server_addresses() {
        if !next.servers.contains_key(&host) {
            changed = true;
            events.push(TopologyEvent::ServerClosed { address: host });
        }
    }

    if changed {
        events.push(TopologyEvent::TopologyDescriptionChanged {
            previous: previous.clone(),
            new: next.clone(),
        });
    }

    events
}
