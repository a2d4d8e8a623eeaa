//! Server monitoring using isMaster heartbeats.
use crate::apm::{Listener, TopologyEvent};
use crate::connection::{self, Connection, Connector};
use crate::connstring::Host;
use crate::error::Result;
use crate::options::{ClientOptions, MIN_HEARTBEAT_FREQUENCY_MS};

use tracing::{debug, trace};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use super::server::{IsMasterResult, ServerDescription, ServerType};
use super::{Topology, TopologyInner};

// Weight given to the newest round trip sample.
const RTT_ALPHA: f64 = 0.2;

/// Folds a new round trip sample into the moving average.
pub fn average_round_trip_time(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(average) => RTT_ALPHA * sample + (1.0 - RTT_ALPHA) * average,
        None => sample,
    }
}

/// Checks one server over a private connection that is never shared with
/// the connection pool.
pub struct Monitor {
    // Host being monitored.
    host: Host,
    connector: Arc<dyn Connector>,
    // Discarded after any error; the next check reconnects.
    connection: Option<Box<dyn Connection>>,
    round_trip_time: Option<f64>,
    connect_timeout: Duration,
    heartbeat_frequency: Duration,
    app_name: Option<String>,
    listener: Arc<Listener>,
}

impl Monitor {
    pub fn new(
        host: Host,
        connector: Arc<dyn Connector>,
        options: &ClientOptions,
        listener: Arc<Listener>,
    ) -> Monitor {
        Monitor {
            host: host,
            connector: connector,
            connection: None,
            round_trip_time: None,
            connect_timeout: options.connect_timeout,
            heartbeat_frequency: options.heartbeat_frequency,
            app_name: options.app_name.clone(),
            listener: listener,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// The current round trip average, in milliseconds.
    pub fn round_trip_time(&self) -> Option<f64> {
        self.round_trip_time
    }

    fn run_hooks(&self, event: TopologyEvent) {
        if let Err(err) = self.listener.run_hooks(&event) {
            debug!(error = %err, "failed to run heartbeat hooks");
        }
    }

    // Runs isMaster, opening a connection first if needed.
    fn exchange(&mut self, timeout: Duration) -> Result<(bson::Document, Duration)> {
        let include_metadata = self.connection.is_none();
        let mut conn = match self.connection.take() {
            Some(conn) => conn,
            None => self.connector.connect(&self.host, timeout)?,
        };

        let result =
            connection::handshake(&mut *conn, include_metadata, self.app_name.as_deref(), timeout);
        if result.is_ok() {
            self.connection = Some(conn);
        }
        result
    }

    // One heartbeat attempt.
    fn heartbeat(&mut self, timeout: Duration) -> Result<ServerDescription> {
        self.run_hooks(TopologyEvent::ServerHeartbeatStarted {
            address: self.host.clone(),
        });

        let start = Instant::now();
        let result = self
            .exchange(timeout)
            .and_then(|(reply, rtt)| Ok((IsMasterResult::new(reply.clone())?, reply, rtt)));

        match result {
            Ok((ismaster, reply, rtt)) => {
                let sample = rtt.as_secs_f64() * 1000.0;
                let average = average_round_trip_time(self.round_trip_time, sample);
                self.round_trip_time = Some(average);

                trace!(host = %self.host, rtt_ms = average, "heartbeat succeeded");
                self.run_hooks(TopologyEvent::ServerHeartbeatSucceeded {
                    address: self.host.clone(),
                    duration: rtt,
                    reply: reply,
                });

                Ok(ServerDescription::from_is_master(self.host.clone(), ismaster, Some(average)))
            }
            Err(err) => {
                self.connection = None;
                self.round_trip_time = None;

                debug!(host = %self.host, error = %err, "heartbeat failed");
                self.run_hooks(TopologyEvent::ServerHeartbeatFailed {
                    address: self.host.clone(),
                    duration: start.elapsed(),
                    failure: err.to_string(),
                });

                Err(err)
            }
        }
    }

    /// Checks the server and returns its new description. A network error
    /// against a server that was known before is retried once on a fresh
    /// connection. `deadline` bounds the whole check.
    pub fn check(&mut self, previous_type: ServerType, deadline: Option<Instant>) -> ServerDescription {
        let timeout = |connect_timeout: Duration| match deadline {
            Some(deadline) => deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_default()
                .min(connect_timeout),
            None => connect_timeout,
        };

        match self.heartbeat(timeout(self.connect_timeout)) {
            Ok(description) => description,
            Err(err) => {
                let retry = err.is_network_error()
                    && previous_type.is_known()
                    && timeout(self.connect_timeout) > Duration::from_millis(0);

                let err = if retry {
                    debug!(host = %self.host, "retrying heartbeat against previously known server");
                    match self.heartbeat(timeout(self.connect_timeout)) {
                        Ok(description) => return description,
                        Err(err) => err,
                    }
                } else {
                    err
                };

                ServerDescription::with_error(self.host.clone(), err.to_string())
            }
        }
    }
}

struct Signal {
    running: AtomicBool,
    check_requested: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // Sleeps until `deadline`, waking early on stop, and on check requests
    // when `interruptible`.
    fn wait_until(&self, deadline: Instant, interruptible: bool) {
        let mut requested = self
            .check_requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while self.is_running() && !(interruptible && *requested) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            requested = match self.condvar.wait_timeout(requested, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        if interruptible {
            *requested = false;
        }
    }
}

/// Runs a monitor on its own thread until stopped or until the topology is dropped.
pub struct MonitorHandle {
    signal: Arc<Signal>,
}

impl MonitorHandle {
    pub(crate) fn spawn(mut monitor: Monitor, topology: Weak<TopologyInner>) -> Result<MonitorHandle> {
        let signal = Arc::new(Signal {
            running: AtomicBool::new(true),
            check_requested: Mutex::new(false),
            condvar: Condvar::new(),
        });

        let thread_signal = signal.clone();
        thread::Builder::new()
            .name(format!("monitor-{}", monitor.host()))
            .spawn(move || monitor.run(&thread_signal, &topology))?;

        Ok(MonitorHandle { signal: signal })
    }

    /// Wakes the monitor so it checks its server without waiting out the
    /// heartbeat frequency.
    pub fn request_check(&self) {
        let mut requested = self
            .signal
            .check_requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *requested = true;
        self.signal.condvar.notify_all();
    }

    pub fn stop(&self) {
        self.signal.running.store(false, Ordering::SeqCst);
        self.signal.condvar.notify_all();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Monitor {
    fn run(&mut self, signal: &Signal, topology: &Weak<TopologyInner>) {
        let min_interval = Duration::from_millis(MIN_HEARTBEAT_FREQUENCY_MS);
        let mut last_check: Option<Instant> = None;

        while signal.is_running() {
            if let Some(last) = last_check {
                signal.wait_until(last + min_interval, false);
                if !signal.is_running() {
                    break;
                }
            }

            let previous_type = match topology.upgrade() {
                Some(inner) => match Topology::from_inner(inner).server_type(&self.host) {
                    Some(stype) => stype,
                    None => break,
                },
                None => break,
            };

            let description = self.check(previous_type, None);
            last_check = Some(Instant::now());

            if !signal.is_running() {
                break;
            }

            match topology.upgrade() {
                Some(inner) => {
                    Topology::from_inner(inner).apply_server_description(description);
                }
                None => break,
            }

            signal.wait_until(Instant::now() + self.heartbeat_frequency, true);
        }

        trace!(host = %self.host, "monitor stopped");
    }
}
