//! Server discovery, monitoring, selection and connection pooling for MongoDB deployments.
//!
//! A `Client` tracks the servers of a standalone deployment, a replica set,
//! or a sharded cluster, chooses a server for each operation according to a
//! read preference, and hands out pooled connections to that server.
//!
//! ## Connecting
//!
//! ```no_run
//! use mongodb_sdam::Client;
//! use mongodb_sdam::common::{ReadMode, ReadPreference};
//!
//! let client = Client::with_uri("mongodb://a.example.com,b.example.com/?replicaSet=rs0")
//!     .expect("invalid connection string");
//!
//! let host = client
//!     .select_server(&ReadPreference::new(ReadMode::SecondaryPreferred, None))
//!     .expect("no server available");
//!
//! let _conn = client.checkout(&host).expect("failed to check out a connection");
//! ```
//!
//! ## Monitoring
//!
//! Hooks registered with `add_listener_hook` see every topology event:
//!
//! ```no_run
//! use mongodb_sdam::Client;
//! use mongodb_sdam::apm::TopologyEvent;
//!
//! let client = Client::with_uri("mongodb://localhost:27017").unwrap();
//! client
//!     .add_listener_hook(Box::new(|event: &TopologyEvent| println!("{}", event)))
//!     .unwrap();
//! ```
pub mod apm;
pub mod common;
pub mod connection;
pub mod connstring;
pub mod error;
pub mod options;
pub mod pool;
pub mod stream;
pub mod topology;
pub mod wire_protocol;

pub use crate::error::{Error, Result};

use crate::apm::{EventHook, Listener, TopologyEvent};
use crate::common::ReadPreference;
use crate::connection::{check_ok, Connector};
use crate::connstring::Host;
use crate::error::Error::ArgumentError;
use crate::options::ClientOptions;
use crate::pool::{ConnectionPool, PoolOptions, PooledConnection};
use crate::stream::TcpConnector;
use crate::topology::description::TopologyDescription;
use crate::topology::selection::SelectionCriteria;
use crate::topology::Topology;

use bson::Document;
use tracing::{debug, warn};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

type PoolMap = Arc<Mutex<HashMap<Host, ConnectionPool>>>;

struct ClientInner {
    topology: Topology,
    pools: PoolMap,
    connector: Arc<dyn Connector>,
    listener: Arc<Listener>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.topology.close();
        close_pools(&self.pools);
    }
}

/// Interfaces with a MongoDB deployment.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

fn close_pools(pools: &PoolMap) {
    let drained: Vec<ConnectionPool> = match pools.lock() {
        Ok(mut pools) => pools.drain().map(|(_, pool)| pool).collect(),
        Err(_) => return,
    };

    for pool in drained {
        if let Err(err) = pool.close() {
            warn!(host = %pool.host, error = %err, "failed to close connection pool");
        }
    }
}

// Keeps the pools in step with the topology: a server leaving the topology
// takes its pool with it, and a failed heartbeat clears the server's pool.
fn pool_maintenance_hook(pools: PoolMap) -> EventHook {
    Box::new(move |event: &TopologyEvent| match *event {
        TopologyEvent::ServerClosed { ref address } => {
            let removed = pools.lock().ok().and_then(|mut pools| pools.remove(address));
            if let Some(pool) = removed {
                debug!(host = %address, "dropping connection pool of removed server");
                if let Err(err) = pool.close() {
                    warn!(host = %address, error = %err, "failed to close connection pool");
                }
            }
        }
        TopologyEvent::ServerHeartbeatFailed { ref address, .. } => {
            let pool = pools.lock().ok().and_then(|pools| pools.get(address).cloned());
            if let Some(pool) = pool {
                if let Err(err) = pool.clear() {
                    warn!(host = %address, error = %err, "failed to clear connection pool");
                }
            }
        }
        _ => (),
    })
}

impl Client {
    /// Creates a new client from a MongoDB connection string URI as defined by
    /// [the manual](http://docs.mongodb.org/manual/reference/connection-string/).
    pub fn with_uri(uri: &str) -> Result<Client> {
        Client::with_options(ClientOptions::parse(uri)?)
    }

    /// Creates a new client using the default TCP transport.
    pub fn with_options(options: ClientOptions) -> Result<Client> {
        let connector = Arc::new(TcpConnector::new(options.socket_timeout));
        Client::with_connector(options, connector)
    }

    /// Creates a new client that opens connections through `connector`.
    pub fn with_connector(options: ClientOptions, connector: Arc<dyn Connector>) -> Result<Client> {
        options.validate()?;

        let pools: PoolMap = Arc::new(Mutex::new(HashMap::new()));
        let listener = Arc::new(Listener::new());
        listener.add_hook(pool_maintenance_hook(pools.clone()))?;

        let topology = Topology::new(options, connector.clone(), listener.clone())?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                topology: topology,
                pools: pools,
                connector: connector,
                listener: listener,
            }),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        self.inner.topology.options()
    }

    /// Returns the current topology description.
    pub fn topology(&self) -> Arc<TopologyDescription> {
        self.inner.topology.snapshot()
    }

    /// Returns the live topology this client monitors.
    pub fn topology_manager(&self) -> &Topology {
        &self.inner.topology
    }

    /// Registers a hook run for every topology event.
    pub fn add_listener_hook(&self, hook: EventHook) -> Result<()> {
        self.inner.listener.add_hook(hook)
    }

    /// Selects a server to read from with `read_preference`.
    pub fn select_server(&self, read_preference: &ReadPreference) -> Result<Host> {
        let criteria = SelectionCriteria::Read(read_preference.clone());
        Ok(self.inner.topology.select_server(&criteria)?.address)
    }

    /// Selects a server that accepts writes.
    pub fn select_server_for_write(&self) -> Result<Host> {
        Ok(self.inner.topology.select_server(&SelectionCriteria::Write)?.address)
    }

    /// Returns the pool for `host`, creating it on first use.
    pub fn pool(&self, host: &Host) -> Result<ConnectionPool> {
        if !self.inner.topology.snapshot().servers.contains_key(host) {
            return Err(ArgumentError(format!("{} is not part of the topology.", host)));
        }

        let mut pools = self.inner.pools.lock()?;
        if let Some(pool) = pools.get(host) {
            return Ok(pool.clone());
        }

        let options = PoolOptions::from(self.options());
        let populate = options.min_size > 0;
        let pool = ConnectionPool::new(host.clone(), self.inner.connector.clone(), options);
        pools.insert(host.clone(), pool.clone());
        drop(pools);

        if populate {
            let background = pool.clone();
            thread::Builder::new()
                .name(format!("populate-{}", host))
                .spawn(move || {
                    if let Err(err) = background.populate_min() {
                        debug!(host = %background.host, error = %err, "failed to populate pool");
                    }
                })?;
        }

        Ok(pool)
    }

    /// Checks out a connection to `host`. Failing to establish a connection
    /// is handled like any other network error against that server.
    pub fn checkout(&self, host: &Host) -> Result<PooledConnection> {
        let deadline = Instant::now() + self.options().wait_queue_timeout;
        self.checkout_with_deadline(host, deadline)
    }

    /// Checks out a connection to `host`, waiting for one no later than
    /// `deadline` or the pool's wait queue timeout, whichever comes first.
    pub fn checkout_with_deadline(
        &self,
        host: &Host,
        deadline: Instant,
    ) -> Result<PooledConnection> {
        let pool = self.pool(host)?;
        let generation = pool.generation()?;

        pool.checkout_with_deadline(deadline).map_err(|err| {
            self.handle_operation_error(host, generation, &err);
            err
        })
    }

    /// Selects a server for `criteria`, checks out a connection to it, and
    /// runs `command` against `db`. Selection and checkout share the server
    /// selection timeout. Failures are fed back into the topology before
    /// they are returned.
    pub fn run_command(
        &self,
        criteria: &SelectionCriteria,
        db: &str,
        command: Document,
    ) -> Result<Document> {
        let deadline = Instant::now() + self.options().server_selection_timeout;
        let server = self.inner.topology.select_server_with_deadline(criteria, deadline)?;
        let mut conn = self.checkout_with_deadline(&server.address, deadline)?;
        let generation = conn.generation();

        match conn.send_command(db, command, None).and_then(check_ok) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                drop(conn);
                if err.is_network_timeout() {
                    // Timeouts on an established connection leave the server
                    // description and the pool alone.
                    debug!(host = %server.address, "operation timed out");
                    self.inner.topology.request_immediate_scan(&server.address);
                } else {
                    self.handle_operation_error(&server.address, generation, &err);
                }
                Err(err)
            }
        }
    }

    /// Feeds an error observed on a connection of `generation` to `host`
    /// back into the pool and the topology.
    ///
    /// Network errors clear the pool, mark the server Unknown and request an
    /// immediate check. "Not writable primary" and "node is recovering"
    /// replies mark the server Unknown and request a check, clearing the
    /// pool only when the node is shutting down. Errors from connections
    /// older than the pool's generation were already handled and are ignored.
    pub fn handle_operation_error(&self, host: &Host, generation: u64, err: &Error) {
        let pool = self
            .inner
            .pools
            .lock()
            .ok()
            .and_then(|pools| pools.get(host).cloned());

        if let Some(ref pool) = pool {
            match pool.generation() {
                Ok(current) if current != generation => {
                    debug!(%host, generation, current, "ignoring error from stale connection");
                    return;
                }
                _ => (),
            }
        }

        let clear = err.is_network_error() || err.is_shutting_down();

        if err.is_network_error() || err.is_state_change_error() {
            if clear {
                if let Some(ref pool) = pool {
                    if let Err(lock_err) = pool.invalidate(generation) {
                        warn!(%host, error = %lock_err, "failed to invalidate connection pool");
                    }
                }
            }

            self.inner.topology.mark_server_unknown(host, &err.to_string());
            self.inner.topology.request_immediate_scan(host);
        }
    }

    /// Stops monitoring and closes every pool.
    pub fn close(&self) {
        self.inner.topology.close();
        close_pools(&self.inner.pools);
    }
}
