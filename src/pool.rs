//! Connection pooling for a single MongoDB server.
use crate::connection::{self, Connection, Connector};
use crate::connstring::Host;
use crate::error::Error::{PoolClosed, ResponseError, WaitQueueTimeout};
use crate::error::Result;
use crate::options::ClientOptions;

use bson::Document;
use tracing::{debug, trace};

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// The limits a pool enforces.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub max_size: usize,
    pub min_size: usize,
    pub wait_queue_timeout: Duration,
    pub connect_timeout: Duration,
    pub app_name: Option<String>,
}

impl<'a> From<&'a ClientOptions> for PoolOptions {
    fn from(options: &'a ClientOptions) -> PoolOptions {
        PoolOptions {
            max_size: options.max_pool_size,
            min_size: options.min_pool_size,
            wait_queue_timeout: options.wait_queue_timeout,
            connect_timeout: options.connect_timeout,
            app_name: options.app_name.clone(),
        }
    }
}

/// A point-in-time view of a pool's bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub generation: u64,
    /// Open connections, idle or checked out, including ones being established.
    pub total: usize,
    pub idle: usize,
    pub max_size: usize,
}

/// Handles threaded connections to a MongoDB server.
#[derive(Clone)]
pub struct ConnectionPool {
    /// The connection host.
    pub host: Host,
    // The connection pool.
    inner: Arc<Mutex<Pool>>,
    // A condition variable used for threads waiting for the pool
    // to be repopulated with available connections.
    wait_lock: Arc<Condvar>,
    connector: Arc<dyn Connector>,
    options: PoolOptions,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.host)
            .finish()
    }
}

struct Pool {
    // The maximum number of concurrent connections allowed.
    size: usize,
    // The current number of open connections.
    len: usize,
    // The idle connections.
    connections: Vec<Box<dyn Connection>>,
    // The pool generation. When the pool is cleared, the generation is
    // incremented and connections from older generations are discarded.
    generation: u64,
    closed: bool,
}

impl Pool {
    // Accounts for a connection that will never come back.
    fn release(&mut self) {
        self.len = self.len.saturating_sub(1);
    }
}

/// Holds a checked-out connection, with logic to return the connection
/// to the connection pool when dropped.
pub struct PooledConnection {
    // Always Some(connection) until it is returned to the pool using take().
    connection: Option<Box<dyn Connection>>,
    // A reference to the pool that the connection was taken from.
    pool: Arc<Mutex<Pool>>,
    // A reference to the waiting condvar associated with the pool.
    wait_lock: Arc<Condvar>,
    // The pool generation at the moment of extraction.
    generation: u64,
    // Broken connections are closed instead of returned.
    broken: bool,
}

impl PooledConnection {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Prevents the connection from being returned to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Returns the underlying connection.
    pub fn connection(&mut self) -> Result<&mut (dyn Connection + 'static)> {
        match self.connection {
            Some(ref mut conn) => Ok(&mut **conn),
            None => Err(ResponseError("connection was already returned to its pool".to_owned())),
        }
    }

    /// Sends a command, marking the connection broken on network errors.
    pub fn send_command(
        &mut self,
        db: &str,
        command: Document,
        timeout: Option<Duration>,
    ) -> Result<Document> {
        let result = self.connection()?.send_command(db, command, timeout);
        if let Err(ref err) = result {
            if err.is_network_error() {
                self.mark_broken();
            }
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => return,
        };

        // Attempt to lock and return the connection to the pool,
        // or give up if the pool lock has been poisoned.
        if let Ok(mut locked) = self.pool.lock() {
            if self.broken || locked.closed || self.generation != locked.generation {
                locked.release();
            } else {
                locked.connections.push(connection);
            }
            // Notify waiting threads that the pool has been repopulated.
            self.wait_lock.notify_one();
        }
    }
}

impl ConnectionPool {
    /// Returns an empty pool for `host`.
    pub fn new(host: Host, connector: Arc<dyn Connector>, options: PoolOptions) -> ConnectionPool {
        ConnectionPool {
            host: host,
            wait_lock: Arc::new(Condvar::new()),
            inner: Arc::new(Mutex::new(Pool {
                size: options.max_size,
                len: 0,
                connections: Vec::with_capacity(options.max_size),
                generation: 0,
                closed: false,
            })),
            connector: connector,
            options: options,
        }
    }

    pub fn generation(&self) -> Result<u64> {
        Ok(self.inner.lock()?.generation)
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let locked = self.inner.lock()?;
        Ok(PoolStats {
            generation: locked.generation,
            total: locked.len,
            idle: locked.connections.len(),
            max_size: locked.size,
        })
    }

    /// Closes all idle connections and starts a new generation, so
    /// connections checked out earlier are closed when returned.
    pub fn clear(&self) -> Result<()> {
        let mut locked = self.inner.lock()?;
        locked.generation += 1;
        let idle = locked.connections.len();
        locked.connections.clear();
        locked.len = locked.len.saturating_sub(idle);
        self.wait_lock.notify_all();
        debug!(host = %self.host, generation = locked.generation, "connection pool cleared");
        Ok(())
    }

    /// Clears the pool if `generation` is still current. A connection that
    /// failed after the pool was already cleared must not clear it again.
    ///
    /// Returns whether the pool was cleared.
    pub fn invalidate(&self, generation: u64) -> Result<bool> {
        if self.generation()? != generation {
            return Ok(false);
        }
        self.clear()?;
        Ok(true)
    }

    /// Closes the pool. Pending and future checkouts fail.
    pub fn close(&self) -> Result<()> {
        let mut locked = self.inner.lock()?;
        locked.closed = true;
        let idle = locked.connections.len();
        locked.connections.clear();
        locked.len = locked.len.saturating_sub(idle);
        self.wait_lock.notify_all();
        Ok(())
    }

    /// Attempts to acquire a connection. If none are idle and the pool has
    /// not reached its maximum size, a new connection is opened and
    /// handshaken outside the pool lock. Otherwise, the call blocks until a
    /// connection is returned or the wait queue timeout passes.
    pub fn checkout(&self) -> Result<PooledConnection> {
        self.checkout_with_deadline(Instant::now() + self.options.wait_queue_timeout)
    }

    /// Like `checkout`, but gives up waiting at `deadline` if that comes
    /// before the wait queue timeout.
    pub fn checkout_with_deadline(&self, deadline: Instant) -> Result<PooledConnection> {
        let deadline = deadline.min(Instant::now() + self.options.wait_queue_timeout);
        let mut locked = self.inner.lock()?;

        loop {
            if locked.closed {
                return Err(PoolClosed {
                    host: self.host.clone(),
                });
            }

            // Acquire available existing connection
            if let Some(connection) = locked.connections.pop() {
                return Ok(self.wrap(connection, locked.generation));
            }

            // Attempt to make a new connection
            if locked.len < locked.size {
                locked.len += 1;
                let generation = locked.generation;
                drop(locked);

                return match self.connect() {
                    Ok(connection) => Ok(self.wrap(connection, generation)),
                    Err(err) => {
                        if let Ok(mut locked) = self.inner.lock() {
                            locked.release();
                        }
                        self.wait_lock.notify_one();
                        Err(err)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitQueueTimeout {
                    host: self.host.clone(),
                });
            }

            // Release lock and wait for pool to be repopulated
            trace!(host = %self.host, "waiting for a pooled connection");
            locked = self.wait_lock.wait_timeout(locked, deadline - now)?.0;
        }
    }

    /// Opens connections until the pool holds at least its minimum size.
    pub fn populate_min(&self) -> Result<()> {
        loop {
            let generation = {
                let mut locked = self.inner.lock()?;
                if locked.closed || locked.len >= self.options.min_size {
                    return Ok(());
                }
                locked.len += 1;
                locked.generation
            };

            let connection = match self.connect() {
                Ok(connection) => connection,
                Err(err) => {
                    self.inner.lock()?.release();
                    return Err(err);
                }
            };

            let mut locked = self.inner.lock()?;
            if locked.closed || locked.generation != generation {
                locked.release();
                return Ok(());
            }
            locked.connections.push(connection);
            self.wait_lock.notify_one();
        }
    }

    fn wrap(&self, connection: Box<dyn Connection>, generation: u64) -> PooledConnection {
        PooledConnection {
            connection: Some(connection),
            pool: self.inner.clone(),
            wait_lock: self.wait_lock.clone(),
            generation: generation,
            broken: false,
        }
    }

    // Connects and runs the initial handshake.
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let timeout = self.options.connect_timeout;
        let mut connection = self.connector.connect(&self.host, timeout)?;
        connection::handshake(
            &mut *connection,
            true,
            self.options.app_name.as_deref(),
            timeout,
        )?;
        trace!(host = %self.host, "opened pooled connection");
        Ok(connection)
    }
}
