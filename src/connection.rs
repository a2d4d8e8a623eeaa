//! The transport seam: connections that exchange one command and one reply at a time.
use crate::connstring::Host;
use crate::error::Error::{CommandError, HandshakeError};
use crate::error::Result;

use bson::{Bson, Document};
use std::time::{Duration, Instant};

pub const DRIVER_NAME: &str = "mongodb-sdam";

/// A live, exclusively owned connection to one server.
pub trait Connection: Send {
    /// The address this connection talks to.
    fn host(&self) -> &Host;

    /// Sends `command` against database `db` and waits up to `timeout` for the
    /// reply. The reply is returned even when it reports `ok: 0`.
    fn send_command(&mut self, db: &str, command: Document, timeout: Option<Duration>)
        -> Result<Document>;
}

/// Opens connections to servers.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &Host, timeout: Duration) -> Result<Box<dyn Connection>>;
}

/// Builds the `isMaster` handshake command. Client metadata is only sent on
/// the first handshake of a connection.
pub fn is_master_command(include_metadata: bool, app_name: Option<&str>) -> Document {
    let mut command = Document::new();
    command.insert("isMaster", Bson::I32(1));

    if include_metadata {
        let mut driver = Document::new();
        driver.insert("name", DRIVER_NAME);
        driver.insert("version", env!("CARGO_PKG_VERSION"));

        let mut os = Document::new();
        os.insert("type", ::std::env::consts::OS);
        os.insert("architecture", ::std::env::consts::ARCH);

        let mut client = Document::new();
        if let Some(name) = app_name {
            let mut application = Document::new();
            application.insert("name", name);
            client.insert("application", application);
        }
        client.insert("driver", driver);
        client.insert("os", os);

        command.insert("client", client);
    }

    command
}

/// Runs an `isMaster` on `conn`, returning the reply and the measured round trip.
pub fn handshake(
    conn: &mut dyn Connection,
    include_metadata: bool,
    app_name: Option<&str>,
    timeout: Duration,
) -> Result<(Document, Duration)> {
    let command = is_master_command(include_metadata, app_name);
    let start = Instant::now();
    let reply = conn.send_command("admin", command, Some(timeout))?;
    let round_trip_time = start.elapsed();

    match check_ok(reply) {
        Ok(reply) => Ok((reply, round_trip_time)),
        Err(err) => Err(HandshakeError {
            host: conn.host().clone(),
            message: err.to_string(),
        }),
    }
}

/// Whether a reply's `ok` field is truthy, accepting any numeric encoding.
pub fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(&Bson::I32(v)) => v != 0,
        Some(&Bson::I64(v)) => v != 0,
        Some(&Bson::FloatingPoint(v)) => v != 0.0,
        Some(&Bson::Boolean(b)) => b,
        _ => false,
    }
}

/// Converts an `ok: 0` reply into a `CommandError`.
pub fn check_ok(reply: Document) -> Result<Document> {
    if reply_ok(&reply) {
        return Ok(reply);
    }

    let code = match reply.get("code") {
        Some(&Bson::I32(v)) => v,
        Some(&Bson::I64(v)) => v as i32,
        Some(&Bson::FloatingPoint(v)) => v as i32,
        _ => 0,
    };

    let message = match reply.get("errmsg") {
        Some(&Bson::String(ref s)) => s.to_owned(),
        _ => "command failed without an error message".to_owned(),
    };

    Err(CommandError {
        code: code,
        message: message,
    })
}
