//! The default TCP transport.
use crate::connection::{Connection, Connector};
use crate::connstring::Host;
use crate::error::Error::{self, ResponseError};
use crate::error::Result;
use crate::wire_protocol::flags::{OpMsgFlags, OpQueryFlags};
use crate::wire_protocol::operations::Message;

use bson::{Bson, Document};
use bufstream::BufStream;
use tracing::trace;

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

// Servers at or above this wire version accept OP_MSG.
const OP_MSG_WIRE_VERSION: i64 = 6;

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Connects to servers over plain TCP.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    /// Applied to commands sent without an explicit timeout.
    pub socket_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(socket_timeout: Option<Duration>) -> TcpConnector {
        TcpConnector {
            socket_timeout: socket_timeout,
        }
    }

    // Tries every resolved address in turn, keeping the last error.
    fn open(host: &Host, timeout: Duration) -> Result<TcpStream> {
        let addrs = (&host.host_name[..], host.port).to_socket_addrs()?;
        let mut last_err = None;

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(Error::IoError(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve to any address", host),
            )
        })))
    }
}

impl Connector for TcpConnector {
    fn connect(&self, host: &Host, timeout: Duration) -> Result<Box<dyn Connection>> {
        let stream = TcpConnector::open(host, timeout)?;
        trace!(%host, "opened connection");

        Ok(Box::new(TcpConnection {
            host: host.clone(),
            stream: BufStream::new(stream),
            default_timeout: self.socket_timeout,
            use_op_msg: false,
        }))
    }
}

/// A buffered TCP connection speaking OP_QUERY until the server advertises OP_MSG support.
pub struct TcpConnection {
    host: Host,
    stream: BufStream<TcpStream>,
    default_timeout: Option<Duration>,
    use_op_msg: bool,
}

impl TcpConnection {
    fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let socket = self.stream.get_ref();
        socket.set_read_timeout(timeout)?;
        socket.set_write_timeout(timeout)?;
        Ok(())
    }

    fn encode(&self, db: &str, mut command: Document) -> Result<Message> {
        if self.use_op_msg {
            command.insert("$db", db);
            Message::new_msg(next_request_id(), OpMsgFlags::empty(), command)
        } else {
            Message::new_query(
                next_request_id(),
                OpQueryFlags::SLAVE_OK,
                format!("{}.$cmd", db),
                0,
                -1,
                command,
            )
        }
    }
}

impl Connection for TcpConnection {
    fn host(&self) -> &Host {
        &self.host
    }

    fn send_command(&mut self, db: &str, command: Document, timeout: Option<Duration>)
        -> Result<Document> {
        self.set_timeout(timeout.or(self.default_timeout))?;

        let message = self.encode(db, command)?;
        let request_id = message.header().request_id;
        message.write(&mut self.stream)?;

        let reply = Message::read(&mut self.stream)?;
        if reply.header().response_to != request_id {
            return Err(ResponseError(format!(
                "Reply answers request {} but {} was sent.",
                reply.header().response_to,
                request_id
            )));
        }

        let document = reply.into_reply_document()?;

        match document.get("maxWireVersion") {
            Some(&Bson::I32(v)) if v as i64 >= OP_MSG_WIRE_VERSION => self.use_op_msg = true,
            Some(&Bson::I64(v)) if v >= OP_MSG_WIRE_VERSION => self.use_op_msg = true,
            _ => (),
        }

        Ok(document)
    }
}
