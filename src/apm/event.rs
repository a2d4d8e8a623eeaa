use std::fmt::{Display, Error, Formatter};
use std::time::Duration;

use bson::Document;

use crate::connstring::Host;
use crate::topology::description::TopologyDescription;
use crate::topology::server::ServerDescription;

/// Something observable that happened during discovery or monitoring.
#[derive(Clone, Debug)]
pub enum TopologyEvent {
    /// A server was added to the topology.
    ServerOpening { address: Host },
    /// A server was removed from the topology.
    ServerClosed { address: Host },
    ServerDescriptionChanged {
        address: Host,
        previous: ServerDescription,
        new: ServerDescription,
    },
    TopologyDescriptionChanged {
        previous: TopologyDescription,
        new: TopologyDescription,
    },
    ServerHeartbeatStarted { address: Host },
    ServerHeartbeatSucceeded {
        address: Host,
        duration: Duration,
        reply: Document,
    },
    ServerHeartbeatFailed {
        address: Host,
        duration: Duration,
        failure: String,
    },
}

impl Display for TopologyEvent {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
        match *self {
            TopologyEvent::ServerOpening { ref address } => {
                fmt.write_fmt(format_args!("SERVER {} OPENING", address))
            }
            TopologyEvent::ServerClosed { ref address } => {
                fmt.write_fmt(format_args!("SERVER {} CLOSED", address))
            }
            TopologyEvent::ServerDescriptionChanged {
                ref address,
                ref previous,
                ref new,
            } => fmt.write_fmt(format_args!(
                "SERVER {} CHANGED: {} -> {}",
                address, previous.server_type, new.server_type
            )),
            TopologyEvent::TopologyDescriptionChanged { ref previous, ref new } => fmt.write_fmt(
                format_args!("TOPOLOGY CHANGED: {} -> {}", previous.topology_type, new),
            ),
            TopologyEvent::ServerHeartbeatStarted { ref address } => {
                fmt.write_fmt(format_args!("HEARTBEAT {} STARTED", address))
            }
            TopologyEvent::ServerHeartbeatSucceeded {
                ref address,
                duration,
                ref reply,
            } => fmt.write_fmt(format_args!(
                "HEARTBEAT {} SUCCEEDED: {:?} ({} ms)",
                address,
                reply,
                duration.as_millis()
            )),
            TopologyEvent::ServerHeartbeatFailed {
                ref address,
                duration,
                ref failure,
            } => fmt.write_fmt(format_args!(
                "HEARTBEAT {} FAILURE: {} ({} ms)",
                address,
                failure,
                duration.as_millis()
            )),
        }
    }
}
