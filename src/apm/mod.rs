//! Topology Monitoring
//!
//! The APM module exposes the discovery and monitoring machinery to the outside world. Every
//! server added to or removed from the topology, every server description change, every topology
//! description change, and every heartbeat triggers the hooks registered on the client's listener.
//! Hooks run on the thread that produced the event, never while the topology lock is held.
mod event;
mod listener;

pub use self::event::TopologyEvent;
pub use self::listener::{EventHook, Listener};
