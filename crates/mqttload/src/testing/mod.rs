//! In-process broker double for tests and demos.
//!
//! [`LoopbackBroker`] speaks the decoded packet set over tokio channels and
//! can be told to misbehave through [`LoopbackFaults`]. It is a fixture, not
//! a broker: it keeps no retained messages, queues nothing for offline
//! clients and never retransmits.

mod broker;
mod connector;

pub use broker::{LoopbackBroker, LoopbackFaults};
pub use connector::{LoopbackConnector, LoopbackTransport};
