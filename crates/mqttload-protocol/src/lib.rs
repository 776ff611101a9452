//! Sans-I/O delivery-guarantee engine for MQTT-style publish/subscribe.
//!
//! Nothing in this crate touches a socket, a runtime or a timer. Inputs are
//! packets and instants, outputs are [`client::ProtocolAction`]s for a runtime
//! to execute. Time is read through the [`time::Clock`] trait so retry and
//! dedup expiry can be driven deterministically in tests.

#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod dedup;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod keepalive;
pub mod packet;
pub mod packet_id;
pub(crate) mod prelude;
pub mod qos2;
pub mod reason_code;
pub mod time;
pub mod topic;
pub mod types;

pub use client::{
    AckType, ConnectionState, ProtocolAction, SessionProtocol, SessionProtocolConfig, SessionStats,
};
pub use dedup::{DedupWindow, DEFAULT_DEDUP_CAPACITY};
pub use delivery::{DeliveryPhase, DeliveryState, DeliveryTable};
pub use envelope::{Envelope, EnvelopeLimits, DEFAULT_MAX_PAYLOAD_SIZE};
pub use error::{HarnessError, Result};
pub use packet::{
    grant_reason, granted_qos, AckPacket, ConnAckPacket, ConnectPacket, Packet, SubAckPacket,
    SubscribePacket, UnsubAckPacket, UnsubscribePacket,
};
pub use reason_code::ReasonCode;
pub use time::{Clock, ManualClock, SystemClock};
pub use topic::{topic_matches_filter, validate_topic_filter, validate_topic_name};
pub use types::{Credentials, PublishOutcome, QoS};
