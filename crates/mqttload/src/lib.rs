//! # mqttload
//!
//! Tokio runtime for the `mqttload-protocol` delivery engine, plus a
//! multi-client stress harness that measures what a broker actually delivers.
//!
//! ## Architecture
//!
//! - One background task per [`Session`] owns the transport and the
//!   sans-I/O [`SessionProtocol`](mqttload_protocol::SessionProtocol). The
//!   [`Session`] handle talks to it over a command channel.
//! - Acknowledgments are matched to waiting callers through per-packet-id
//!   oneshot channels; callers hold a [`DeliveryHandle`].
//! - Retained messages live in an injected [`RetainedStore`] shared by every
//!   session of a run.
//! - [`StressHarness`] spawns publisher and subscriber sessions, drives load
//!   and folds the results into a [`Report`].
//!
//! The broker is reached through the [`Connector`]/[`Transport`] seam, which
//! exchanges already-decoded packets. With the `test-util` feature an
//! in-process [`testing::LoopbackBroker`] implements that seam.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mqttload::testing::{LoopbackBroker, LoopbackConnector};
//! use mqttload::{HarnessConfig, QoS, StressHarness};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> mqttload::Result<()> {
//!     let broker = LoopbackBroker::new();
//!     let config = HarnessConfig::builder()
//!         .publishers(5)
//!         .subscribers(1)
//!         .qos(QoS::AtLeastOnce)
//!         .message_rate(100)
//!         .duration(Duration::from_secs(10))
//!         .build()?;
//!
//!     let report = StressHarness::new(LoopbackConnector::new(broker), config)
//!         .run()
//!         .await?;
//!     assert!(report.is_lossless());
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]

pub mod cancel;
pub mod clock;
pub mod config;
pub mod harness;
pub mod report;
pub mod retained;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use cancel::{CancelSource, CancelToken};
pub use clock::TokioClock;
pub use config::{HarnessConfig, HarnessConfigBuilder, SessionConfig};
pub use harness::StressHarness;
pub use report::{LatencySummary, QosBreakdown, Report, RunSettings};
pub use retained::{RetainedEntry, RetainedStore};
pub use session::{DeliveryHandle, Session, Subscription};
pub use transport::{Connector, Transport};

pub use mqttload_protocol::{
    topic_matches_filter, Credentials, Envelope, EnvelopeLimits, HarnessError, Packet,
    PublishOutcome, QoS, ReasonCode, Result, SessionStats,
};
