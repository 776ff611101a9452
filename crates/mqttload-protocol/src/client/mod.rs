pub mod actions;
pub mod protocol;
pub mod state;

pub use actions::{AckType, ProtocolAction};
pub use protocol::{SessionProtocol, SessionProtocolConfig};
pub use state::{ConnectionState, SessionStats};
