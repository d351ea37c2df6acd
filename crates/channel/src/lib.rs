pub mod error;
pub mod frame;
pub mod manager;
pub mod transport;

pub use error::ChannelError;
pub use frame::{InboundFrame, OutboundFrame};
pub use manager::{ChannelManager, ChannelSettings, ConnectionState, SessionHandle};
pub use transport::{Transport, WebSocketTransport};
