use haven_core::model::ConversationId;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The peer closed the channel cleanly.
    #[error("channel closed by peer")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("no open channel for conversation {0}")]
    NotConnected(ConversationId),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}
