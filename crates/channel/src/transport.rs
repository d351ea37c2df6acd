use std::future::Future;

use futures::{SinkExt, StreamExt};
use haven_core::model::ConversationId;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::debug;

use crate::error::ChannelError;
use crate::manager::ChannelSettings;

/// Abstraction over the wire so the connection manager can be driven by
/// a scripted double in tests. `recv` must be cancel-safe: dropping its
/// future mid-flight must not lose a frame.
pub trait Transport: Sized + Send + 'static {
    fn connect(
        settings: &ChannelSettings,
        conversation_id: &ConversationId,
    ) -> impl Future<Output = Result<Self, ChannelError>> + Send;

    fn send(&mut self, payload: &str) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Next text payload from the peer. Returns [`ChannelError::Closed`]
    /// when the peer hangs up cleanly.
    fn recv(&mut self) -> impl Future<Output = Result<String, ChannelError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// The server routes on the conversation id as a trailing path segment.
pub fn websocket_url(base: &str, conversation_id: &ConversationId) -> String {
    format!("{}/{}/", base.trim_end_matches('/'), conversation_id)
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport for WebSocketTransport {
    async fn connect(
        settings: &ChannelSettings,
        conversation_id: &ConversationId,
    ) -> Result<Self, ChannelError> {
        let url = websocket_url(&settings.server_url, conversation_id);
        let mut request =
            url.clone()
                .into_client_request()
                .map_err(|e| ChannelError::InvalidUrl {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

        if let Some(token) = &settings.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ChannelError::ConnectFailed(format!("invalid auth token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;

        debug!(conversation_id = %conversation_id, url = %url, "websocket connected");
        Ok(Self { stream })
    }

    async fn send(&mut self, payload: &str) -> Result<(), ChannelError> {
        self.stream
            .send(tungstenite::Message::Text(payload.into()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<String, ChannelError> {
        loop {
            match self.stream.next().await {
                None => return Err(ChannelError::Closed),
                Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
                Some(Ok(message)) => match message {
                    tungstenite::Message::Text(text) => return Ok(text.to_string()),
                    tungstenite::Message::Binary(bytes) => {
                        return String::from_utf8(bytes.to_vec())
                            .map_err(|e| ChannelError::MalformedFrame(e.to_string()));
                    }
                    tungstenite::Message::Close(_) => return Err(ChannelError::Closed),
                    // Control frames are handled by the protocol layer.
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_) => continue,
                },
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
