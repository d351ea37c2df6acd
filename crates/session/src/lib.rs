//! Keeps one conversation's timeline reconciled between the durable
//! store and the live channel. Local submissions are persisted before
//! they are transmitted; inbound frames are persisted before the
//! timeline grows. The store is always a superset of the timeline.

use std::sync::Arc;

use chrono::Utc;
use haven_channel::{ChannelError, InboundFrame, OutboundFrame, SessionHandle};
use haven_core::event::{Event, EventBus, EventPayload, EventSource, Topic};
use haven_core::model::{ConversationId, DeliveryStatus, Message, Sender};
use haven_storage::{ChatStore, Database, StorageError};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("message text is empty")]
    EmptyMessage,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub struct SessionPipeline<D: Database> {
    conversation_id: ConversationId,
    store: ChatStore<D>,
    event_bus: Arc<dyn EventBus>,
    handle: SessionHandle,
    local_user_id: String,
    timeline: Vec<Message>,
}

impl<D: Database> SessionPipeline<D> {
    pub fn new(
        store: ChatStore<D>,
        event_bus: Arc<dyn EventBus>,
        handle: SessionHandle,
        local_user_id: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: handle.conversation_id().clone(),
            store,
            event_bus,
            handle,
            local_user_id: local_user_id.into(),
            timeline: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Current in-memory timeline. Always a subset of what the store
    /// holds for this conversation.
    pub fn timeline(&self) -> &[Message] {
        &self.timeline
    }

    /// Replace the timeline with the full persisted history, in
    /// chronological order. Called once per open, before live frames
    /// are applied.
    pub async fn hydrate(&mut self) -> Result<&[Message], SessionError> {
        let messages = self.store.list_messages(&self.conversation_id).await?;
        let count = messages.len();
        self.timeline = messages;

        debug!(conversation_id = %self.conversation_id, count, "timeline hydrated");
        self.emit(
            "session.timeline.hydrated",
            EventPayload::TimelineHydrated {
                conversation_id: self.conversation_id.clone(),
                count,
            },
        );
        Ok(&self.timeline)
    }

    /// Submit a local message. Rejected outright when the text is blank
    /// or the channel is not open; otherwise the message is persisted
    /// (status `Pending`) before transmission is attempted, so it
    /// survives whatever happens on the wire.
    pub async fn submit(&mut self, text: &str) -> Result<Message, SessionError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if !self.handle.is_open() {
            return Err(ChannelError::NotConnected(self.conversation_id.clone()).into());
        }

        let mut message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: self.conversation_id.clone(),
            sender: Sender::User,
            text: trimmed.to_string(),
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Pending,
        };

        self.store.append_message(&message).await?;
        self.timeline.push(message.clone());
        self.emit(
            "session.message.appended",
            EventPayload::MessageAppended {
                message: message.clone(),
            },
        );

        let transmitted = OutboundFrame::message(&self.local_user_id, trimmed)
            .encode()
            .and_then(|frame| self.handle.send(frame));
        let status = match transmitted {
            Ok(()) => DeliveryStatus::Sent,
            Err(e) => {
                warn!(conversation_id = %self.conversation_id, error = %e, "transmit failed");
                DeliveryStatus::Failed
            }
        };

        let message_id = message.id.clone();
        self.set_status(&message_id, status).await?;
        message.delivery_status = status;
        Ok(message)
    }

    /// Apply one raw frame from the server. Malformed frames are logged
    /// and dropped; they never take the pipeline down.
    pub async fn on_incoming(&mut self, raw: &str) -> Result<(), SessionError> {
        let frame = match InboundFrame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conversation_id = %self.conversation_id, error = %e, "dropping malformed frame");
                return Ok(());
            }
        };

        match frame {
            InboundFrame::Message { sender, content } => {
                debug!(conversation_id = %self.conversation_id, sender = %sender, "inbound message");
                let message = Message {
                    id: Uuid::new_v4().to_string(),
                    conversation_id: self.conversation_id.clone(),
                    sender: Sender::Counterpart,
                    text: content,
                    created_at: Utc::now(),
                    delivery_status: DeliveryStatus::Delivered,
                };
                self.store.append_message(&message).await?;
                self.timeline.push(message.clone());
                self.emit(
                    "session.message.appended",
                    EventPayload::MessageAppended { message },
                );
            }
            // Server-side notices are surfaced, never persisted.
            InboundFrame::Error { content } | InboundFrame::System { content } => {
                self.emit(
                    "session.notice.raised",
                    EventPayload::NoticeRaised {
                        conversation_id: self.conversation_id.clone(),
                        text: content,
                    },
                );
            }
        }

        Ok(())
    }

    /// Ask the server to wipe this conversation's history, and clear
    /// the local mirror to match. Requires an open channel.
    pub async fn request_clear_history(&mut self) -> Result<(), SessionError> {
        if !self.handle.is_open() {
            return Err(ChannelError::NotConnected(self.conversation_id.clone()).into());
        }

        let frame = OutboundFrame::ClearHistory.encode()?;
        self.handle.send(frame)?;

        self.store.clear_messages(&self.conversation_id).await?;
        self.timeline.clear();
        self.emit(
            "session.timeline.hydrated",
            EventPayload::TimelineHydrated {
                conversation_id: self.conversation_id.clone(),
                count: 0,
            },
        );
        Ok(())
    }

    /// Reactive half of the pipeline: apply inbound frames for this
    /// conversation until its channel is closed. Frames for other
    /// conversations on the bus are ignored.
    pub async fn run(mut self) -> Self {
        let mut subscription = match self.event_bus.subscribe("channel.**") {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(conversation_id = %self.conversation_id, error = %e, "failed to subscribe");
                return self;
            }
        };
        let closed = self.handle.closed_token();

        loop {
            // Biased: a close that races a ready frame always wins, so
            // nothing is ever applied to a closed timeline.
            let received = tokio::select! {
                biased;
                _ = closed.cancelled() => break,
                received = subscription.recv() => received,
            };

            match received {
                Ok(event) => {
                    if closed.is_cancelled() {
                        break;
                    }
                    let EventPayload::FrameReceived {
                        conversation_id,
                        raw,
                    } = event.payload
                    else {
                        continue;
                    };
                    if conversation_id != self.conversation_id {
                        continue;
                    }
                    if let Err(e) = self.on_incoming(&raw).await {
                        warn!(conversation_id = %self.conversation_id, error = %e, "failed to apply inbound frame");
                        self.emit(
                            "system.error.occurred",
                            EventPayload::ErrorOccurred {
                                component: "session".to_string(),
                                message: e.to_string(),
                                recoverable: true,
                            },
                        );
                    }
                }
                Err(haven_core::error::EventBusError::Lagged(skipped)) => {
                    warn!(conversation_id = %self.conversation_id, skipped, "event subscription lagged");
                }
                Err(_) => break,
            }
        }

        self
    }

    async fn set_status(
        &mut self,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<(), SessionError> {
        self.store.update_delivery_status(message_id, status).await?;
        if let Some(entry) = self.timeline.iter_mut().find(|m| m.id == message_id) {
            entry.delivery_status = status;
        }
        self.emit(
            "session.message.status",
            EventPayload::MessageStatusChanged {
                conversation_id: self.conversation_id.clone(),
                message_id: message_id.to_string(),
                status,
            },
        );
        Ok(())
    }

    fn emit(&self, topic: &str, payload: EventPayload) {
        let topic = match Topic::new(topic) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(error = %e, "invalid event topic");
                return;
            }
        };
        if let Err(e) = self
            .event_bus
            .publish(Event::new(topic, EventSource::Session, payload))
        {
            warn!(error = %e, "failed to publish session event");
        }
    }
}
