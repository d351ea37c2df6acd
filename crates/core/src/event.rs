use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{ConversationId, DeliveryStatus, Message};

/// Hierarchical topic name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    /// Create a new topic, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, crate::error::EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::error::EventBusError::InvalidTopic(name))
        }
    }

    /// Check if a topic name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Must be lowercase and only contain a-z, 0-9, and dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        let parts: Vec<&str> = name.split('.').collect();
        if parts.is_empty() {
            return false;
        }

        // Check domain
        match parts[0] {
            "system" | "channel" | "session" | "ui" => {}
            _ => return false,
        }

        true
    }

    /// Get the domain of the topic.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full topic name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical topic name (e.g., "channel.frame.received")
    pub topic: Topic,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given topic and payload.
    pub fn new(topic: Topic, source: EventSource, payload: EventPayload) -> Self {
        Self {
            topic,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core system component
    System(String),
    /// Connection manager / transport layer
    Channel,
    /// Reconciliation pipeline or registry
    Session,
    /// User interface
    Ui,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ────────────────────────────────────────────
    StartupComplete,
    ShutdownRequested {
        reason: String,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Channel events ───────────────────────────────────────────
    ConnectionEstablished {
        conversation_id: ConversationId,
    },
    ConnectionLost {
        conversation_id: ConversationId,
        reason: String,
        will_retry: bool,
    },
    ConnectionReconnecting {
        conversation_id: ConversationId,
    },
    FrameReceived {
        conversation_id: ConversationId,
        raw: String,
    },

    // ── Session events ───────────────────────────────────────────
    TimelineHydrated {
        conversation_id: ConversationId,
        count: usize,
    },
    MessageAppended {
        message: Message,
    },
    MessageStatusChanged {
        conversation_id: ConversationId,
        message_id: String,
        status: DeliveryStatus,
    },
    NoticeRaised {
        conversation_id: ConversationId,
        text: String,
    },
    ConversationCreated {
        conversation_id: ConversationId,
    },
    ConversationRemoved {
        conversation_id: ConversationId,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError>;
    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError>;
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    channel_sender: broadcast::Sender<Event>,
    session_sender: broadcast::Sender<Event>,
    ui_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

    pub fn new(topic_capacity: usize) -> Self {
        let capacity = topic_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (channel_sender, _) = broadcast::channel(capacity);
        let (session_sender, _) = broadcast::channel(capacity);
        let (ui_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            channel_sender,
            session_sender,
            ui_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "channel" => Some(&self.channel_sender),
            "session" => Some(&self.session_sender),
            "ui" => Some(&self.ui_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, crate::error::EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            ));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                channel: Some(self.channel_sender.subscribe()),
                session: Some(self.session_sender.subscribe()),
                ui: Some(self.ui_sender.subscribe()),
            });
        }

        match first_segment {
            "system" => Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                channel: None,
                session: None,
                ui: None,
            }),
            "channel" => Ok(DomainReceivers {
                system: None,
                channel: Some(self.channel_sender.subscribe()),
                session: None,
                ui: None,
            }),
            "session" => Ok(DomainReceivers {
                system: None,
                channel: None,
                session: Some(self.session_sender.subscribe()),
                ui: None,
            }),
            "ui" => Ok(DomainReceivers {
                system: None,
                channel: None,
                session: None,
                ui: Some(self.ui_sender.subscribe()),
            }),
            _ => Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            )),
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TOPIC_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError> {
        let sender = self
            .sender_for_domain(event.topic.domain())
            .ok_or_else(|| crate::error::EventBusError::InvalidTopic(event.topic.to_string()))?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| crate::error::EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    channel: Option<broadcast::Receiver<Event>>,
    session: Option<broadcast::Receiver<Event>>,
    ui: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, crate::error::EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let channel_receiver = self.receivers.channel.as_mut();
            let session_receiver = self.receivers.session.as_mut();
            let ui_receiver = self.receivers.ui.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(channel_receiver) => result,
                result = recv_from_domain(session_receiver) => result,
                result = recv_from_domain(ui_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.topic.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(crate::error::EventBusError::TopicClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(crate::error::EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains('*')
        || segment.contains('?')
        || segment.contains('[')
        || segment.contains(']')
        || segment.contains('{')
        || segment.contains('}')
        || segment.contains('!')
}
