use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier for a conversation thread. The engine never inspects
/// its contents beyond equality; the server routes on it as a URL path
/// segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

/// A persistent thread of messages between the user and a counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub created_at: DateTime<Utc>,
}

/// Who authored a message, as seen from this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Sender {
    User,
    Counterpart,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Counterpart => "counterpart",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Sender::User),
            "counterpart" => Some(Sender::Counterpart),
            _ => None,
        }
    }
}

/// Delivery lifecycle of a message. Messages are append-only; the status
/// is the only field that ever changes, and only forward:
/// `Pending -> Sent -> Delivered`, or `-> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// A single timeline entry, durably recorded before (or concurrently
/// with) being rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender: Sender,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_parse_rejects_unknown() {
        assert_eq!(Sender::parse("user"), Some(Sender::User));
        assert_eq!(Sender::parse("counterpart"), Some(Sender::Counterpart));
        assert_eq!(Sender::parse("therapist"), None);
        assert_eq!(Sender::parse(""), None);
    }

    #[test]
    fn delivery_status_round_trips_through_str() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("queued"), None);
    }

    #[test]
    fn conversation_id_is_transparent() {
        let id = ConversationId::new("abcde");
        assert_eq!(id.as_str(), "abcde");
        assert_eq!(id.to_string(), "abcde");
        assert_eq!(String::from(id), "abcde");
    }
}
