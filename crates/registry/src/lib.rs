//! Conversation lifecycle. Ids are five lowercase ASCII letters, chosen
//! at random; the store's primary key is the collision detector, and a
//! duplicate draw simply retries with a fresh id.

use std::sync::Arc;

use chrono::Utc;
use haven_core::event::{Event, EventBus, EventPayload, EventSource, Topic};
use haven_core::model::{Conversation, ConversationId};
use haven_storage::{ChatStore, Database, StorageError};
use rand::Rng;
use tracing::{debug, info, warn};

const ID_LENGTH: usize = 5;
const MAX_ID_ATTEMPTS: u32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("could not allocate a unique conversation id after {attempts} attempts")]
    IdSpaceExhausted { attempts: u32 },
}

pub struct ConversationRegistry<D: Database> {
    store: ChatStore<D>,
    event_bus: Arc<dyn EventBus>,
}

impl<D: Database> ConversationRegistry<D> {
    pub fn new(store: ChatStore<D>, event_bus: Arc<dyn EventBus>) -> Self {
        Self { store, event_bus }
    }

    /// Create a conversation under a freshly drawn id.
    pub async fn new_conversation(&self) -> Result<Conversation, RegistryError> {
        self.new_conversation_with(&mut rand::rng()).await
    }

    /// As [`new_conversation`](Self::new_conversation), drawing ids from
    /// the given generator.
    pub async fn new_conversation_with(
        &self,
        rng: &mut impl Rng,
    ) -> Result<Conversation, RegistryError> {
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let conversation = Conversation {
                id: generate_id(rng),
                created_at: Utc::now(),
            };

            match self.store.create_conversation(&conversation).await {
                Ok(()) => {
                    info!(conversation_id = %conversation.id, "conversation created");
                    self.emit(
                        "session.conversation.created",
                        EventPayload::ConversationCreated {
                            conversation_id: conversation.id.clone(),
                        },
                    );
                    return Ok(conversation);
                }
                Err(StorageError::DuplicateKey(_)) => {
                    debug!(conversation_id = %conversation.id, attempt, "id collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RegistryError::IdSpaceExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// All conversations, newest first.
    pub async fn list(&self) -> Result<Vec<Conversation>, RegistryError> {
        Ok(self.store.list_conversations().await?)
    }

    /// Remove a conversation and everything in it. Callers close any
    /// open channel for the id before removing it; a live session is
    /// not this crate's to manage. Removing an unknown id is a no-op
    /// and publishes nothing.
    pub async fn remove(&self, id: &ConversationId) -> Result<(), RegistryError> {
        if !self.store.conversation_exists(id).await? {
            debug!(conversation_id = %id, "remove of unknown conversation ignored");
            return Ok(());
        }
        self.store.delete_conversation(id).await?;
        info!(conversation_id = %id, "conversation removed");
        self.emit(
            "session.conversation.removed",
            EventPayload::ConversationRemoved {
                conversation_id: id.clone(),
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
            warn!(error = %e, "failed to publish registry event");
        }
    }
}

fn generate_id(rng: &mut impl Rng) -> ConversationId {
    let id: String = (0..ID_LENGTH)
        .map(|_| rng.random_range(b'a'..=b'z') as char)
        .collect();
    ConversationId::new(id)
}
