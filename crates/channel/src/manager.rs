//! One channel per conversation, driven by a background task that owns
//! the transport and keeps reconnecting until told to stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use haven_core::config::Config;
use haven_core::event::{Event, EventBus, EventPayload, EventSource, Topic};
use haven_core::model::ConversationId;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::frame::OutboundFrame;
use crate::transport::Transport;

/// Runtime settings for every channel this manager opens.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub server_url: String,
    pub auth_token: Option<String>,
    /// First payload transmitted on every (re)connect.
    pub greeting: String,
    pub local_user_id: String,
    pub reconnect_delay: Duration,
}

impl ChannelSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_url: config.server.url.clone(),
            auth_token: config.server.auth_token.clone(),
            greeting: config.channel.greeting.clone(),
            local_user_id: config.channel.local_user_id.clone(),
            reconnect_delay: Duration::from_secs(config.channel.reconnect_delay_secs),
        }
    }
}

/// Lifecycle of a single channel. Every channel starts at `Idle` and
/// ends at `Closed`; a lost connection goes back through `Connecting`
/// after the retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Cheap, cloneable handle to one conversation's channel. Dropping the
/// handle does not close the channel; use [`ChannelManager::close`].
#[derive(Clone)]
pub struct SessionHandle {
    conversation_id: ConversationId,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch receiver for state transitions, for callers that need to
    /// await a particular state.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Token cancelled when the channel is deliberately closed. Lets
    /// consumers tie their own loops to the channel lifetime.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue a payload for transmission. Fails unless the channel is
    /// currently open; nothing is buffered across the gap.
    pub fn send(&self, payload: String) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotConnected(self.conversation_id.clone()));
        }
        self.outbound
            .send(payload)
            .map_err(|_| ChannelError::NotConnected(self.conversation_id.clone()))
    }
}

/// Owns the channels. One background driver task per open conversation;
/// opening a conversation that already has a channel replaces it.
pub struct ChannelManager<T: Transport> {
    settings: ChannelSettings,
    event_bus: Arc<dyn EventBus>,
    sessions: Mutex<HashMap<ConversationId, SessionHandle>>,
    _transport: std::marker::PhantomData<fn() -> T>,
}

impl<T: Transport> ChannelManager<T> {
    pub fn new(settings: ChannelSettings, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            settings,
            event_bus,
            sessions: Mutex::new(HashMap::new()),
            _transport: std::marker::PhantomData,
        }
    }

    /// Open a channel for `conversation_id` and return its handle. Any
    /// existing channel for the same conversation is closed first.
    pub fn open(&self, conversation_id: &ConversationId) -> SessionHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = SessionHandle {
            conversation_id: conversation_id.clone(),
            state: state_rx,
            outbound: outbound_tx,
            cancel: cancel.clone(),
        };

        let previous = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.insert(conversation_id.clone(), handle.clone())
        };
        if let Some(previous) = previous {
            debug!(conversation_id = %conversation_id, "replacing existing channel");
            previous.cancel.cancel();
        }

        info!(conversation_id = %conversation_id, "opening channel");
        tokio::spawn(drive::<T>(
            self.settings.clone(),
            conversation_id.clone(),
            Arc::clone(&self.event_bus),
            state_tx,
            outbound_rx,
            cancel,
        ));

        handle
    }

    /// Handle for an already-open conversation, if any.
    pub fn handle(&self, conversation_id: &ConversationId) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(conversation_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }

    /// Close the channel for `conversation_id`. Idempotent; closing a
    /// conversation with no channel is a no-op.
    pub fn close(&self, conversation_id: &ConversationId) {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(conversation_id)
        };
        if let Some(handle) = removed {
            info!(conversation_id = %conversation_id, "closing channel");
            handle.cancel.cancel();
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drained {
            handle.cancel.cancel();
        }
    }
}

fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let _ = state.send(next);
}

fn emit(event_bus: &Arc<dyn EventBus>, topic: &str, payload: EventPayload) {
    let topic = match Topic::new(topic) {
        Ok(topic) => topic,
        Err(e) => {
            warn!(error = %e, "invalid event topic");
            return;
        }
    };
    if let Err(e) = event_bus.publish(Event::new(topic, EventSource::Channel, payload)) {
        warn!(error = %e, "failed to publish channel event");
    }
}

enum OpenOutcome {
    Cancelled,
    Lost(String),
}

async fn drive<T: Transport>(
    settings: ChannelSettings,
    conversation_id: ConversationId,
    event_bus: Arc<dyn EventBus>,
    state: watch::Sender<ConnectionState>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        set_state(&state, ConnectionState::Connecting);

        // Biased: cancellation wins every race, so a closed session can
        // never act on a connect, frame, or timer that was ready at the
        // same time.
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = T::connect(&settings, &conversation_id) => result,
        };

        match connected {
            Ok(mut transport) => {
                let outcome =
                    run_open(&settings, &conversation_id, &event_bus, &state, &mut outbound, &cancel, &mut transport)
                        .await;
                match outcome {
                    OpenOutcome::Cancelled => {
                        set_state(&state, ConnectionState::Closing);
                        transport.close().await;
                        set_state(&state, ConnectionState::Closed);
                        return;
                    }
                    OpenOutcome::Lost(reason) => {
                        warn!(conversation_id = %conversation_id, reason = %reason, "connection lost");
                        set_state(&state, ConnectionState::Closed);
                        emit(
                            &event_bus,
                            "channel.connection.lost",
                            EventPayload::ConnectionLost {
                                conversation_id: conversation_id.clone(),
                                reason,
                                will_retry: true,
                            },
                        );
                    }
                }
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "connect failed");
                set_state(&state, ConnectionState::Closed);
                emit(
                    &event_bus,
                    "channel.connection.lost",
                    EventPayload::ConnectionLost {
                        conversation_id: conversation_id.clone(),
                        reason: e.to_string(),
                        will_retry: true,
                    },
                );
            }
        }

        // Fixed delay, forever; there is no retry cap or backoff.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.reconnect_delay) => {}
        }

        debug!(conversation_id = %conversation_id, "reconnecting");
        emit(
            &event_bus,
            "channel.connection.reconnecting",
            EventPayload::ConnectionReconnecting {
                conversation_id: conversation_id.clone(),
            },
        );
    }

    set_state(&state, ConnectionState::Closing);
    set_state(&state, ConnectionState::Closed);
}

async fn run_open<T: Transport>(
    settings: &ChannelSettings,
    conversation_id: &ConversationId,
    event_bus: &Arc<dyn EventBus>,
    state: &watch::Sender<ConnectionState>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
    transport: &mut T,
) -> OpenOutcome {
    // The greeting goes out before the channel is reported open, so the
    // server always sees it as the first payload.
    let greeting = OutboundFrame::message(&settings.local_user_id, &settings.greeting);
    let encoded = match greeting.encode() {
        Ok(encoded) => encoded,
        Err(e) => return OpenOutcome::Lost(e.to_string()),
    };
    if let Err(e) = transport.send(&encoded).await {
        return OpenOutcome::Lost(e.to_string());
    }

    set_state(state, ConnectionState::Open);
    info!(conversation_id = %conversation_id, "channel open");
    emit(
        event_bus,
        "channel.connection.established",
        EventPayload::ConnectionEstablished {
            conversation_id: conversation_id.clone(),
        },
    );

    enum Step {
        Cancelled,
        Outbound(Option<String>),
        Inbound(Result<String, ChannelError>),
    }

    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            payload = outbound.recv() => Step::Outbound(payload),
            frame = transport.recv() => Step::Inbound(frame),
        };

        match step {
            Step::Cancelled | Step::Outbound(None) => return OpenOutcome::Cancelled,
            Step::Outbound(Some(payload)) => {
                if let Err(e) = transport.send(&payload).await {
                    return OpenOutcome::Lost(e.to_string());
                }
            }
            Step::Inbound(Ok(raw)) => {
                if cancel.is_cancelled() {
                    return OpenOutcome::Cancelled;
                }
                emit(
                    event_bus,
                    "channel.frame.received",
                    EventPayload::FrameReceived {
                        conversation_id: conversation_id.clone(),
                        raw,
                    },
                );
            }
            Step::Inbound(Err(e)) => return OpenOutcome::Lost(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::event::BroadcastEventBus;
    use std::collections::VecDeque;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum RecvStep {
        Frame(String),
        Fail(String),
    }

    struct ConnectScript(Result<Vec<RecvStep>, String>);

    static SCRIPT: Mutex<VecDeque<ConnectScript>> = Mutex::new(VecDeque::new());
    static SENT: Mutex<Vec<String>> = Mutex::new(Vec::new());
    static CONNECTS: AtomicUsize = AtomicUsize::new(0);

    // Scripted transports share global state; tests must not interleave.
    fn test_lock() -> &'static tokio::sync::Mutex<()> {
        static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
    }

    fn reset(scripts: Vec<ConnectScript>) {
        *SCRIPT.lock().unwrap() = scripts.into_iter().collect();
        SENT.lock().unwrap().clear();
        CONNECTS.store(0, Ordering::SeqCst);
    }

    fn sent() -> Vec<String> {
        SENT.lock().unwrap().clone()
    }

    struct ScriptedTransport {
        inbound: VecDeque<RecvStep>,
    }

    impl Transport for ScriptedTransport {
        async fn connect(
            _settings: &ChannelSettings,
            _conversation_id: &ConversationId,
        ) -> Result<Self, ChannelError> {
            CONNECTS.fetch_add(1, Ordering::SeqCst);
            match SCRIPT.lock().unwrap().pop_front() {
                Some(ConnectScript(Ok(steps))) => Ok(Self {
                    inbound: steps.into_iter().collect(),
                }),
                Some(ConnectScript(Err(reason))) => Err(ChannelError::ConnectFailed(reason)),
                // Out of script: connect and stay quiet.
                None => Ok(Self {
                    inbound: VecDeque::new(),
                }),
            }
        }

        async fn send(&mut self, payload: &str) -> Result<(), ChannelError> {
            SENT.lock().unwrap().push(payload.to_string());
            Ok(())
        }

        async fn recv(&mut self) -> Result<String, ChannelError> {
            match self.inbound.pop_front() {
                Some(RecvStep::Frame(raw)) => Ok(raw),
                Some(RecvStep::Fail(reason)) => Err(ChannelError::Transport(reason)),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    fn settings() -> ChannelSettings {
        ChannelSettings {
            server_url: "ws://localhost:8000/chat".to_string(),
            auth_token: None,
            greeting: "Hello".to_string(),
            local_user_id: "default".to_string(),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    fn manager() -> (Arc<BroadcastEventBus>, ChannelManager<ScriptedTransport>) {
        let bus = Arc::new(BroadcastEventBus::default());
        let manager = ChannelManager::new(settings(), bus.clone() as Arc<dyn EventBus>);
        (bus, manager)
    }

    async fn wait_for(
        watch: &mut watch::Receiver<ConnectionState>,
        target: ConnectionState,
    ) -> ConnectionState {
        *watch
            .wait_for(|s| *s == target)
            .await
            .expect("driver dropped the state sender")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn greeting_is_first_payload_on_open() {
        let _guard = test_lock().lock().await;
        reset(vec![ConnectScript(Ok(vec![]))]);

        let (_bus, manager) = manager();
        let handle = manager.open(&ConversationId::new("abcde"));
        let mut states = handle.state_watch();
        wait_for(&mut states, ConnectionState::Open).await;

        let sent = sent();
        assert_eq!(sent.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["sender"], "default");
        assert_eq!(value["content"], "Hello");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn reconnects_after_fixed_delay() {
        let _guard = test_lock().lock().await;
        reset(vec![
            ConnectScript(Ok(vec![RecvStep::Fail("broken pipe".to_string())])),
            ConnectScript(Ok(vec![])),
        ]);

        let (_bus, manager) = manager();
        let handle = manager.open(&ConversationId::new("abcde"));
        let mut states = handle.state_watch();

        // The scripted failure can race past Open, so wait for the
        // settled post-failure state.
        wait_for(&mut states, ConnectionState::Closed).await;
        assert_eq!(CONNECTS.load(Ordering::SeqCst), 1);

        // Not yet: the delay is a fixed five seconds.
        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(CONNECTS.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        wait_for(&mut states, ConnectionState::Open).await;
        assert_eq!(CONNECTS.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn close_during_delay_stops_the_retry_loop() {
        let _guard = test_lock().lock().await;
        reset(vec![ConnectScript(Ok(vec![RecvStep::Fail(
            "broken pipe".to_string(),
        )]))]);

        let (_bus, manager) = manager();
        let id = ConversationId::new("abcde");
        let handle = manager.open(&id);
        let mut states = handle.state_watch();

        wait_for(&mut states, ConnectionState::Closed).await;

        manager.close(&id);
        settle().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(CONNECTS.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(manager.handle(&id).is_none());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn send_fails_unless_open() {
        let _guard = test_lock().lock().await;
        reset(vec![ConnectScript(Err("refused".to_string()))]);

        let (_bus, manager) = manager();
        let handle = manager.open(&ConversationId::new("abcde"));
        settle().await;

        let err = handle.send("payload".to_string()).unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(_)));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn queued_payloads_reach_the_transport() {
        let _guard = test_lock().lock().await;
        reset(vec![ConnectScript(Ok(vec![]))]);

        let (_bus, manager) = manager();
        let handle = manager.open(&ConversationId::new("abcde"));
        let mut states = handle.state_watch();
        wait_for(&mut states, ConnectionState::Open).await;

        handle.send(r#"{"type":"message","sender":"default","content":"hi"}"#.to_string())
            .unwrap();
        settle().await;

        let sent = sent();
        assert_eq!(sent.len(), 2, "greeting plus one payload: {sent:?}");
        assert!(sent[1].contains(r#""content":"hi""#));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn inbound_frames_are_published_to_the_bus() {
        let _guard = test_lock().lock().await;
        reset(vec![ConnectScript(Ok(vec![RecvStep::Frame(
            r#"{"type":"message","sender":"counselor","content":"hi"}"#.to_string(),
        )]))]);

        let (bus, manager) = manager();
        let mut sub = bus.subscribe("channel.frame.received").unwrap();
        let _handle = manager.open(&ConversationId::new("abcde"));

        let event = sub.recv().await.unwrap();
        match event.payload {
            EventPayload::FrameReceived {
                conversation_id,
                raw,
            } => {
                assert_eq!(conversation_id.as_str(), "abcde");
                assert!(raw.contains("counselor"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn lost_connection_publishes_retry_event() {
        let _guard = test_lock().lock().await;
        reset(vec![ConnectScript(Ok(vec![RecvStep::Fail(
            "broken pipe".to_string(),
        )]))]);

        let (bus, manager) = manager();
        let mut sub = bus.subscribe("channel.connection.**").unwrap();
        let _handle = manager.open(&ConversationId::new("abcde"));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.topic.as_str(), "channel.connection.established");

        let second = sub.recv().await.unwrap();
        assert_eq!(second.topic.as_str(), "channel.connection.lost");
        match second.payload {
            EventPayload::ConnectionLost {
                reason, will_retry, ..
            } => {
                assert!(reason.contains("broken pipe"));
                assert!(will_retry);
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        let third = sub.recv().await.unwrap();
        assert_eq!(third.topic.as_str(), "channel.connection.reconnecting");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn frame_racing_a_close_is_never_published() {
        let _guard = test_lock().lock().await;
        reset(vec![ConnectScript(Ok(vec![RecvStep::Frame(
            r#"{"type":"message","sender":"counselor","content":"late"}"#.to_string(),
        )]))]);

        let (bus, manager) = manager();
        let mut frames = bus.subscribe("channel.frame.received").unwrap();
        let id = ConversationId::new("abcde");
        let handle = manager.open(&id);
        // Cancellation lands before the driver's first poll; the frame
        // sitting in the transport must be discarded, not applied.
        manager.close(&id);
        settle().await;

        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(CONNECTS.load(Ordering::SeqCst), 0);
        let result = tokio::time::timeout(Duration::from_secs(1), frames.recv()).await;
        assert!(result.is_err(), "closed session published a frame");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn reopening_replaces_the_existing_channel() {
        let _guard = test_lock().lock().await;
        reset(vec![ConnectScript(Ok(vec![])), ConnectScript(Ok(vec![]))]);

        let (_bus, manager) = manager();
        let id = ConversationId::new("abcde");
        let first = manager.open(&id);
        let mut states = first.state_watch();
        wait_for(&mut states, ConnectionState::Open).await;

        let second = manager.open(&id);
        let mut second_states = second.state_watch();
        wait_for(&mut second_states, ConnectionState::Open).await;

        wait_for(&mut states, ConnectionState::Closed).await;
        assert!(first.send("late".to_string()).is_err());
        assert!(second.is_open());
    }
}
