//! Long-lived streaming connections to the orchestrator.
//!
//! [`ReconnectingChannel`] is the shared primitive: a WebSocket wrapped in a
//! state machine with exponential backoff and a pluggable decoder. The two
//! concrete channels, [`events::EventChannel`] and [`frames::FrameChannel`],
//! layer their subscription protocols on top of it.

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

pub mod events;
pub mod frames;

pub use events::EventChannel;
pub use frames::{FrameChannel, FrameSubscription};

/// Decodes one transport message into the channel's item type. Returning
/// `None` drops the frame; a malformed frame never affects channel state.
pub trait WireDecoder: Send + Sync + 'static {
    type Item: Send + Sync + 'static;

    fn decode(&self, message: Message) -> Option<Self::Item>;
}

/// Connection lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Backoff schedule: `min(base * 2^attempt, max)`, with an optional attempt
/// ceiling after which the channel goes terminally disconnected.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Fan-out registry. Registration hands back a [`ListenerHandle`] that
/// removes the callback when dropped or cancelled.
pub(crate) struct Listeners<T> {
    inner: Arc<Mutex<HashMap<u64, Callback<T>>>>,
    next_id: AtomicU64,
}

impl<T> Listeners<T> {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle
    where
        T: 'static,
        Self: Sized,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().insert(id, Arc::new(callback));
        let registry = Arc::downgrade(&self.inner);
        ListenerHandle {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.lock().remove(&id);
                }
            })),
        }
    }

    fn emit(&self, value: &T) {
        // Snapshot the callbacks so a listener may unregister re-entrantly.
        let callbacks: Vec<Callback<T>> = self.inner.lock().values().cloned().collect();
        for callback in callbacks {
            callback(value);
        }
    }
}

/// Removes the associated listener when dropped.
pub struct ListenerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

type ReplayFn = Box<dyn Fn() -> Vec<Message> + Send + Sync>;

struct Shared<D: WireDecoder> {
    url: String,
    policy: ReconnectPolicy,
    decoder: D,
    state: RwLock<ChannelState>,
    attempt: AtomicU32,
    auto_reconnect: AtomicBool,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    messages: Listeners<D::Item>,
    state_changes: Listeners<ChannelState>,
    replay: RwLock<Option<ReplayFn>>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<D: WireDecoder> Shared<D> {
    fn set_state(&self, next: ChannelState) {
        let changed = {
            let mut state = self.state.write();
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            self.state_changes.emit(&next);
        }
    }
}

/// Generic reconnecting WebSocket channel.
///
/// Sends while not connected are dropped on the floor; the subscription
/// replay hook fired on every connect is the recovery mechanism.
pub struct ReconnectingChannel<D: WireDecoder> {
    shared: Arc<Shared<D>>,
}

impl<D: WireDecoder> Clone for ReconnectingChannel<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: WireDecoder> ReconnectingChannel<D> {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy, decoder: D) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                policy,
                decoder,
                state: RwLock::new(ChannelState::Disconnected),
                attempt: AtomicU32::new(0),
                auto_reconnect: AtomicBool::new(false),
                outbound: RwLock::new(None),
                messages: Listeners::new(),
                state_changes: Listeners::new(),
                replay: RwLock::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.read()
    }

    /// Control frames returned by the hook are replayed on every connect,
    /// which is what makes a reconnect transparent to subscribers.
    pub fn set_replay(&self, replay: impl Fn() -> Vec<Message> + Send + Sync + 'static) {
        *self.shared.replay.write() = Some(Box::new(replay));
    }

    pub fn on_message(&self, callback: impl Fn(&D::Item) + Send + Sync + 'static) -> ListenerHandle {
        self.shared.messages.register(callback)
    }

    pub fn on_state(&self, callback: impl Fn(&ChannelState) + Send + Sync + 'static) -> ListenerHandle {
        self.shared.state_changes.register(callback)
    }

    /// Start the connection driver. No-op while a driver is already running.
    pub fn connect(&self) {
        let mut driver = self.shared.driver.lock();
        if let Some(handle) = driver.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        self.shared.auto_reconnect.store(true, Ordering::SeqCst);
        self.shared.attempt.store(0, Ordering::SeqCst);
        let shared = self.shared.clone();
        *driver = Some(tokio::spawn(run_loop(shared)));
    }

    /// Tear the channel down: cancel any pending reconnect, close the
    /// socket, suppress auto-reconnect until the next `connect()`. Safe to
    /// call in any state.
    pub fn disconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        if let Some(handle) = self.shared.driver.lock().take() {
            handle.abort();
        }
        // Dropping the sender ends the write pump, which closes the socket.
        *self.shared.outbound.write() = None;
        self.shared.set_state(ChannelState::Disconnected);
    }

    /// Send one frame, silently dropped unless connected.
    pub fn send(&self, message: Message) {
        if self.state() != ChannelState::Connected {
            trace!(url = %self.shared.url, "dropping send while not connected");
            return;
        }
        if let Some(tx) = self.shared.outbound.read().as_ref() {
            let _ = tx.send(message);
        }
    }
}

async fn run_loop<D: WireDecoder>(shared: Arc<Shared<D>>) {
    loop {
        let attempt = shared.attempt.load(Ordering::SeqCst);
        shared.set_state(if attempt == 0 {
            ChannelState::Connecting
        } else {
            ChannelState::Reconnecting
        });

        match connect_async(shared.url.as_str()).await {
            Ok((ws, _)) => {
                let (mut sink, mut stream) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                *shared.outbound.write() = Some(tx);
                shared.attempt.store(0, Ordering::SeqCst);
                shared.set_state(ChannelState::Connected);
                debug!(url = %shared.url, "channel connected");

                // Replay desired subscriptions so the reconnect is invisible
                // to callers.
                let frames = shared
                    .replay
                    .read()
                    .as_ref()
                    .map(|replay| replay())
                    .unwrap_or_default();
                if let Some(tx) = shared.outbound.read().as_ref() {
                    for frame in frames {
                        let _ = tx.send(frame);
                    }
                }

                let write_pump = tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                });

                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(message) => {
                            if let Some(item) = shared.decoder.decode(message) {
                                shared.messages.emit(&item);
                            }
                        }
                    }
                }

                *shared.outbound.write() = None;
                write_pump.abort();
                debug!(url = %shared.url, "channel closed");
            }
            Err(err) => {
                debug!(url = %shared.url, error = %err, "connect failed");
            }
        }

        if !shared.auto_reconnect.load(Ordering::SeqCst) {
            shared.set_state(ChannelState::Disconnected);
            return;
        }
        let attempt = shared.attempt.load(Ordering::SeqCst);
        if let Some(max) = shared.policy.max_attempts {
            if attempt >= max {
                warn!(url = %shared.url, attempts = attempt, "reconnect attempts exhausted");
                shared.set_state(ChannelState::Disconnected);
                return;
            }
        }
        shared.set_state(ChannelState::Reconnecting);
        let delay = shared.policy.delay_for(attempt);
        shared.attempt.store(attempt + 1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
    }
}
