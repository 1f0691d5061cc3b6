//! Wiring of channels and store into one constructed client.
//!
//! Everything is passed in explicitly, with no process-wide singleton, so
//! the store can be exercised with fake inputs and several clients can
//! coexist in one process.

use tracing::info;

use persona_proto::SessionFrame;

use crate::channel::{
    ChannelState, EventChannel, FrameChannel, FrameSubscription, ListenerHandle,
};
use crate::config::Config;
use crate::store::TelemetryStore;

/// The live telemetry client: one JSON event channel, one binary screencast
/// channel, and the reconciled store both feed into.
pub struct TelemetryClient {
    viewer_id: String,
    events: EventChannel,
    frames: FrameChannel,
    store: TelemetryStore,
    _event_feed: ListenerHandle,
}

impl TelemetryClient {
    pub fn new(config: &Config) -> Self {
        let viewer_id = format!("viewer-{}", uuid::Uuid::new_v4());
        let store = TelemetryStore::new(config.default_action.clone());
        let events = EventChannel::new(config.event_url(), config.event_policy());
        let frames = FrameChannel::new(config.frame_url(), config.frame_policy());

        // The event listener is the store's only writer.
        let feed_store = store.clone();
        let event_feed = events.on_event(move |event| feed_store.apply_event(event));

        Self {
            viewer_id,
            events,
            frames,
            store,
            _event_feed: event_feed,
        }
    }

    /// Open both channels. Idempotent; each channel reconnects on its own
    /// schedule afterwards.
    pub fn connect(&self) {
        info!(viewer_id = %self.viewer_id, "connecting telemetry channels");
        self.events.connect();
        self.frames.connect();
    }

    /// Watch a study: reset the store to it and point the event channel at
    /// it. Switching studies drops the previous study's state entirely.
    pub fn watch_study(&self, study_id: &str) {
        info!(viewer_id = %self.viewer_id, study_id, "watching study");
        self.store.init_study(study_id);
        self.events.watch(study_id);
    }

    /// Register a screencast handler for one session.
    pub fn subscribe_frames(
        &self,
        session_id: &str,
        handler: impl Fn(&SessionFrame) + Send + Sync + 'static,
    ) -> FrameSubscription {
        self.frames.subscribe(session_id, handler)
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn frames(&self) -> &FrameChannel {
        &self.frames
    }

    pub fn event_state(&self) -> ChannelState {
        self.events.state()
    }

    pub fn frame_state(&self) -> ChannelState {
        self.frames.state()
    }

    /// Tear both channels down and stop reconnecting.
    pub fn shutdown(&self) {
        info!(viewer_id = %self.viewer_id, "shutting down telemetry channels");
        self.events.disconnect();
        self.frames.disconnect();
    }
}
