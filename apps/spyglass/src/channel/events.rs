//! JSON event channel: server-pushed telemetry for the watched study.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

use persona_proto::{ServerEvent, StudyControl};

use super::{ChannelState, ListenerHandle, ReconnectPolicy, ReconnectingChannel, WireDecoder};

/// Decodes server events out of JSON text frames. Anything else (binary
/// frames, unparseable JSON, unknown event types) is dropped.
pub struct EventDecoder;

impl WireDecoder for EventDecoder {
    type Item = ServerEvent;

    fn decode(&self, message: Message) -> Option<ServerEvent> {
        let text = match message {
            Message::Text(text) => text,
            _ => return None,
        };
        match serde_json::from_str(&text) {
            Ok(event) => Some(event),
            Err(err) => {
                trace!(error = %err, "dropping undecodable event frame");
                None
            }
        }
    }
}

/// Event channel with a single physical study subscription.
///
/// `watch()` switches the subscription; the subscribe control frame is
/// re-sent on every connect while a study is desired, so reconnects resume
/// delivery without the caller doing anything.
#[derive(Clone)]
pub struct EventChannel {
    inner: ReconnectingChannel<EventDecoder>,
    desired: Arc<RwLock<Option<String>>>,
}

impl EventChannel {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let inner = ReconnectingChannel::new(url, policy, EventDecoder);
        let desired: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));

        let replay_desired = desired.clone();
        inner.set_replay(move || {
            replay_desired
                .read()
                .as_ref()
                .map(|study_id| {
                    vec![control_frame(&StudyControl::Subscribe {
                        study_id: study_id.clone(),
                    })]
                })
                .unwrap_or_default()
        });

        Self { inner, desired }
    }

    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Tear down the connection and forget the watched study.
    pub fn disconnect(&self) {
        *self.desired.write() = None;
        self.inner.disconnect();
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Watch a study, replacing any previous subscription.
    pub fn watch(&self, study_id: &str) {
        let previous = {
            let mut desired = self.desired.write();
            if desired.as_deref() == Some(study_id) {
                return;
            }
            desired.replace(study_id.to_string())
        };
        if let Some(previous) = previous {
            self.inner.send(control_frame(&StudyControl::Unsubscribe {
                study_id: previous,
            }));
        }
        self.inner.send(control_frame(&StudyControl::Subscribe {
            study_id: study_id.to_string(),
        }));
    }

    /// Stop watching without disconnecting.
    pub fn unwatch(&self) {
        if let Some(previous) = self.desired.write().take() {
            self.inner.send(control_frame(&StudyControl::Unsubscribe {
                study_id: previous,
            }));
        }
    }

    pub fn watched(&self) -> Option<String> {
        self.desired.read().clone()
    }

    pub fn on_event(
        &self,
        callback: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.on_message(callback)
    }

    pub fn on_state(
        &self,
        callback: impl Fn(&ChannelState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.on_state(callback)
    }
}

fn control_frame(control: &StudyControl) -> Message {
    // StudyControl serialization is infallible: plain strings and a tag.
    Message::Text(serde_json::to_string(control).unwrap_or_default())
}
