//! Binary screencast channel: demultiplexes image frames per session.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

use persona_proto::{FrameControl, SessionFrame, decode_session_frame};

use super::{ChannelState, ListenerHandle, ReconnectPolicy, ReconnectingChannel, WireDecoder};

/// Decodes binary frames into [`SessionFrame`]s. Text frames and undersized
/// binary frames are dropped; the image payload is never inspected.
pub struct FrameDecoder;

impl WireDecoder for FrameDecoder {
    type Item = SessionFrame;

    fn decode(&self, message: Message) -> Option<SessionFrame> {
        let data = match message {
            Message::Binary(data) => data,
            _ => return None,
        };
        match decode_session_frame(&data) {
            Ok(frame) => Some(frame),
            Err(err) => {
                trace!(error = %err, len = data.len(), "dropping malformed screencast frame");
                None
            }
        }
    }
}

type FrameHandler = Arc<dyn Fn(&SessionFrame) + Send + Sync>;

type HandlerTable = HashMap<String, HashMap<u64, FrameHandler>>;

/// Screencast channel with reference-counted per-session subscriptions.
///
/// Several independent viewers may watch the same session; the physical
/// subscribe control frame goes out only on the 0→1 handler transition and
/// the unsubscribe only on 1→0, so the server-side subscription set always
/// equals the set of sessions with at least one local handler.
#[derive(Clone)]
pub struct FrameChannel {
    inner: ReconnectingChannel<FrameDecoder>,
    handlers: Arc<Mutex<HandlerTable>>,
    next_id: Arc<AtomicU64>,
    _dispatch: Arc<ListenerHandle>,
}

impl FrameChannel {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let inner = ReconnectingChannel::new(url, policy, FrameDecoder);
        let handlers: Arc<Mutex<HandlerTable>> = Arc::new(Mutex::new(HashMap::new()));

        let replay_handlers = handlers.clone();
        inner.set_replay(move || {
            replay_handlers
                .lock()
                .keys()
                .map(|session_id| {
                    control_frame(&FrameControl::Subscribe {
                        session_id: session_id.clone(),
                    })
                })
                .collect()
        });

        let dispatch_handlers = handlers.clone();
        let dispatch = inner.on_message(move |frame: &SessionFrame| {
            let targets: Vec<FrameHandler> = dispatch_handlers
                .lock()
                .get(&frame.session_id)
                .map(|session| session.values().cloned().collect())
                .unwrap_or_default();
            if targets.is_empty() {
                // Expected race: the frame was in flight when the last local
                // handler unsubscribed.
                trace!(session_id = %frame.session_id, "dropping frame with no handler");
                return;
            }
            for handler in targets {
                handler(frame);
            }
        });

        Self {
            inner,
            handlers,
            next_id: Arc::new(AtomicU64::new(1)),
            _dispatch: Arc::new(dispatch),
        }
    }

    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Tear down the connection and drop every local handler.
    pub fn disconnect(&self) {
        self.handlers.lock().clear();
        self.inner.disconnect();
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Register a handler for one session's frames. The physical subscribe
    /// is sent only when this is the session's first handler.
    pub fn subscribe(
        &self,
        session_id: &str,
        handler: impl Fn(&SessionFrame) + Send + Sync + 'static,
    ) -> FrameSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut handlers = self.handlers.lock();
            let session = handlers.entry(session_id.to_string()).or_default();
            session.insert(id, Arc::new(handler));
            session.len() == 1
        };
        if first {
            self.inner.send(control_frame(&FrameControl::Subscribe {
                session_id: session_id.to_string(),
            }));
        }

        let handlers = self.handlers.clone();
        let inner = self.inner.clone();
        let session_id = session_id.to_string();
        FrameSubscription {
            cancel: Some(Box::new(move || {
                let last = {
                    let mut handlers = handlers.lock();
                    match handlers.get_mut(&session_id) {
                        Some(session) => {
                            session.remove(&id);
                            if session.is_empty() {
                                handlers.remove(&session_id);
                                true
                            } else {
                                false
                            }
                        }
                        None => false,
                    }
                };
                if last {
                    inner.send(control_frame(&FrameControl::Unsubscribe {
                        session_id: session_id.clone(),
                    }));
                }
            })),
        }
    }

    pub fn on_state(
        &self,
        callback: impl Fn(&ChannelState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.on_state(callback)
    }

    /// Session ids with at least one local handler; always equal to the
    /// physical subscription set sent to the server.
    pub fn subscribed_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self.handlers.lock().keys().cloned().collect();
        sessions.sort();
        sessions
    }
}

/// Releases one handler registration; the physical unsubscribe goes out when
/// the last handler for a session is dropped.
pub struct FrameSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl FrameSubscription {
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

fn control_frame(control: &FrameControl) -> Message {
    Message::Text(serde_json::to_string(control).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_proto::encode_session_frame;

    #[test]
    fn decoder_drops_short_and_text_frames() {
        let decoder = FrameDecoder;
        assert!(decoder.decode(Message::Text("nope".into())).is_none());
        assert!(decoder.decode(Message::Binary(vec![0u8; 10])).is_none());
        assert!(decoder.decode(Message::Binary(vec![b'a'; 36])).is_none());
    }

    #[test]
    fn decoder_demuxes_session_id() {
        let decoder = FrameDecoder;
        let frame = decoder
            .decode(Message::Binary(encode_session_frame("p7", b"jpegdata")))
            .unwrap();
        assert_eq!(frame.session_id, "p7");
        assert_eq!(&frame.payload[..], b"jpegdata");
    }

    #[tokio::test]
    async fn refcount_tracks_local_handlers() {
        let channel = FrameChannel::new("ws://127.0.0.1:1/ws/frames", ReconnectPolicy::default());

        let sub_a = channel.subscribe("p1", |_| {});
        let sub_b = channel.subscribe("p1", |_| {});
        let sub_c = channel.subscribe("p2", |_| {});
        assert_eq!(channel.subscribed_sessions(), vec!["p1", "p2"]);

        drop(sub_a);
        assert_eq!(channel.subscribed_sessions(), vec!["p1", "p2"]);

        drop(sub_b);
        assert_eq!(channel.subscribed_sessions(), vec!["p2"]);

        sub_c.cancel();
        assert!(channel.subscribed_sessions().is_empty());
    }
}
