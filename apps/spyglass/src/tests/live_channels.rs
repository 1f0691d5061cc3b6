//! End-to-end channel tests against an in-process WebSocket server.

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        extract::{
            State, WebSocketUpgrade,
            ws::{Message as WsMessage, WebSocket},
        },
        response::IntoResponse,
        routing::get,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::timeout;

    use persona_proto::encode_session_frame;

    use crate::channel::{ChannelState, EventChannel, FrameChannel, ReconnectPolicy};
    use crate::client::TelemetryClient;
    use crate::config::Config;

    const WAIT: Duration = Duration::from_secs(5);

    /// Frames the test pushes to every connected socket.
    #[derive(Clone, Debug)]
    enum OutFrame {
        Text(String),
        Binary(Vec<u8>),
        Close,
    }

    struct ServerState {
        inbound: mpsc::UnboundedSender<String>,
        outbound: broadcast::Sender<OutFrame>,
    }

    /// Serves `/ws/events` and `/ws/frames` on an ephemeral port. Text
    /// frames received from any client are forwarded to the returned
    /// receiver; broadcast frames go out to every connected socket.
    async fn spawn_server() -> (
        String,
        mpsc::UnboundedReceiver<String>,
        broadcast::Sender<OutFrame>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, _) = broadcast::channel(64);
        let state = Arc::new(ServerState {
            inbound: in_tx,
            outbound: out_tx.clone(),
        });
        let app = Router::new()
            .route("/ws/events", get(ws_handler))
            .route("/ws/frames", get(ws_handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("127.0.0.1:{}", addr.port()), in_rx, out_tx)
    }

    async fn ws_handler(
        State(state): State<Arc<ServerState>>,
        upgrade: WebSocketUpgrade,
    ) -> impl IntoResponse {
        upgrade.on_upgrade(move |socket| serve_socket(socket, state))
    }

    async fn serve_socket(mut socket: WebSocket, state: Arc<ServerState>) {
        let mut outbound = state.outbound.subscribe();
        loop {
            tokio::select! {
                received = socket.recv() => match received {
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = state.inbound.send(text);
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
                frame = outbound.recv() => match frame {
                    Ok(OutFrame::Text(text)) => {
                        if socket.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(OutFrame::Binary(bytes)) => {
                        if socket.send(WsMessage::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Ok(OutFrame::Close) => {
                        let _ = socket.send(WsMessage::Close(None)).await;
                        break;
                    }
                    Err(_) => {}
                },
            }
        }
    }

    fn fast_policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn event_channel_subscribes_and_delivers() {
        let (host, mut inbound, out_tx) = spawn_server().await;
        let channel = EventChannel::new(format!("ws://{host}/ws/events"), fast_policy(Some(10)));

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let _listener = channel.on_event(move |event| {
            let _ = event_tx.send(event.clone());
        });

        // Watching before the socket is open relies on subscription replay.
        channel.watch("s1");
        channel.connect();

        let control = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert!(control.contains("\"subscribe\""));
        assert!(control.contains("\"s1\""));

        out_tx
            .send(OutFrame::Text(
                r#"{"type":"session_browser_closed","session_id":"p1"}"#.into(),
            ))
            .unwrap();
        let event = timeout(WAIT, event_rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            persona_proto::ServerEvent::SessionBrowserClosed {
                session_id: "p1".into()
            }
        );
        assert_eq!(channel.state(), ChannelState::Connected);

        channel.disconnect();
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn event_channel_resubscribes_after_server_drop() {
        let (host, mut inbound, out_tx) = spawn_server().await;
        let channel = EventChannel::new(format!("ws://{host}/ws/events"), fast_policy(Some(10)));
        channel.watch("s1");
        channel.connect();

        let first = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert!(first.contains("\"subscribe\""));

        // Kill the connection server-side; the channel must come back and
        // resubscribe on its own.
        out_tx.send(OutFrame::Close).unwrap();
        let second = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert!(second.contains("\"subscribe\""));
        assert!(second.contains("\"s1\""));

        channel.disconnect();
    }

    #[tokio::test]
    async fn frame_channel_refcounts_control_frames_and_dispatches() {
        let (host, mut inbound, out_tx) = spawn_server().await;
        let channel = FrameChannel::new(format!("ws://{host}/ws/frames"), fast_policy(None));

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_a = hits.clone();
        let sub_a = channel.subscribe("p1", move |frame| {
            assert_eq!(&frame.payload[..], b"jpeg");
            hits_a.fetch_add(1, Ordering::SeqCst);
        });
        let hits_b = hits.clone();
        let sub_b = channel.subscribe("p1", move |_| {
            hits_b.fetch_add(1, Ordering::SeqCst);
        });

        channel.connect();

        // Two local handlers, one physical subscription.
        let control = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert!(control.contains("\"subscribe\""));
        assert!(control.contains("\"p1\""));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(inbound.try_recv().is_err(), "expected a single subscribe");

        out_tx
            .send(OutFrame::Binary(encode_session_frame("p1", b"jpeg")))
            .unwrap();
        timeout(WAIT, async {
            while hits.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Frames for sessions nobody watches are dropped quietly.
        out_tx
            .send(OutFrame::Binary(encode_session_frame("ghost", b"jpeg")))
            .unwrap();

        // Dropping one handler keeps the physical subscription alive.
        drop(sub_a);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(inbound.try_recv().is_err());

        // Dropping the last handler unsubscribes.
        drop(sub_b);
        let control = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert!(control.contains("\"unsubscribe\""));
        assert!(control.contains("\"p1\""));

        channel.disconnect();
    }

    /// A port with nothing listening on it, so connects are refused.
    async fn dead_host() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("127.0.0.1:{}", addr.port())
    }

    #[tokio::test]
    async fn event_channel_goes_terminal_after_attempts_exhaust() {
        let host = dead_host().await;
        let channel = EventChannel::new(format!("ws://{host}/ws/events"), fast_policy(Some(2)));

        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let _listener = channel.on_state(move |state| {
            let _ = state_tx.send(*state);
        });

        channel.connect();
        // The channel starts out disconnected, so wait for the driver's own
        // terminal transition rather than polling the current state.
        timeout(WAIT, async {
            loop {
                match state_rx.recv().await {
                    Some(ChannelState::Disconnected) => break,
                    Some(_) => {}
                    None => panic!("state stream ended before going terminal"),
                }
            }
        })
        .await
        .unwrap();

        // No more attempts once terminal: the state stream stays quiet.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(state_rx.try_recv().is_err());
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_during_backoff_cancels_the_retry() {
        let host = dead_host().await;
        let channel = FrameChannel::new(
            format!("ws://{host}/ws/frames"),
            ReconnectPolicy {
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_millis(200),
                max_attempts: None,
            },
        );
        channel.connect();
        // Let the first connect fail and the backoff sleep begin.
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.disconnect();
        assert_eq!(channel.state(), ChannelState::Disconnected);

        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let _listener = channel.on_state(move |state| {
            let _ = state_tx.send(*state);
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(state_rx.try_recv().is_err(), "no retry after disconnect");
    }

    #[tokio::test]
    async fn client_end_to_end_updates_store() {
        let (host, mut inbound, out_tx) = spawn_server().await;
        let config = Config {
            server: host,
            reconnect_base_ms: 10,
            reconnect_max_ms: 100,
            ..Config::default()
        };
        let client = TelemetryClient::new(&config);
        client.connect();
        client.watch_study("s1");

        // Wait for the event channel's subscribe before pushing anything.
        let control = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert!(control.contains("\"subscribe\""));

        for step in 1..=3u32 {
            let event = format!(
                r#"{{"type":"session_step","study_id":"s1","session_id":"p1",
                    "persona_name":"Avery","step_number":{step},
                    "narration":"step {step}","action":{{"type":"clicking"}},
                    "emotion":"focused","task_progress":{}}}"#,
                step * 25,
            );
            out_tx.send(OutFrame::Text(event)).unwrap();
        }
        out_tx
            .send(OutFrame::Text(
                r#"{"type":"session_complete","study_id":"s1","session_id":"p1","total_steps":3}"#
                    .into(),
            ))
            .unwrap();

        let record = timeout(WAIT, async {
            loop {
                if let Some(record) = client.store().session("p1") {
                    if record.completed {
                        break record;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(record.total_steps, Some(3));
        assert_eq!(record.persona_name.as_deref(), Some("Avery"));
        let steps: Vec<u32> = record.history.iter().map(|e| e.step_number).collect();
        assert_eq!(steps, vec![0, 1, 2, 3, 4]);
        assert_eq!(record.emotion.as_deref(), Some("satisfied"));
        assert_eq!(record.task_progress, Some(100));

        client.shutdown();
    }
}
