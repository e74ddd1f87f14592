/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use futures_util::{SinkExt, StreamExt};
use randcall_protocol::{decode_frame, encode_frame, ChatMessage, SignalEnvelope, WsFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::error::CoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Push,
    Poll,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Push => "push",
            TransportMode::Poll => "poll",
        }
    }
}

/// Everything the signaling channel reports upward. The session core treats
/// push and poll identically from here on.
#[derive(Debug)]
pub enum TransportEvent {
    /// Channel is live in the given mode.
    Open(TransportMode),
    /// Push open did not confirm in time (or dropped); polling takes over.
    Degraded,
    /// One inbound frame, already decoded.
    Frame(WsFrame),
    /// Matchmaking result observed by the poll loop.
    Match(randcall_protocol::MatchResult),
    /// Outbound chat message with this id was handed to the backend.
    SentChat { id: String },
    /// Unrecoverable channel failure.
    Fault(CoreError),
    Closed,
}

#[derive(Debug)]
enum Outbound {
    Signal(SignalEnvelope),
    Chat(ChatMessage),
}

/// One signaling channel for one call. Tries the push websocket first and
/// degrades to REST polling exactly once; it never switches back within the
/// same call.
pub struct Transport {
    out_tx: mpsc::Sender<Outbound>,
    shutdown_tx: watch::Sender<bool>,
    matched: Arc<AtomicBool>,
}

impl Transport {
    pub fn open(
        api: Arc<ApiClient>,
        call_id: String,
        ws_url: String,
        failover_timeout: Duration,
        poll_interval: Duration,
        already_matched: bool,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let matched = Arc::new(AtomicBool::new(already_matched));
        let driver = Driver {
            api,
            call_id,
            ws_url,
            failover_timeout,
            poll_interval,
            matched: matched.clone(),
            events,
            out_rx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(driver.run());
        Self { out_tx, shutdown_tx, matched }
    }

    pub async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), CoreError> {
        self.out_tx
            .send(Outbound::Signal(envelope))
            .await
            .map_err(|_| CoreError::TransportError("signaling channel closed".into()))
    }

    pub async fn send_chat(&self, message: ChatMessage) -> Result<(), CoreError> {
        self.out_tx
            .send(Outbound::Chat(message))
            .await
            .map_err(|_| CoreError::TransportError("signaling channel closed".into()))
    }

    /// Stops the poll loop's matchmaking probes once a match is known from
    /// elsewhere (push frame or our own find-match call).
    pub fn mark_matched(&self) {
        self.matched.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Driver {
    api: Arc<ApiClient>,
    call_id: String,
    ws_url: String,
    failover_timeout: Duration,
    poll_interval: Duration,
    matched: Arc<AtomicBool>,
    events: mpsc::Sender<TransportEvent>,
    out_rx: mpsc::Receiver<Outbound>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        match tokio::time::timeout(
            self.failover_timeout,
            tokio_tungstenite::connect_async(&self.ws_url),
        )
        .await
        {
            Ok(Ok((ws, _resp))) => {
                info!(url = %self.ws_url, "push channel open");
                self.emit(TransportEvent::Open(TransportMode::Push)).await;
                let clean = self.push_loop(ws).await;
                if clean {
                    self.emit(TransportEvent::Closed).await;
                    return;
                }
                // Mid-call drop degrades to polling for the rest of the call.
                warn!("push channel dropped, degrading to polling");
            }
            Ok(Err(e)) => {
                warn!("push channel connect failed: {e}, degrading to polling");
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.failover_timeout.as_secs(),
                    "push channel did not confirm in time, degrading to polling"
                );
            }
        }
        self.emit(TransportEvent::Degraded).await;
        self.emit(TransportEvent::Open(TransportMode::Poll)).await;
        self.poll_loop().await;
        self.emit(TransportEvent::Closed).await;
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }

    /// Returns true on a requested shutdown, false when the socket dropped.
    async fn push_loop(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> bool {
        let (mut ws_tx, mut ws_rx) = ws.split();
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                        return true;
                    }
                }
                out = self.out_rx.recv() => {
                    let Some(out) = out else { return true; };
                    let (frame, chat_id) = match out {
                        Outbound::Signal(env) => (WsFrame::WebrtcSignal(env), None),
                        Outbound::Chat(msg) => {
                            let id = msg.id.clone();
                            (WsFrame::ChatMessage(msg), Some(id))
                        }
                    };
                    let json = encode_frame(&frame);
                    if let Err(e) = ws_tx.send(tungstenite::Message::Text(json)).await {
                        warn!("push send failed: {e}");
                        return false;
                    }
                    if let Some(id) = chat_id {
                        self.emit(TransportEvent::SentChat { id }).await;
                    }
                }
                msg = ws_rx.next() => {
                    let Some(msg) = msg else { return false; };
                    let msg = match msg {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("push receive failed: {e}");
                            return false;
                        }
                    };
                    let text = match msg {
                        tungstenite::Message::Text(t) => t,
                        tungstenite::Message::Ping(p) => {
                            let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                            continue;
                        }
                        tungstenite::Message::Close(_) => return false,
                        _ => continue,
                    };
                    match decode_frame(&text) {
                        Ok(frame) => self.emit(TransportEvent::Frame(frame)).await,
                        // Malformed frames are dropped, the channel stays up.
                        Err(e) => warn!("bad push frame: {e}"),
                    }
                }
            }
        }
    }

    async fn poll_loop(&mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return;
                    }
                }
                out = self.out_rx.recv() => {
                    let Some(out) = out else { return; };
                    if let Err(e) = self.dispatch_rest(out).await {
                        if e == CoreError::AuthExpired {
                            self.emit(TransportEvent::Fault(e)).await;
                            return;
                        }
                        // Outbound frames have no retry path; make the
                        // drop visible.
                        warn!("rest dispatch failed, dropping outbound frame: {e}");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        if self.fatal(e).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_rest(&self, out: Outbound) -> Result<(), CoreError> {
        match out {
            Outbound::Signal(env) => self.api.send_signal(&self.call_id, &env).await,
            Outbound::Chat(msg) => {
                let id = msg.id.clone();
                self.api.send_message(&self.call_id, &msg).await?;
                self.emit(TransportEvent::SentChat { id }).await;
                Ok(())
            }
        }
    }

    async fn poll_once(&self) -> Result<(), CoreError> {
        if !self.matched.load(Ordering::SeqCst) {
            let m = self.api.find_match().await?;
            if m.matched {
                self.matched.store(true, Ordering::SeqCst);
                self.emit(TransportEvent::Match(m)).await;
            }
            return Ok(());
        }
        for envelope in self.api.poll_signals(&self.call_id).await? {
            self.emit(TransportEvent::Frame(WsFrame::WebrtcSignal(envelope))).await;
        }
        // Full history each poll; the chat relay dedups by message id.
        for message in self.api.fetch_messages(&self.call_id).await? {
            self.emit(TransportEvent::Frame(WsFrame::ChatMessage(message))).await;
        }
        Ok(())
    }

    /// AuthExpired ends the channel; any other poll failure is assumed
    /// transient and the next tick retries.
    async fn fatal(&self, e: CoreError) -> bool {
        if e == CoreError::AuthExpired {
            self.emit(TransportEvent::Fault(e)).await;
            return true;
        }
        debug!("poll iteration failed: {e}");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::routing::{any, get, post};
    use axum::{Json, Router};
    use std::sync::atomic::AtomicU32;
    use tokio::time::Duration;

    #[derive(Default)]
    struct Backend {
        find_match_calls: AtomicU32,
        signal_sends: AtomicU32,
    }

    async fn ws_echo(mut socket: WebSocket) {
        let greeting = r#"{"type":"connection_established","message":null}"#;
        if socket.send(AxMessage::Text(greeting.into())).await.is_err() {
            return;
        }
        // Echo every text frame back so the client sees its own signal.
        while let Some(Ok(msg)) = socket.recv().await {
            if let AxMessage::Text(t) = msg {
                if socket.send(AxMessage::Text(t)).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn spawn_backend(state: Arc<Backend>, with_ws: bool) -> (String, String) {
        let mut app = Router::new()
            .route(
                "/api/v1/register",
                post(|| async {
                    Json(serde_json::json!({
                        "user": { "id": 1, "username": "alice" },
                        "access_token": "a", "refresh_token": "r",
                    }))
                }),
            )
            .route(
                "/api/v1/call/find-match",
                post(|State(s): State<Arc<Backend>>| async move {
                    let n = s.find_match_calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Json(serde_json::json!({ "matched": false }))
                    } else {
                        Json(serde_json::json!({
                            "matched": true,
                            "call": { "id": "call-1", "participants": [] },
                            "matched_user": "bob",
                            "match_type": "online_user",
                        }))
                    }
                }),
            )
            .route(
                "/api/v1/call/call-1/signal/send",
                post(|State(s): State<Arc<Backend>>| async move {
                    s.signal_sends.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({}))
                }),
            )
            .route(
                "/api/v1/call/call-1/signal",
                get(|| async {
                    Json(serde_json::json!([
                        { "kind": "answer", "payload": { "type": "answer", "sdp": "v=0 a" } }
                    ]))
                }),
            )
            .route(
                "/api/v1/call/call-1/messages",
                get(|| async { Json(serde_json::json!([])) }),
            );
        if with_ws {
            app = app.route(
                "/ws/video_call/call-1/",
                any(|ws: WebSocketUpgrade| async move { ws.on_upgrade(ws_echo) }),
            );
        }
        let app = app.with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), format!("ws://{addr}"))
    }

    async fn api_for(base: &str) -> Arc<ApiClient> {
        let cfg = CoreConfig {
            api_base_url: base.to_string(),
            http_timeout_secs: Some(2),
            ..CoreConfig::default()
        };
        let api = Arc::new(ApiClient::new(&cfg).unwrap());
        api.register("alice").await.unwrap();
        api
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn push_channel_opens_and_delivers_frames() {
        let backend = Arc::new(Backend::default());
        let (base, ws_base) = spawn_backend(backend.clone(), true).await;
        let api = api_for(&base).await;
        let (tx, mut rx) = mpsc::channel(32);

        let transport = Transport::open(
            api,
            "call-1".into(),
            format!("{ws_base}/ws/video_call/call-1/?username=alice"),
            Duration::from_secs(5),
            Duration::from_millis(100),
            true,
            tx,
        );

        assert!(matches!(next_event(&mut rx).await, TransportEvent::Open(TransportMode::Push)));
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Frame(WsFrame::ConnectionEstablished)
        ));

        // The echo server reflects our own signal back as an inbound frame.
        transport
            .send_signal(SignalEnvelope::Answer(randcall_protocol::Sdp {
                sdp_type: "answer".into(),
                sdp: "v=0 a".into(),
            }))
            .await
            .unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Frame(WsFrame::WebrtcSignal(SignalEnvelope::Answer(sdp))) => {
                assert_eq!(sdp.sdp, "v=0 a");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(backend.signal_sends.load(Ordering::SeqCst), 0);

        transport.close();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Closed));
    }

    #[tokio::test]
    async fn missing_push_endpoint_degrades_once_to_polling() {
        let backend = Arc::new(Backend::default());
        let (base, ws_base) = spawn_backend(backend.clone(), false).await;
        let api = api_for(&base).await;
        let (tx, mut rx) = mpsc::channel(32);

        let transport = Transport::open(
            api,
            "call-1".into(),
            format!("{ws_base}/ws/video_call/call-1/?username=alice"),
            Duration::from_secs(2),
            Duration::from_millis(50),
            false,
            tx,
        );

        assert!(matches!(next_event(&mut rx).await, TransportEvent::Degraded));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Open(TransportMode::Poll)));

        // Second find-match probe reports the match, after which the loop
        // switches to draining signals.
        match next_event(&mut rx).await {
            TransportEvent::Match(m) => {
                assert!(m.matched);
                assert_eq!(m.matched_user.as_deref(), Some("bob"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut rx).await {
            TransportEvent::Frame(WsFrame::WebrtcSignal(SignalEnvelope::Answer(_))) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(backend.find_match_calls.load(Ordering::SeqCst) >= 2);

        // Outbound signals go over REST in poll mode.
        transport
            .send_signal(SignalEnvelope::Answer(randcall_protocol::Sdp {
                sdp_type: "answer".into(),
                sdp: "v=0 a".into(),
            }))
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while backend.signal_sends.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "signal never sent over rest");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        transport.close();
    }

    #[tokio::test]
    async fn failed_rest_dispatch_drops_frame_but_keeps_channel_alive() {
        let backend = Arc::new(Backend::default());
        let (base, ws_base) = spawn_backend(backend.clone(), false).await;
        let api = api_for(&base).await;
        let (tx, mut rx) = mpsc::channel(32);

        // No routes exist for call-9, so every dispatch gets a 404.
        let transport = Transport::open(
            api,
            "call-9".into(),
            format!("{ws_base}/ws/video_call/call-9/?username=alice"),
            Duration::from_secs(2),
            Duration::from_millis(50),
            true,
            tx,
        );
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Degraded));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Open(TransportMode::Poll)));

        transport
            .send_signal(SignalEnvelope::Answer(randcall_protocol::Sdp {
                sdp_type: "answer".into(),
                sdp: "v=0 a".into(),
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The rejected send was dropped without faulting the channel, and a
        // requested close still shuts it down cleanly.
        transport.close();
        loop {
            match next_event(&mut rx).await {
                TransportEvent::Fault(e) => panic!("unexpected fault: {e}"),
                TransportEvent::Closed => break,
                _ => {}
            }
        }
        assert_eq!(backend.signal_sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chat_over_rest_reports_sent() {
        let backend = Arc::new(Backend::default());
        let (base, ws_base) = spawn_backend(backend.clone(), false).await;
        let api = api_for(&base).await;
        let (tx, mut rx) = mpsc::channel(32);

        let transport = Transport::open(
            api,
            "call-1".into(),
            format!("{ws_base}/ws/video_call/call-1/?username=alice"),
            Duration::from_secs(2),
            Duration::from_secs(10),
            true,
            tx,
        );
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Degraded));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Open(TransportMode::Poll)));

        let msg = ChatMessage {
            id: "m1".into(),
            sender: "alice".into(),
            content: "hi".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
        };
        transport.send_chat(msg).await.unwrap();
        // The messages/send route is not registered, so the send is rejected
        // with 404 and no SentChat confirmation may arrive before Closed.
        transport.close();
        loop {
            match next_event(&mut rx).await {
                TransportEvent::SentChat { .. } => panic!("unexpected confirmation"),
                TransportEvent::Closed => break,
                _ => {}
            }
        }
    }
}
