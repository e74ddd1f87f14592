/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use randcall_protocol::{IceCandidate, MatchResult, SignalEnvelope, WsFrame};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::chat::{ChatEntry, ChatRelay, RemoteAppend};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::media::{Liveness, LocalMedia, MediaSessionFactory, RtcMediaFactory};
use crate::negotiation::{ConnectionState, EngineState, Negotiation};
use crate::session::{CallSnapshot, SessionPhase, SessionState};
use crate::transport::{Transport, TransportEvent, TransportMode};
use crate::ui_events::{CallEvent, CallEventKind, ConfirmAction};

static HANDLE_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipOutcome {
    Skipped,
    /// `confirm_skip` is set; call `skip_confirmed` to actually skip.
    ConfirmationRequired,
}

enum Command {
    AttachMedia { media: LocalMedia, resp: oneshot::Sender<Result<(), CoreError>> },
    Register { username: String, resp: oneshot::Sender<Result<(), CoreError>> },
    CreateCall { resp: oneshot::Sender<Result<(), CoreError>> },
    FindMatch { resp: oneshot::Sender<Result<(), CoreError>> },
    SendChat { content: String, resp: oneshot::Sender<Result<String, CoreError>> },
    ClearChat { resp: oneshot::Sender<Result<(), CoreError>> },
    Skip { confirmed: bool, resp: oneshot::Sender<Result<SkipOutcome, CoreError>> },
    End { resp: oneshot::Sender<Result<(), CoreError>> },
    Snapshot { resp: oneshot::Sender<CallSnapshot> },
    ChatHistory { resp: oneshot::Sender<Vec<ChatEntry>> },
    ClearError { resp: oneshot::Sender<()> },
    Shutdown,
}

/// Everything the core task processes, one message at a time. Commands come
/// from the handle; the rest are tagged with the epoch or transport
/// generation they belong to so stale results from a torn-down call are
/// discarded instead of corrupting the next one.
enum CoreMsg {
    Cmd(Command),
    Transport(u64, TransportEvent),
    Liveness(u64, Liveness),
    Candidate(u64, IceCandidate),
}

/// Cloneable handle to one running call core. All methods queue onto the
/// core task; state changes are observed via `subscribe`.
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::Sender<CoreMsg>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn send_cmd<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoreMsg::Cmd(make(tx)))
            .await
            .map_err(|_| CoreError::CoreStopped)?;
        rx.await.map_err(|_| CoreError::CoreStopped)
    }

    pub async fn attach_media(&self, media: LocalMedia) -> Result<(), CoreError> {
        self.send_cmd(|resp| Command::AttachMedia { media, resp }).await?
    }

    pub async fn register(&self, username: &str) -> Result<(), CoreError> {
        let username = username.to_string();
        self.send_cmd(|resp| Command::Register { username, resp }).await?
    }

    pub async fn create_call(&self) -> Result<(), CoreError> {
        self.send_cmd(|resp| Command::CreateCall { resp }).await?
    }

    pub async fn find_match(&self) -> Result<(), CoreError> {
        self.send_cmd(|resp| Command::FindMatch { resp }).await?
    }

    /// Queues a chat message and returns its id. Delivery confirmation
    /// arrives later as a `ChatConfirmed` event.
    pub async fn send_chat(&self, content: &str) -> Result<String, CoreError> {
        let content = content.to_string();
        self.send_cmd(|resp| Command::SendChat { content, resp }).await?
    }

    pub async fn clear_chat(&self) -> Result<(), CoreError> {
        self.send_cmd(|resp| Command::ClearChat { resp }).await?
    }

    pub async fn skip(&self) -> Result<SkipOutcome, CoreError> {
        self.send_cmd(|resp| Command::Skip { confirmed: false, resp }).await?
    }

    pub async fn skip_confirmed(&self) -> Result<SkipOutcome, CoreError> {
        self.send_cmd(|resp| Command::Skip { confirmed: true, resp }).await?
    }

    pub async fn end_call(&self) -> Result<(), CoreError> {
        self.send_cmd(|resp| Command::End { resp }).await?
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CoreError> {
        self.send_cmd(|resp| Command::Snapshot { resp }).await
    }

    pub async fn chat_history(&self) -> Result<Vec<ChatEntry>, CoreError> {
        self.send_cmd(|resp| Command::ChatHistory { resp }).await
    }

    pub async fn clear_error(&self) -> Result<(), CoreError> {
        self.send_cmd(|resp| Command::ClearError { resp }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CoreMsg::Cmd(Command::Shutdown)).await;
    }
}

/// Starts the core task on the current tokio runtime.
pub fn spawn_core(
    cfg: CoreConfig,
    factory: Arc<dyn MediaSessionFactory>,
) -> Result<CallHandle> {
    let api = Arc::new(ApiClient::new(&cfg)?);
    let (tx, rx) = mpsc::channel(64);
    let (events, _) = broadcast::channel(256);
    let actor = CoreActor {
        cfg,
        api,
        factory,
        session: SessionState::new(),
        chat: ChatRelay::new(),
        pending_media: None,
        negotiation: None,
        transport: None,
        transport_mode: None,
        epoch: 0,
        transport_gen: 0,
        match_polling: false,
        events: events.clone(),
        msg_tx: tx.clone(),
        rx,
    };
    tokio::spawn(actor.run());
    Ok(CallHandle { tx, events })
}

struct CoreActor {
    cfg: CoreConfig,
    api: Arc<ApiClient>,
    factory: Arc<dyn MediaSessionFactory>,
    session: SessionState,
    chat: ChatRelay,
    /// Media attached before a call exists; handed to the engine at setup.
    pending_media: Option<LocalMedia>,
    negotiation: Option<Negotiation>,
    transport: Option<Transport>,
    transport_mode: Option<TransportMode>,
    /// Bumped on every teardown; stale liveness/candidate events carry the
    /// old value and are dropped.
    epoch: u64,
    /// Bumped whenever the transport is (re)opened, independently of the
    /// epoch, so switching to a matched call does not orphan the engine.
    transport_gen: u64,
    /// While true the core probes find-match over REST on each tick. Only
    /// used when the transport is in push mode; the poll loop probes itself.
    match_polling: bool,
    events: broadcast::Sender<CallEvent>,
    msg_tx: mpsc::Sender<CoreMsg>,
    rx: mpsc::Receiver<CoreMsg>,
}

impl CoreActor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break; };
                    match msg {
                        CoreMsg::Cmd(Command::Shutdown) => break,
                        CoreMsg::Cmd(cmd) => self.handle_command(cmd).await,
                        CoreMsg::Transport(gen, ev) => {
                            if gen == self.transport_gen {
                                self.handle_transport(ev).await;
                            }
                        }
                        CoreMsg::Liveness(epoch, l) => {
                            if epoch == self.epoch {
                                self.handle_liveness(l);
                            }
                        }
                        CoreMsg::Candidate(epoch, c) => {
                            if epoch == self.epoch {
                                self.send_envelopes(vec![SignalEnvelope::IceCandidate(c)]).await;
                            }
                        }
                    }
                }
                _ = ticker.tick(), if self.match_polling => {
                    self.match_probe().await;
                }
            }
        }
        info!("call core stopping");
        self.release_call_resources().await;
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn emit_phase(&self) {
        self.emit(CallEvent::phase(self.session.phase()));
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AttachMedia { media, resp } => {
                let out = match self.negotiation.as_mut() {
                    Some(neg) => neg.attach_local_media(media),
                    None => {
                        self.pending_media = Some(media);
                        Ok(())
                    }
                };
                let _ = resp.send(out);
            }
            Command::Register { username, resp } => {
                let _ = resp.send(self.do_register(&username).await);
            }
            Command::CreateCall { resp } => {
                let _ = resp.send(self.do_create_call().await);
            }
            Command::FindMatch { resp } => {
                let out = self.session.looking_for_match();
                if out.is_ok() {
                    self.emit_phase();
                    if self.transport_mode != Some(TransportMode::Poll) {
                        self.match_polling = true;
                    }
                }
                let _ = resp.send(out);
            }
            Command::SendChat { content, resp } => {
                let _ = resp.send(self.do_send_chat(&content).await);
            }
            Command::ClearChat { resp } => {
                let _ = resp.send(self.do_clear_chat().await);
            }
            Command::Skip { confirmed, resp } => {
                let _ = resp.send(self.do_skip(confirmed).await);
            }
            Command::End { resp } => {
                let _ = resp.send(self.do_end().await);
            }
            Command::Snapshot { resp } => {
                let mut snap = self.session.snapshot();
                snap.transport_mode = self.transport_mode.map(|m| m.as_str());
                snap.connection = self.negotiation.as_ref().map(|n| n.connection_state().as_str());
                snap.messages = self.chat.entries().to_vec();
                let _ = resp.send(snap);
            }
            Command::ChatHistory { resp } => {
                let _ = resp.send(self.chat.entries().to_vec());
            }
            Command::ClearError { resp } => {
                self.session.last_error = None;
                self.emit(CallEvent::new(CallEventKind::ErrorCleared));
                let _ = resp.send(());
            }
            Command::Shutdown => unreachable!("handled in the run loop"),
        }
    }

    async fn do_register(&mut self, username: &str) -> Result<(), CoreError> {
        let phase = self.session.phase();
        if phase == SessionPhase::Registered {
            // Idempotent; the existing identity stands.
            return Ok(());
        }
        if !matches!(phase, SessionPhase::Idle | SessionPhase::Ended | SessionPhase::Failed) {
            return Err(CoreError::InvalidTransition { op: "register", phase: phase.as_str() });
        }
        if let Some(user) = self.session.user.clone() {
            self.session.registered(user)?;
            self.emit_phase();
            return Ok(());
        }
        match self.api.register(username).await {
            Ok(user) => {
                self.session.registered(user)?;
                self.emit_phase();
                Ok(())
            }
            Err(e) => {
                self.surface_error(&e);
                Err(e)
            }
        }
    }

    async fn do_create_call(&mut self) -> Result<(), CoreError> {
        let phase = self.session.phase();
        if phase != SessionPhase::Registered {
            return Err(CoreError::InvalidTransition { op: "create_call", phase: phase.as_str() });
        }
        if self.pending_media.is_none() {
            return Err(CoreError::MediaRequired);
        }
        let call = match self.api.create_call().await {
            Ok(call) => call,
            Err(CoreError::AuthExpired) => {
                self.auth_expired().await;
                return Err(CoreError::AuthExpired);
            }
            Err(e) => {
                self.surface_error(&e);
                return Err(e);
            }
        };
        let call_id = call.id.clone();
        self.session.call_created(call)?;
        if let Err(e) = self.setup_call(&call_id).await {
            self.fail_call(e.clone()).await;
            return Err(e);
        }
        self.emit_phase();
        Ok(())
    }

    /// Builds the per-call machinery: one media capability, one negotiation
    /// engine, one transport, plus the forwarder tasks feeding their output
    /// back into the core queue.
    async fn setup_call(&mut self, call_id: &str) -> Result<(), CoreError> {
        let epoch = self.epoch;
        let (cand_tx, mut cand_rx) = mpsc::channel(32);
        let media_session = self
            .factory
            .create(cand_tx)
            .await
            .map_err(|e| CoreError::MediaUnavailable(format!("{e:#}")))?;
        let mut negotiation = Negotiation::new(media_session, self.cfg.candidate_buffer());
        if let Some(media) = self.pending_media.take() {
            negotiation.attach_local_media(media)?;
        }

        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            while let Some(c) = cand_rx.recv().await {
                if msg_tx.send(CoreMsg::Candidate(epoch, c)).await.is_err() {
                    break;
                }
            }
        });

        let mut liveness_rx = negotiation.liveness_watch();
        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            while liveness_rx.changed().await.is_ok() {
                let l = *liveness_rx.borrow_and_update();
                if msg_tx.send(CoreMsg::Liveness(epoch, l)).await.is_err() {
                    break;
                }
            }
        });

        self.negotiation = Some(negotiation);
        self.open_transport(call_id, false);
        Ok(())
    }

    fn open_transport(&mut self, call_id: &str, already_matched: bool) {
        self.transport_gen += 1;
        let gen = self.transport_gen;
        if let Some(t) = self.transport.take() {
            t.close();
        }
        let username = self.session.username().unwrap_or_default().to_string();
        let ws_url = self.api.ws_url(call_id, &username);
        let (tev_tx, mut tev_rx) = mpsc::channel(32);
        let transport = Transport::open(
            self.api.clone(),
            call_id.to_string(),
            ws_url,
            self.cfg.failover_timeout(),
            self.cfg.poll_interval(),
            already_matched,
            tev_tx,
        );
        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = tev_rx.recv().await {
                if msg_tx.send(CoreMsg::Transport(gen, ev)).await.is_err() {
                    break;
                }
            }
        });
        self.transport_mode = None;
        self.transport = Some(transport);
    }

    async fn do_send_chat(&mut self, content: &str) -> Result<String, CoreError> {
        let phase = self.session.phase();
        if phase != SessionPhase::Connected {
            return Err(CoreError::InvalidTransition { op: "send_chat", phase: phase.as_str() });
        }
        let sender = self.session.username().unwrap_or("anonymous").to_string();
        let message = self.chat.append_local(&sender, content);
        let id = message.id.clone();
        self.emit(CallEvent::new(CallEventKind::ChatAppended { id: id.clone() }));
        if let Some(t) = &self.transport {
            if let Err(e) = t.send_chat(message).await {
                warn!("chat dispatch failed: {e}");
            }
        }
        Ok(id)
    }

    async fn do_clear_chat(&mut self) -> Result<(), CoreError> {
        let phase = self.session.phase();
        let Some(call_id) = self.session.call_id().map(str::to_string) else {
            return Err(CoreError::InvalidTransition { op: "clear_chat", phase: phase.as_str() });
        };
        match self.api.clear_messages(&call_id).await {
            Ok(()) => {
                self.chat.clear();
                self.emit(CallEvent::new(CallEventKind::ChatCleared));
                Ok(())
            }
            Err(CoreError::AuthExpired) => {
                self.auth_expired().await;
                Err(CoreError::AuthExpired)
            }
            Err(e) => Err(e),
        }
    }

    async fn do_skip(&mut self, confirmed: bool) -> Result<SkipOutcome, CoreError> {
        if !self.session.phase().in_call() {
            return Ok(SkipOutcome::Skipped);
        }
        if self.cfg.confirm_skip() && !confirmed {
            self.emit(CallEvent::new(CallEventKind::ConfirmationRequired {
                action: ConfirmAction::Skip,
            }));
            return Ok(SkipOutcome::ConfirmationRequired);
        }
        if let Some(call_id) = self.session.call_id().map(str::to_string) {
            // Local teardown proceeds even if the backend call fails; the
            // server expires abandoned calls on its own.
            if let Err(e) = self.api.skip_call(&call_id).await {
                warn!("skip request failed: {e}");
            }
        }
        self.end_call_internal(true).await;
        Ok(SkipOutcome::Skipped)
    }

    async fn do_end(&mut self) -> Result<(), CoreError> {
        if !self.session.phase().in_call() {
            return Ok(());
        }
        if let Some(call_id) = self.session.call_id().map(str::to_string) {
            if let Err(e) = self.api.end_call(&call_id).await {
                warn!("end request failed: {e}");
            }
        }
        self.end_call_internal(false).await;
        Ok(())
    }

    async fn match_probe(&mut self) {
        if self.session.phase() != SessionPhase::LookingForMatch {
            self.match_polling = false;
            return;
        }
        match self.api.find_match().await {
            Ok(m) if m.matched => self.handle_match(m).await,
            Ok(_) => {}
            Err(CoreError::AuthExpired) => self.auth_expired().await,
            Err(e) => debug!("find-match probe failed: {e}"),
        }
    }

    async fn handle_match(&mut self, m: MatchResult) {
        if matches!(
            self.session.phase(),
            SessionPhase::Matched | SessionPhase::Connecting | SessionPhase::Connected
        ) {
            return;
        }
        let peer = m.matched_user.clone().unwrap_or_default();
        // The matchmaker may omit the flag; the side that asked for the
        // match offers first.
        let initiator = m.initiator.unwrap_or(true);
        if let Some(call) = m.call.clone() {
            // Matched into the peer's call: reopen signaling against it.
            if Some(call.id.as_str()) != self.session.call_id() {
                self.open_transport(&call.id, true);
                self.session.call = Some(call);
            }
        }
        if let Err(e) = self.session.matched(peer.clone(), m.match_type.clone(), initiator) {
            warn!("match result ignored: {e}");
            return;
        }
        self.match_polling = false;
        if let Some(t) = &self.transport {
            t.mark_matched();
        }
        self.emit(CallEvent::new(CallEventKind::MatchFound {
            username: peer,
            match_type: m.match_type,
        }));
        self.emit_phase();
        self.kickoff_negotiation(initiator).await;
    }

    async fn kickoff_negotiation(&mut self, initiator: bool) {
        let result = match self.negotiation.as_mut() {
            Some(neg) => {
                if initiator {
                    neg.start_as_initiator().await
                } else {
                    neg.start_as_responder().map(|()| Vec::new())
                }
            }
            None => return,
        };
        match result {
            Ok(envelopes) => {
                if self.session.connecting().is_ok() {
                    self.emit_phase();
                    self.emit(CallEvent::connection(ConnectionState::Negotiating));
                }
                self.send_envelopes(envelopes).await;
            }
            Err(e) => self.fail_call(e).await,
        }
    }

    async fn handle_transport(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::Open(mode) => {
                self.transport_mode = Some(mode);
                self.emit(CallEvent::transport_open(mode));
                match mode {
                    // The poll loop probes find-match itself.
                    TransportMode::Poll => self.match_polling = false,
                    TransportMode::Push => {
                        if self.session.phase() == SessionPhase::LookingForMatch {
                            self.match_polling = true;
                        }
                    }
                }
            }
            TransportEvent::Degraded => {
                self.emit(CallEvent::new(CallEventKind::TransportDegraded));
            }
            TransportEvent::Frame(frame) => self.handle_frame(frame).await,
            TransportEvent::Match(m) => self.handle_match(m).await,
            TransportEvent::SentChat { id } => {
                if self.chat.confirm(&id) {
                    self.emit(CallEvent::new(CallEventKind::ChatConfirmed { id }));
                }
            }
            TransportEvent::Fault(e) => {
                if e == CoreError::AuthExpired {
                    self.auth_expired().await;
                } else {
                    self.fail_call(e).await;
                }
            }
            TransportEvent::Closed => {}
        }
    }

    async fn handle_frame(&mut self, frame: WsFrame) {
        match frame {
            WsFrame::ConnectionEstablished => debug!("push channel greeting"),
            WsFrame::PeerLeft => {
                self.emit(CallEvent::new(CallEventKind::PeerLeft));
                self.end_call_internal(false).await;
            }
            WsFrame::ChatMessage(m) => {
                let id = m.id.clone();
                match self.chat.append_remote(m) {
                    RemoteAppend::Appended => {
                        self.emit(CallEvent::new(CallEventKind::ChatAppended { id }));
                    }
                    RemoteAppend::Confirmed => {
                        self.emit(CallEvent::new(CallEventKind::ChatConfirmed { id }));
                    }
                    RemoteAppend::Duplicate => {}
                }
            }
            WsFrame::WebrtcSignal(env) => self.handle_signal(env).await,
        }
    }

    async fn handle_signal(&mut self, env: SignalEnvelope) {
        // An offer before our own matchmaking result means the peer was
        // matched into our call; take the match as implied.
        if matches!(env, SignalEnvelope::Offer(_))
            && !matches!(
                self.session.phase(),
                SessionPhase::Matched | SessionPhase::Connecting | SessionPhase::Connected
            )
            && self.session.matched_implicit().is_ok()
        {
            self.match_polling = false;
            if let Some(t) = &self.transport {
                t.mark_matched();
            }
            self.emit_phase();
        }
        let out = match self.negotiation.as_mut() {
            Some(neg) => neg.apply_remote_signal(env).await,
            None => return,
        };
        match out {
            Ok(envelopes) => {
                let negotiating = self
                    .negotiation
                    .as_ref()
                    .map(|n| n.state() == EngineState::Negotiating)
                    .unwrap_or(false);
                if negotiating
                    && self.session.phase() == SessionPhase::Matched
                    && self.session.connecting().is_ok()
                {
                    self.emit_phase();
                    self.emit(CallEvent::connection(ConnectionState::Negotiating));
                }
                self.send_envelopes(envelopes).await;
            }
            Err(CoreError::EngineClosed) => {}
            Err(e) => self.fail_call(e).await,
        }
    }

    fn handle_liveness(&mut self, liveness: Liveness) {
        let Some(neg) = self.negotiation.as_mut() else { return };
        if let Some(cs) = neg.on_liveness(liveness) {
            self.emit(CallEvent::connection(cs));
            if cs == ConnectionState::Connected && self.session.connected().is_ok() {
                self.emit_phase();
            }
        }
    }

    async fn send_envelopes(&self, envelopes: Vec<SignalEnvelope>) {
        let Some(t) = &self.transport else { return };
        for env in envelopes {
            if let Err(e) = t.send_signal(env).await {
                warn!("outbound signal dropped: {e}");
            }
        }
    }

    fn surface_error(&mut self, e: &CoreError) {
        self.session.last_error = Some(e.clone());
        self.emit(CallEvent::error(e));
    }

    async fn fail_call(&mut self, e: CoreError) {
        self.emit(CallEvent::error(&e));
        self.release_call_resources().await;
        self.session.failed(e);
        self.emit_phase();
    }

    async fn end_call_internal(&mut self, skip: bool) {
        self.release_call_resources().await;
        if skip {
            self.session.skipped();
        } else {
            self.session.ended();
        }
        self.emit_phase();
        self.emit(CallEvent::new(CallEventKind::ChatCleared));
    }

    async fn auth_expired(&mut self) {
        self.release_call_resources().await;
        self.session.reset_identity();
        self.session.last_error = Some(CoreError::AuthExpired);
        self.emit(CallEvent::error(&CoreError::AuthExpired));
        self.emit_phase();
    }

    /// Tears down everything belonging to the current call and bumps the
    /// epoch so in-flight results of the old call are discarded.
    async fn release_call_resources(&mut self) {
        self.epoch += 1;
        self.transport_gen += 1;
        if let Some(t) = self.transport.take() {
            t.close();
        }
        if let Some(mut n) = self.negotiation.take() {
            n.teardown().await;
        }
        self.chat.clear();
        self.match_polling = false;
        self.transport_mode = None;
    }
}

// ---- embedding entry points ----

struct RunningCore {
    shutdown_tx: watch::Sender<bool>,
    join: Option<thread::JoinHandle<()>>,
}

static REGISTRY: Mutex<Vec<(u64, RunningCore)>> = Mutex::new(Vec::new());

/// Starts a core on its own thread and runtime, for embeddings without a
/// tokio runtime of their own. Returns an opaque handle for `stop`.
pub fn start(cfg: CoreConfig) -> Result<u64> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .try_init()
        .ok();

    let handle = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let join = thread::spawn(move || {
        if let Err(e) = run_core(cfg, shutdown_rx) {
            error!("call core failed: {e:#}");
        }
    });

    let mut reg = REGISTRY.lock().unwrap();
    reg.push((handle, RunningCore { shutdown_tx, join: Some(join) }));
    Ok(handle)
}

pub fn stop(handle: u64) -> Result<()> {
    let running = {
        let mut reg = REGISTRY.lock().unwrap();
        let idx = reg
            .iter()
            .position(|(h, _)| *h == handle)
            .context("invalid handle")?;
        let (_, mut running) = reg.swap_remove(idx);
        let _ = running.shutdown_tx.send(true);
        // Join in background to avoid blocking the UI thread.
        running.join.take()
    };

    if let Some(j) = running {
        thread::spawn(move || {
            let _ = j.join();
        });
    }
    Ok(())
}

fn run_core(cfg: CoreConfig, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        let factory: Arc<dyn MediaSessionFactory> = Arc::new(RtcMediaFactory::new(
            cfg.ice_urls.clone().unwrap_or_default(),
            cfg.ice_username.clone(),
            cfg.ice_credential.clone(),
        ));
        let handle = spawn_core(cfg, factory)?;
        loop {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
            if *shutdown_rx.borrow() {
                break;
            }
        }
        handle.shutdown().await;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::test_support::FakeMediaFactory;
    use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::routing::{any, get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;

    #[derive(Default)]
    struct Backend {
        match_ready: AtomicBool,
        match_401: AtomicBool,
        skip_calls: AtomicU32,
        end_calls: AtomicU32,
        clear_calls: AtomicU32,
    }

    async fn ws_echo(mut socket: WebSocket) {
        let greeting = r#"{"type":"connection_established","message":null}"#;
        if socket.send(AxMessage::Text(greeting.into())).await.is_err() {
            return;
        }
        while let Some(Ok(msg)) = socket.recv().await {
            if let AxMessage::Text(t) = msg {
                if socket.send(AxMessage::Text(t)).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn spawn_backend(state: Arc<Backend>) -> String {
        let app = Router::new()
            .route(
                "/api/v1/register",
                post(|Json(body): Json<serde_json::Value>| async move {
                    Json(serde_json::json!({
                        "user": { "id": 1, "username": body["username"] },
                        "access_token": "a",
                        "refresh_token": "r",
                    }))
                }),
            )
            .route(
                "/api/token/refresh",
                post(|| async { axum::http::StatusCode::UNAUTHORIZED }),
            )
            .route(
                "/api/v1/call/create",
                post(|| async {
                    Json(serde_json::json!({ "id": "call-1", "participants": [] }))
                }),
            )
            .route(
                "/api/v1/call/find-match",
                post(|State(s): State<Arc<Backend>>| async move {
                    if s.match_401.load(Ordering::SeqCst) {
                        return Err(axum::http::StatusCode::UNAUTHORIZED);
                    }
                    if s.match_ready.load(Ordering::SeqCst) {
                        Ok(Json(serde_json::json!({
                            "matched": true,
                            "call": { "id": "call-1", "participants": [] },
                            "matched_user": "bob",
                            "match_type": "online_user",
                            "initiator": true,
                        })))
                    } else {
                        Ok(Json(serde_json::json!({ "matched": false })))
                    }
                }),
            )
            .route(
                "/api/v1/call/skip",
                post(|State(s): State<Arc<Backend>>| async move {
                    s.skip_calls.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({}))
                }),
            )
            .route(
                "/api/v1/call/end",
                post(|State(s): State<Arc<Backend>>| async move {
                    s.end_calls.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({}))
                }),
            )
            .route(
                "/api/v1/call/call-1/messages/clear",
                post(|State(s): State<Arc<Backend>>| async move {
                    s.clear_calls.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({}))
                }),
            )
            .route(
                "/api/v1/call/call-1/signal",
                get(|| async { Json(serde_json::json!([])) }),
            )
            .route(
                "/api/v1/call/call-1/messages",
                get(|| async { Json(serde_json::json!([])) }),
            )
            .route(
                "/ws/video_call/call-1/",
                any(|ws: WebSocketUpgrade| async move { ws.on_upgrade(ws_echo) }),
            )
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_cfg(base: String) -> CoreConfig {
        CoreConfig {
            api_base_url: base,
            poll_interval_secs: Some(1),
            failover_timeout_secs: Some(2),
            http_timeout_secs: Some(2),
            ..CoreConfig::default()
        }
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<CallEvent>,
        what: &str,
        f: impl Fn(&CallEventKind) -> bool,
    ) -> CallEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(ev) if f(&ev.kind) => return ev,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => panic!("event stream closed waiting for {what}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    async fn wait_for_phase(handle: &CallHandle, phase: SessionPhase) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if handle.snapshot().await.unwrap().phase == phase {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "never reached phase {phase:?}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn initiator_flow_reaches_connected_then_skip_is_idempotent() {
        let backend = Arc::new(Backend::default());
        let base = spawn_backend(backend.clone()).await;
        let factory = Arc::new(FakeMediaFactory::default());
        let probes = factory.probes.clone();
        let handle = spawn_core(test_cfg(base), factory).unwrap();
        let mut rx = handle.subscribe();

        handle.attach_media(LocalMedia::new(Vec::new())).await.unwrap();
        handle.register("alice").await.unwrap();
        handle.create_call().await.unwrap();
        assert_eq!(probes.lock().unwrap().len(), 1);
        assert_eq!(
            handle.snapshot().await.unwrap().phase,
            SessionPhase::CallCreated
        );

        backend.match_ready.store(true, Ordering::SeqCst);
        handle.find_match().await.unwrap();
        let ev = wait_for(&mut rx, "match", |k| {
            matches!(k, CallEventKind::MatchFound { .. })
        })
        .await;
        match ev.kind {
            CallEventKind::MatchFound { username, match_type } => {
                assert_eq!(username, "bob");
                assert_eq!(match_type.as_deref(), Some("online_user"));
            }
            _ => unreachable!(),
        }
        wait_for_phase(&handle, SessionPhase::Connecting).await;
        // The fake capability created one offer as initiator.
        assert_eq!(probes.lock().unwrap()[0].state.lock().unwrap().offers_created, 1);

        // Scripted connectivity drives the session to Connected.
        probes.lock().unwrap()[0]
            .liveness_tx
            .send(Liveness::Connected)
            .unwrap();
        wait_for(&mut rx, "connected", |k| {
            matches!(k, CallEventKind::Connection { state: "connected" })
        })
        .await;
        wait_for_phase(&handle, SessionPhase::Connected).await;

        assert_eq!(handle.skip().await.unwrap(), SkipOutcome::Skipped);
        let snap = handle.snapshot().await.unwrap();
        // Skip keeps identity and is immediately ready for the next call.
        assert_eq!(snap.phase, SessionPhase::Registered);
        assert_eq!(snap.username.as_deref(), Some("alice"));
        assert!(snap.call_id.is_none());
        assert!(probes.lock().unwrap()[0].state.lock().unwrap().closed);
        assert_eq!(backend.skip_calls.load(Ordering::SeqCst), 1);

        // Skipping with no call is a no-op, not an error.
        assert_eq!(handle.skip().await.unwrap(), SkipOutcome::Skipped);
        assert_eq!(backend.skip_calls.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn create_call_requires_registration_and_media() {
        let backend = Arc::new(Backend::default());
        let base = spawn_backend(backend).await;
        let handle = spawn_core(test_cfg(base), Arc::new(FakeMediaFactory::default())).unwrap();

        let err = handle.create_call().await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { op: "create_call", .. }));

        handle.register("alice").await.unwrap();
        let err = handle.create_call().await.unwrap_err();
        assert_eq!(err, CoreError::MediaRequired);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn skip_asks_for_confirmation_when_configured() {
        let backend = Arc::new(Backend::default());
        let base = spawn_backend(backend.clone()).await;
        let mut cfg = test_cfg(base);
        cfg.confirm_skip = Some(true);
        let handle = spawn_core(cfg, Arc::new(FakeMediaFactory::default())).unwrap();
        let mut rx = handle.subscribe();

        handle.attach_media(LocalMedia::new(Vec::new())).await.unwrap();
        handle.register("alice").await.unwrap();
        handle.create_call().await.unwrap();

        assert_eq!(handle.skip().await.unwrap(), SkipOutcome::ConfirmationRequired);
        wait_for(&mut rx, "confirmation", |k| {
            matches!(k, CallEventKind::ConfirmationRequired { action: ConfirmAction::Skip })
        })
        .await;
        assert_eq!(
            handle.snapshot().await.unwrap().phase,
            SessionPhase::CallCreated
        );
        assert_eq!(backend.skip_calls.load(Ordering::SeqCst), 0);

        assert_eq!(handle.skip_confirmed().await.unwrap(), SkipOutcome::Skipped);
        assert_eq!(handle.snapshot().await.unwrap().phase, SessionPhase::Registered);
        assert_eq!(backend.skip_calls.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn chat_appends_pending_then_confirms_on_echo() {
        let backend = Arc::new(Backend::default());
        let base = spawn_backend(backend.clone()).await;
        let factory = Arc::new(FakeMediaFactory::default());
        let probes = factory.probes.clone();
        let handle = spawn_core(test_cfg(base), factory).unwrap();
        let mut rx = handle.subscribe();

        handle.attach_media(LocalMedia::new(Vec::new())).await.unwrap();
        handle.register("alice").await.unwrap();
        handle.create_call().await.unwrap();

        // Chat requires a connected call.
        let err = handle.send_chat("too early").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { op: "send_chat", .. }));

        backend.match_ready.store(true, Ordering::SeqCst);
        handle.find_match().await.unwrap();
        wait_for_phase(&handle, SessionPhase::Connecting).await;
        probes.lock().unwrap()[0]
            .liveness_tx
            .send(Liveness::Connected)
            .unwrap();
        wait_for_phase(&handle, SessionPhase::Connected).await;

        let id = handle.send_chat("hello").await.unwrap();
        let history = handle.chat_history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].pending);

        let want = id.clone();
        wait_for(&mut rx, "chat confirmation", move |k| {
            matches!(k, CallEventKind::ChatConfirmed { id } if *id == want)
        })
        .await;
        let history = handle.chat_history().await.unwrap();
        assert!(!history[0].pending);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn auth_expiry_drops_identity() {
        let backend = Arc::new(Backend::default());
        backend.match_401.store(true, Ordering::SeqCst);
        let base = spawn_backend(backend).await;
        let handle = spawn_core(test_cfg(base), Arc::new(FakeMediaFactory::default())).unwrap();
        let mut rx = handle.subscribe();

        handle.attach_media(LocalMedia::new(Vec::new())).await.unwrap();
        handle.register("alice").await.unwrap();
        handle.create_call().await.unwrap();
        handle.find_match().await.unwrap();

        wait_for(&mut rx, "auth expiry", |k| {
            matches!(k, CallEventKind::Error { message } if message.contains("expired"))
        })
        .await;
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.phase, SessionPhase::Idle);
        assert!(snap.username.is_none());
        handle.shutdown().await;
    }
}
