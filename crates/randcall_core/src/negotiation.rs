/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use randcall_protocol::{IceCandidate, Sdp, SignalEnvelope};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::media::{Liveness, LocalMedia, MediaSession};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    AwaitingLocalMedia,
    Idle,
    Offering,
    Answering,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::AwaitingLocalMedia => "awaiting-local-media",
            EngineState::Idle => "idle",
            EngineState::Offering => "offering",
            EngineState::Answering => "answering",
            EngineState::Negotiating => "negotiating",
            EngineState::Connected => "connected",
            EngineState::Disconnected => "disconnected",
            EngineState::Closed => "closed",
        }
    }
}

/// Connection state surfaced read-only to the session machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Per-call offer/answer/ICE state machine. Drives a caller-supplied media
/// capability; never acquires media and never infers connectivity. Exactly
/// one engine instance is live per call.
pub struct Negotiation {
    state: EngineState,
    role: Option<Role>,
    session: Box<dyn MediaSession>,
    media: Option<LocalMedia>,
    media_bound: bool,
    have_remote_description: bool,
    answered: bool,
    buffered_candidates: VecDeque<IceCandidate>,
    seen_candidates: HashSet<String>,
    max_buffered: usize,
}

impl Negotiation {
    pub fn new(session: Box<dyn MediaSession>, max_buffered: usize) -> Self {
        Self {
            state: EngineState::AwaitingLocalMedia,
            role: None,
            session,
            media: None,
            media_bound: false,
            have_remote_description: false,
            answered: false,
            buffered_candidates: VecDeque::new(),
            seen_candidates: HashSet::new(),
            max_buffered: max_buffered.max(1),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.state {
            EngineState::AwaitingLocalMedia | EngineState::Idle => ConnectionState::New,
            EngineState::Offering | EngineState::Answering | EngineState::Negotiating => {
                ConnectionState::Negotiating
            }
            EngineState::Connected => ConnectionState::Connected,
            EngineState::Disconnected => ConnectionState::Disconnected,
            EngineState::Closed => ConnectionState::Closed,
        }
    }

    /// Binds the caller-acquired media handle. The engine owns it from here
    /// until teardown, where every track is released.
    pub fn attach_local_media(&mut self, media: LocalMedia) -> Result<(), CoreError> {
        if self.state == EngineState::Closed {
            return Err(CoreError::EngineClosed);
        }
        self.media = Some(media);
        if self.state == EngineState::AwaitingLocalMedia {
            self.state = EngineState::Idle;
        }
        Ok(())
    }

    async fn bind_media_once(&mut self) -> Result<(), CoreError> {
        if self.media_bound {
            return Ok(());
        }
        let media = self
            .media
            .as_ref()
            .ok_or_else(|| CoreError::MediaUnavailable("no local media attached".into()))?;
        self.session
            .add_local_media(media)
            .await
            .map_err(|e| CoreError::Negotiation(format!("bind local media: {e:#}")))?;
        self.media_bound = true;
        Ok(())
    }

    /// `Idle -> Offering -> Negotiating`; returns the offer envelope to emit.
    pub async fn start_as_initiator(&mut self) -> Result<Vec<SignalEnvelope>, CoreError> {
        if self.state == EngineState::Closed {
            return Err(CoreError::EngineClosed);
        }
        if self.state != EngineState::Idle {
            return Err(CoreError::InvalidTransition {
                op: "start_as_initiator",
                phase: self.state.as_str(),
            });
        }
        self.role = Some(Role::Initiator);
        self.state = EngineState::Offering;
        self.bind_media_once().await?;
        let offer = self
            .session
            .create_offer()
            .await
            .map_err(|e| self.negotiation_failure("create offer", e))?;
        self.state = EngineState::Negotiating;
        Ok(vec![SignalEnvelope::Offer(offer)])
    }

    /// `Idle -> Answering`; the engine then waits for the inbound offer.
    pub fn start_as_responder(&mut self) -> Result<(), CoreError> {
        if self.state == EngineState::Closed {
            return Err(CoreError::EngineClosed);
        }
        if self.state != EngineState::Idle {
            return Err(CoreError::InvalidTransition {
                op: "start_as_responder",
                phase: self.state.as_str(),
            });
        }
        self.role = Some(Role::Responder);
        self.state = EngineState::Answering;
        Ok(())
    }

    /// Applies one remote envelope; returns any envelopes to emit in reply.
    /// Duplicate-tolerant: reapplying a seen candidate or answer is a no-op.
    pub async fn apply_remote_signal(
        &mut self,
        envelope: SignalEnvelope,
    ) -> Result<Vec<SignalEnvelope>, CoreError> {
        if self.state == EngineState::Closed {
            return Err(CoreError::EngineClosed);
        }
        match envelope {
            SignalEnvelope::Offer(sdp) => self.apply_offer(sdp).await,
            SignalEnvelope::Answer(sdp) => self.apply_answer(sdp).await,
            SignalEnvelope::IceCandidate(c) => {
                self.apply_candidate(c).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn apply_offer(&mut self, sdp: Sdp) -> Result<Vec<SignalEnvelope>, CoreError> {
        match self.state {
            EngineState::Idle | EngineState::Answering => {}
            EngineState::Negotiating | EngineState::Connected => {
                // Glare: both sides emitted an offer. The initiator's offer
                // always wins; the responder takes the late offer as
                // authoritative and re-answers.
                if self.role == Some(Role::Initiator) {
                    debug!("glare: discarding remote offer, local side is initiator");
                    return Ok(Vec::new());
                }
                warn!("glare: responder applying last offer");
            }
            other => {
                warn!(state = other.as_str(), "dropping offer in invalid state");
                return Ok(Vec::new());
            }
        }
        if self.role.is_none() {
            // Offer arrived before any explicit start; answer it.
            self.role = Some(Role::Responder);
        }
        self.bind_media_once().await?;
        self.session
            .set_remote_description(sdp)
            .await
            .map_err(|e| self.negotiation_failure("apply remote offer", e))?;
        self.have_remote_description = true;
        self.flush_buffered_candidates().await;
        let answer = self
            .session
            .create_answer()
            .await
            .map_err(|e| self.negotiation_failure("create answer", e))?;
        self.state = EngineState::Negotiating;
        Ok(vec![SignalEnvelope::Answer(answer)])
    }

    async fn apply_answer(&mut self, sdp: Sdp) -> Result<Vec<SignalEnvelope>, CoreError> {
        if self.state != EngineState::Negotiating {
            warn!(state = self.state.as_str(), "dropping answer in invalid state");
            return Ok(Vec::new());
        }
        if self.answered {
            debug!("duplicate answer ignored");
            return Ok(Vec::new());
        }
        self.session
            .set_remote_description(sdp)
            .await
            .map_err(|e| self.negotiation_failure("apply remote answer", e))?;
        self.answered = true;
        self.have_remote_description = true;
        self.flush_buffered_candidates().await;
        Ok(Vec::new())
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> Result<(), CoreError> {
        match self.state {
            EngineState::Answering
            | EngineState::Negotiating
            | EngineState::Connected => {}
            other => {
                debug!(state = other.as_str(), "dropping candidate in invalid state");
                return Ok(());
            }
        }
        // Idempotent application: transport fallback can retransmit.
        if !self.seen_candidates.insert(candidate.candidate.clone()) {
            debug!("duplicate candidate ignored");
            return Ok(());
        }
        if !self.have_remote_description {
            if self.buffered_candidates.len() >= self.max_buffered {
                let dropped = self.buffered_candidates.pop_front();
                warn!(
                    "candidate buffer full, dropping oldest: {:?}",
                    dropped.map(|c| c.candidate)
                );
            }
            self.buffered_candidates.push_back(candidate);
            return Ok(());
        }
        self.session
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| self.negotiation_failure("add candidate", e))?;
        Ok(())
    }

    async fn flush_buffered_candidates(&mut self) {
        while let Some(c) = self.buffered_candidates.pop_front() {
            if let Err(e) = self.session.add_ice_candidate(c).await {
                warn!("buffered candidate rejected: {e:#}");
            }
        }
    }

    /// Maps a capability liveness change onto the engine state and reports
    /// whether the public connection state changed.
    pub fn on_liveness(&mut self, liveness: Liveness) -> Option<ConnectionState> {
        if self.state == EngineState::Closed {
            return None;
        }
        let next = match liveness {
            Liveness::Connected => EngineState::Connected,
            Liveness::Disconnected | Liveness::Failed => EngineState::Disconnected,
            Liveness::Closed => EngineState::Closed,
            Liveness::New | Liveness::Connecting => return None,
        };
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(self.connection_state())
    }

    pub fn liveness_watch(&self) -> tokio::sync::watch::Receiver<Liveness> {
        self.session.liveness()
    }

    /// `-> Closed` from any state. Releases the capability and every local
    /// media track. Idempotent.
    pub async fn teardown(&mut self) {
        if self.state == EngineState::Closed {
            return;
        }
        self.state = EngineState::Closed;
        if let Err(e) = self.session.close().await {
            warn!("capability close failed: {e:#}");
        }
        if let Some(mut media) = self.media.take() {
            media.release();
        }
        self.buffered_candidates.clear();
    }

    fn negotiation_failure(&mut self, what: &str, e: anyhow::Error) -> CoreError {
        self.state = EngineState::Disconnected;
        CoreError::Negotiation(format!("{what}: {e:#}"))
    }
}
