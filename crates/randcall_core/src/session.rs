/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use randcall_protocol::{CallInfo, User};
use serde::Serialize;

use crate::chat::ChatEntry;
use crate::error::CoreError;

/// Lifecycle phase of the one active session. Every phase change flows
/// through a validated transition so intents arriving out of order fail
/// loudly instead of corrupting state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Registered,
    CallCreated,
    LookingForMatch,
    Matched,
    Connecting,
    Connected,
    Ended,
    Failed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Registered => "registered",
            SessionPhase::CallCreated => "call_created",
            SessionPhase::LookingForMatch => "looking_for_match",
            SessionPhase::Matched => "matched",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Connected => "connected",
            SessionPhase::Ended => "ended",
            SessionPhase::Failed => "failed",
        }
    }

    /// Phases in which a call exists and teardown has something to do.
    pub fn in_call(&self) -> bool {
        matches!(
            self,
            SessionPhase::CallCreated
                | SessionPhase::LookingForMatch
                | SessionPhase::Matched
                | SessionPhase::Connecting
                | SessionPhase::Connected
        )
    }
}

/// Read-only copy of session state handed to the UI on request.
#[derive(Clone, Debug, Serialize)]
pub struct CallSnapshot {
    pub phase: SessionPhase,
    pub username: Option<String>,
    pub call_id: Option<String>,
    pub peer_username: Option<String>,
    pub match_type: Option<String>,
    pub initiator: Option<bool>,
    /// "push" or "poll" once the signaling channel is open.
    pub transport_mode: Option<&'static str>,
    /// Connection state as reported by the live negotiation engine.
    pub connection: Option<&'static str>,
    /// Chat history of the active call, empty outside one.
    pub messages: Vec<ChatEntry>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct SessionState {
    phase: Option<SessionPhase>,
    pub user: Option<User>,
    pub call: Option<CallInfo>,
    pub peer_username: Option<String>,
    pub match_type: Option<String>,
    pub initiator: Option<bool>,
    pub last_error: Option<CoreError>,
}

impl SessionState {
    pub fn new() -> Self {
        Self { phase: Some(SessionPhase::Idle), ..Self::default() }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.unwrap_or(SessionPhase::Idle)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call.as_ref().map(|c| c.id.as_str())
    }

    pub fn username(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.username.as_str())
    }

    fn transition(
        &mut self,
        op: &'static str,
        allowed: &[SessionPhase],
        next: SessionPhase,
    ) -> Result<(), CoreError> {
        let current = self.phase();
        if !allowed.contains(&current) {
            return Err(CoreError::InvalidTransition { op, phase: current.as_str() });
        }
        self.phase = Some(next);
        Ok(())
    }

    pub fn registered(&mut self, user: User) -> Result<(), CoreError> {
        self.transition(
            "register",
            &[SessionPhase::Idle, SessionPhase::Ended, SessionPhase::Failed],
            SessionPhase::Registered,
        )?;
        self.user = Some(user);
        Ok(())
    }

    pub fn call_created(&mut self, call: CallInfo) -> Result<(), CoreError> {
        self.transition("create_call", &[SessionPhase::Registered], SessionPhase::CallCreated)?;
        self.call = Some(call);
        Ok(())
    }

    pub fn looking_for_match(&mut self) -> Result<(), CoreError> {
        self.transition(
            "find_match",
            &[SessionPhase::CallCreated, SessionPhase::LookingForMatch],
            SessionPhase::LookingForMatch,
        )
    }

    pub fn matched(
        &mut self,
        peer_username: String,
        match_type: Option<String>,
        initiator: bool,
    ) -> Result<(), CoreError> {
        self.transition(
            "match",
            &[
                SessionPhase::CallCreated,
                SessionPhase::LookingForMatch,
                // A remote offer can arrive before our own find-match result.
                SessionPhase::Registered,
            ],
            SessionPhase::Matched,
        )?;
        self.peer_username = Some(peer_username);
        self.match_type = match_type;
        self.initiator = Some(initiator);
        Ok(())
    }

    /// Match inferred from an inbound offer before our own matchmaking
    /// result arrived. Peer identity stays unknown until it does.
    pub fn matched_implicit(&mut self) -> Result<(), CoreError> {
        self.transition(
            "match",
            &[SessionPhase::CallCreated, SessionPhase::LookingForMatch, SessionPhase::Registered],
            SessionPhase::Matched,
        )
    }

    pub fn connecting(&mut self) -> Result<(), CoreError> {
        self.transition("connect", &[SessionPhase::Matched], SessionPhase::Connecting)
    }

    pub fn connected(&mut self) -> Result<(), CoreError> {
        self.transition(
            "connected",
            &[SessionPhase::Connecting, SessionPhase::Matched],
            SessionPhase::Connected,
        )
    }

    /// Skip: reset the call but not the identity; the session is immediately
    /// ready to create the next call.
    pub fn skipped(&mut self) {
        if self.user.is_some() {
            self.phase = Some(SessionPhase::Registered);
        } else {
            self.phase = Some(SessionPhase::Idle);
        }
        self.clear_call();
    }

    /// Terminal end of the session's call activity. Identity survives; a new
    /// `register()` (idempotent) reopens the session.
    pub fn ended(&mut self) {
        if self.phase() != SessionPhase::Failed {
            self.phase = Some(SessionPhase::Ended);
        }
        self.clear_call();
    }

    pub fn failed(&mut self, err: CoreError) {
        self.last_error = Some(err);
        self.phase = Some(SessionPhase::Failed);
        self.clear_call();
    }

    /// Drops identity as well, after credential expiry.
    pub fn reset_identity(&mut self) {
        self.user = None;
        self.phase = Some(SessionPhase::Idle);
        self.clear_call();
    }

    fn clear_call(&mut self) {
        self.call = None;
        self.peer_username = None;
        self.match_type = None;
        self.initiator = None;
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            phase: self.phase(),
            username: self.username().map(str::to_string),
            call_id: self.call_id().map(str::to_string),
            peer_username: self.peer_username.clone(),
            match_type: self.match_type.clone(),
            initiator: self.initiator,
            transport_mode: None,
            connection: None,
            messages: Vec::new(),
            last_error: self.last_error.as_ref().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User { id: 7, username: "alice".into() }
    }

    fn call() -> CallInfo {
        CallInfo { id: "call-1".into(), participants: vec!["alice".into()], match_type: None }
    }

    #[test]
    fn happy_path_reaches_connected() {
        let mut s = SessionState::new();
        s.registered(user()).unwrap();
        s.call_created(call()).unwrap();
        s.looking_for_match().unwrap();
        s.matched("bob".into(), Some("online_user".into()), true).unwrap();
        s.connecting().unwrap();
        s.connected().unwrap();
        assert_eq!(s.phase(), SessionPhase::Connected);
        let snap = s.snapshot();
        assert_eq!(snap.peer_username.as_deref(), Some("bob"));
        assert_eq!(snap.initiator, Some(true));
    }

    #[test]
    fn create_call_requires_registration() {
        let mut s = SessionState::new();
        let err = s.call_created(call()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { op: "create_call", .. }));
        assert_eq!(s.phase(), SessionPhase::Idle);
    }

    #[test]
    fn skip_returns_to_registered_with_identity() {
        let mut s = SessionState::new();
        s.registered(user()).unwrap();
        s.call_created(call()).unwrap();
        s.skipped();
        assert_eq!(s.phase(), SessionPhase::Registered);
        assert!(s.call_id().is_none());
        assert_eq!(s.username(), Some("alice"));
        // Ready for the next call without touching identity.
        s.call_created(call()).unwrap();
        assert_eq!(s.phase(), SessionPhase::CallCreated);
    }

    #[test]
    fn end_is_terminal_until_reregistration() {
        let mut s = SessionState::new();
        s.registered(user()).unwrap();
        s.call_created(call()).unwrap();
        s.ended();
        assert_eq!(s.phase(), SessionPhase::Ended);
        assert_eq!(s.username(), Some("alice"));
        let err = s.call_created(call()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        s.registered(user()).unwrap();
        s.call_created(call()).unwrap();
        assert_eq!(s.phase(), SessionPhase::CallCreated);
    }

    #[test]
    fn reset_identity_returns_to_idle() {
        let mut s = SessionState::new();
        s.registered(user()).unwrap();
        s.reset_identity();
        assert_eq!(s.phase(), SessionPhase::Idle);
        assert!(s.username().is_none());
    }

    #[test]
    fn failure_records_error_and_clears_call() {
        let mut s = SessionState::new();
        s.registered(user()).unwrap();
        s.call_created(call()).unwrap();
        s.failed(CoreError::TransportError("push and poll both dead".into()));
        assert_eq!(s.phase(), SessionPhase::Failed);
        assert!(s.snapshot().last_error.is_some());
        assert!(s.call_id().is_none());
        // Re-registration recovers from failure.
        s.registered(user()).unwrap();
        assert_eq!(s.phase(), SessionPhase::Registered);
    }
}
