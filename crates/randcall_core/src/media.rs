/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use randcall_protocol::{IceCandidate, Sdp};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

/// Caller-acquired audio/video handle. The core never opens the camera or
/// microphone itself; the capture collaborator hands tracks in together with
/// an optional release hook that stops the underlying devices.
pub struct LocalMedia {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self { tracks, release: None }
    }

    pub fn with_release(
        tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
        release: Box<dyn FnOnce() + Send + Sync>,
    ) -> Self {
        Self {
            tracks,
            release: Some(release),
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    /// Stops the capture devices. Idempotent; also runs on drop so camera and
    /// microphone are never leaked past teardown or process exit.
    pub fn release(&mut self) {
        if let Some(hook) = self.release.take() {
            hook();
        }
        self.tracks.clear();
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia").field("tracks", &self.tracks.len()).finish()
    }
}

/// Connectivity as reported by the underlying capability. Surfaced upward
/// unmodified; the engine never infers liveness itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Seam between the negotiation engine and the peer-connection machinery.
/// The production implementation wraps an `RTCPeerConnection`; tests script
/// a fake.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()>;
    async fn create_offer(&self) -> Result<Sdp>;
    async fn create_answer(&self) -> Result<Sdp>;
    async fn set_remote_description(&self, sdp: Sdp) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    fn liveness(&self) -> watch::Receiver<Liveness>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    /// Builds one capability instance for one call. Locally gathered ICE
    /// candidates are delivered on `candidate_tx` as they trickle in.
    async fn create(&self, candidate_tx: mpsc::Sender<IceCandidate>) -> Result<Box<dyn MediaSession>>;
}

/// Production capability backed by the `webrtc` crate.
pub struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    liveness_rx: watch::Receiver<Liveness>,
}

fn liveness_from_state(state: RTCPeerConnectionState) -> Liveness {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => Liveness::New,
        RTCPeerConnectionState::Connecting => Liveness::Connecting,
        RTCPeerConnectionState::Connected => Liveness::Connected,
        RTCPeerConnectionState::Disconnected => Liveness::Disconnected,
        RTCPeerConnectionState::Failed => Liveness::Failed,
        RTCPeerConnectionState::Closed => Liveness::Closed,
    }
}

impl RtcSession {
    pub async fn connect(
        ice_servers: Vec<RTCIceServer>,
        candidate_tx: mpsc::Sender<IceCandidate>,
    ) -> Result<Self> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .context("new peer connection")?,
        );

        let (liveness_tx, liveness_rx) = watch::channel(Liveness::New);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = liveness_tx.send(liveness_from_state(state));
            Box::pin(async {})
        }));

        pc.on_ice_candidate(Box::new(move |cand| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(cand) = cand else { return };
                match cand.to_json() {
                    Ok(init) => {
                        let out = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        if candidate_tx.send(out).await.is_err() {
                            debug!("dropping local candidate: engine gone");
                        }
                    }
                    Err(e) => warn!("candidate to_json failed: {e:#}"),
                }
            })
        }));

        Ok(Self { pc, liveness_rx })
    }
}

fn to_rtc_description(sdp: Sdp) -> Result<RTCSessionDescription> {
    match sdp.sdp_type.as_str() {
        "offer" => RTCSessionDescription::offer(sdp.sdp).context("parse offer sdp"),
        "answer" => RTCSessionDescription::answer(sdp.sdp).context("parse answer sdp"),
        other => anyhow::bail!("unsupported sdp type: {other}"),
    }
}

#[async_trait]
impl MediaSession for RtcSession {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        for track in media.tracks() {
            self.pc
                .add_track(track.clone())
                .await
                .context("add local track")?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<Sdp> {
        let offer = self.pc.create_offer(None).await.context("create offer")?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .context("set local offer")?;
        Ok(Sdp {
            sdp_type: offer.sdp_type.to_string(),
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<Sdp> {
        let answer = self.pc.create_answer(None).await.context("create answer")?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .context("set local answer")?;
        Ok(Sdp {
            sdp_type: answer.sdp_type.to_string(),
            sdp: answer.sdp,
        })
    }

    async fn set_remote_description(&self, sdp: Sdp) -> Result<()> {
        let desc = to_rtc_description(sdp)?;
        self.pc
            .set_remote_description(desc)
            .await
            .context("set remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .context("add ice candidate")
    }

    fn liveness(&self) -> watch::Receiver<Liveness> {
        self.liveness_rx.clone()
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.context("close peer connection")
    }
}

/// Default factory: one fresh `RtcSession` per call.
pub struct RtcMediaFactory {
    ice_urls: Vec<String>,
    ice_username: Option<String>,
    ice_credential: Option<String>,
}

impl RtcMediaFactory {
    pub fn new(
        ice_urls: Vec<String>,
        ice_username: Option<String>,
        ice_credential: Option<String>,
    ) -> Self {
        Self {
            ice_urls,
            ice_username,
            ice_credential,
        }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_urls.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_urls.clone(),
            username: self.ice_username.clone().unwrap_or_default(),
            credential: self.ice_credential.clone().unwrap_or_default(),
            ..Default::default()
        }]
    }
}

#[async_trait]
impl MediaSessionFactory for RtcMediaFactory {
    async fn create(&self, candidate_tx: mpsc::Sender<IceCandidate>) -> Result<Box<dyn MediaSession>> {
        let session = RtcSession::connect(self.ice_servers(), candidate_tx).await?;
        Ok(Box::new(session))
    }
}
