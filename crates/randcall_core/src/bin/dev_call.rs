/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use randcall_core::config::CoreConfig;
use randcall_core::media::{LocalMedia, RtcMediaFactory};
use randcall_core::runtime::spawn_core;
use std::sync::Arc;
use tracing::info;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Headless dev client: registers, opens a call and looks for a match with a
/// silent audio track, printing every core event. Drive a second instance
/// against the same backend to exercise a full call.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let username =
        std::env::var("RANDCALL_USER").unwrap_or_else(|_| format!("dev-{}", std::process::id()));
    let base_url = std::env::var("RANDCALL_BASE_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());

    let cfg = CoreConfig { api_base_url: base_url, ..CoreConfig::default() };
    let factory = Arc::new(RtcMediaFactory::new(
        cfg.ice_urls.clone().unwrap_or_default(),
        cfg.ice_username.clone(),
        cfg.ice_credential.clone(),
    ));
    let handle = spawn_core(cfg, factory)?;
    let mut events = handle.subscribe();

    let track: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability { mime_type: MIME_TYPE_OPUS.to_owned(), ..Default::default() },
        "audio".to_owned(),
        "dev-call".to_owned(),
    ));
    handle.attach_media(LocalMedia::new(vec![track])).await?;

    handle.register(&username).await?;
    info!("registered as {username}");
    handle.create_call().await?;
    handle.find_match().await?;
    info!("looking for a match, ctrl-c to quit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = events.recv() => {
                match ev {
                    Ok(ev) => println!("{}", serde_json::to_string(&ev)?),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        info!("dropped {n} events");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    let _ = handle.end_call().await;
    handle.shutdown().await;
    Ok(())
}
