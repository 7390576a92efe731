//! Media session for one call.

use callcore::sdp::{CodecPreferences, SdpRole, rewrite_sdp};
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::engine::{
    AudioConstraints, ConnectionState, IceState, InboundAudioStats, LocalAudioStream,
    MediaEngine, PeerConnection, PeerConnectionConfig, PeerEvent, PlaybackError,
    RemoteAudioStream, SdpType,
};
use crate::calls::error::MediaError;

/// Bounded retry for remote playback refused by autoplay policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlaybackRetry {
    pub max_attempts: u32,
    /// Delay before the second attempt; grows linearly.
    pub backoff_ms: u64,
}

impl Default for PlaybackRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaSessionConfig {
    pub peer: PeerConnectionConfig,
    pub codecs: CodecPreferences,
    pub playback: PlaybackRetry,
}

/// Result of a microphone check made through [`check_local_audio`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAudioCheck {
    pub stream_id: String,
    pub tracks_enabled: bool,
}

/// Opens a separate capture, inspects it and stops it again. A call in
/// progress keeps its own capture handle, which this never touches.
pub async fn check_local_audio(
    engine: &dyn MediaEngine,
    constraints: &AudioConstraints,
) -> Result<LocalAudioCheck, MediaError> {
    let stream = engine.audio_capture().acquire(constraints).await?;
    let check = LocalAudioCheck {
        stream_id: stream.id().to_string(),
        tracks_enabled: stream.tracks_enabled(),
    };
    stream.stop();
    info!(target: "Call/Media", "Local audio check passed ({})", check.stream_id);
    Ok(check)
}

/// Everything the session owns. Only reachable through [`MediaSession`].
#[derive(Default)]
struct MediaSessionHandle {
    local: Option<Arc<dyn LocalAudioStream>>,
    peer: Option<Arc<dyn PeerConnection>>,
    remote: Option<Arc<dyn RemoteAudioStream>>,
    muted: bool,
    connection_state: ConnectionState,
    ice_state: IceState,
}

/// Owns the local capture, the peer connection and the remote stream of a
/// single call.
///
/// Once closed, every operation fails with [`MediaError::Closed`] and
/// anything acquired by an operation that was already in flight is
/// released immediately.
pub struct MediaSession {
    engine: Arc<dyn MediaEngine>,
    config: MediaSessionConfig,
    /// Handed to the peer connection when it is created.
    events: mpsc::UnboundedSender<PeerEvent>,
    handle: Mutex<MediaSessionHandle>,
    closed: AtomicBool,
}

impl MediaSession {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        config: MediaSessionConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            engine,
            config,
            events,
            handle: Mutex::new(MediaSessionHandle::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MediaSessionHandle> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }

    pub async fn acquire_local_audio(&self, constraints: &AudioConstraints) -> Result<(), MediaError> {
        self.ensure_open()?;
        let stream = self.engine.audio_capture().acquire(constraints).await?;

        let previous = {
            let mut handle = self.lock();
            if self.is_closed() {
                None
            } else {
                stream.set_tracks_enabled(!handle.muted);
                Some(handle.local.replace(stream.clone()))
            }
        };

        match previous {
            None => {
                debug!(target: "Call/Media", "Session closed during capture, releasing {}", stream.id());
                stream.stop();
                Err(MediaError::Closed)
            }
            Some(previous) => {
                if let Some(previous) = previous {
                    previous.stop();
                }
                info!(target: "Call/Media", "Local audio acquired ({})", stream.id());
                Ok(())
            }
        }
    }

    /// Returns the peer connection, creating it on first use.
    fn peer_connection(&self) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let mut handle = self.lock();
        if let Some(peer) = &handle.peer {
            return Ok(peer.clone());
        }
        let local = handle.local.clone().ok_or(MediaError::NoLocalAudio)?;
        let peer = self
            .engine
            .create_peer_connection(&self.config.peer, self.events.clone())?;
        peer.add_local_stream(local)?;
        handle.peer = Some(peer.clone());
        Ok(peer)
    }

    pub async fn create_offer(&self) -> Result<String, MediaError> {
        self.ensure_open()?;
        let peer = self.peer_connection()?;
        let raw = peer.create_offer().await?;
        let sdp = rewrite_sdp(&raw, &self.config.codecs, SdpRole::Offer);
        peer.set_local_description(SdpType::Offer, &sdp).await?;
        self.ensure_open()?;
        Ok(sdp)
    }

    pub async fn create_answer(&self, remote_offer: &str) -> Result<String, MediaError> {
        self.ensure_open()?;
        let peer = self.peer_connection()?;
        peer.set_remote_description(SdpType::Offer, remote_offer)
            .await?;
        let raw = peer.create_answer().await?;
        let sdp = rewrite_sdp(&raw, &self.config.codecs, SdpRole::Answer);
        peer.set_local_description(SdpType::Answer, &sdp).await?;
        self.ensure_open()?;
        Ok(sdp)
    }

    pub async fn apply_remote_answer(&self, answer: &str) -> Result<(), MediaError> {
        self.ensure_open()?;
        let peer = self
            .lock()
            .peer
            .clone()
            .ok_or_else(|| MediaError::Negotiation("no local offer to answer".into()))?;
        peer.set_remote_description(SdpType::Answer, answer).await
    }

    /// Makes `stream` the active remote stream. Returns `false` when it
    /// already was, or when the session is closed.
    pub fn attach_remote_stream(&self, stream: Arc<dyn RemoteAudioStream>) -> bool {
        let mut handle = self.lock();
        if self.is_closed() {
            return false;
        }
        if handle.remote.as_ref().is_some_and(|r| r.id() == stream.id()) {
            return false;
        }
        debug!(target: "Call/Media", "Remote stream attached ({})", stream.id());
        handle.remote = Some(stream);
        true
    }

    /// Enables or disables every local track. Applies to captures made
    /// later as well.
    pub fn set_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.ensure_open()?;
        let mut handle = self.lock();
        handle.muted = muted;
        if let Some(local) = &handle.local {
            local.set_tracks_enabled(!muted);
        }
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        self.lock().muted
    }

    /// Mirrors connection and ICE state from a peer callback.
    pub fn observe(&self, event: &PeerEvent) {
        let mut handle = self.lock();
        match event {
            PeerEvent::ConnectionState(state) => handle.connection_state = *state,
            PeerEvent::IceState(state) => handle.ice_state = *state,
            PeerEvent::Track(_) => {}
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().connection_state
    }

    pub fn ice_state(&self) -> IceState {
        self.lock().ice_state
    }

    pub fn local_stream(&self) -> Option<Arc<dyn LocalAudioStream>> {
        self.lock().local.clone()
    }

    pub fn remote_stream(&self) -> Option<Arc<dyn RemoteAudioStream>> {
        self.lock().remote.clone()
    }

    pub async fn stats(&self) -> Result<Option<InboundAudioStats>, MediaError> {
        self.ensure_open()?;
        let Some(peer) = self.lock().peer.clone() else {
            return Ok(None);
        };
        peer.stats().await
    }

    /// Plays the active remote stream, retrying while autoplay is blocked.
    pub async fn play_remote(&self) -> Result<(), PlaybackError> {
        let Some(stream) = self.remote_stream() else {
            return Ok(());
        };
        let output = self.engine.audio_output();
        let retry = &self.config.playback;

        let mut attempt = 1;
        loop {
            if self.is_closed() {
                return Ok(());
            }
            match output.play(stream.clone()).await {
                Ok(()) => return Ok(()),
                Err(PlaybackError::Blocked) if attempt < retry.max_attempts => {
                    debug!(target: "Call/Media", "Playback blocked, retry {attempt}/{}", retry.max_attempts);
                    tokio::time::sleep(Duration::from_millis(retry.backoff_ms * u64::from(attempt)))
                        .await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(target: "Call/Media", "Remote playback failed: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// Stops local capture, closes the peer connection and detaches the
    /// remote stream. Returns `false` if the session was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let (local, peer, remote) = {
            let mut handle = self.lock();
            handle.connection_state = ConnectionState::Disconnected;
            (handle.local.take(), handle.peer.take(), handle.remote.take())
        };

        if let Some(local) = local {
            local.stop();
        }
        if let Some(peer) = peer {
            peer.close().await;
        }
        if remote.is_some() {
            self.engine.audio_output().stop().await;
        }
        info!(target: "Call/Media", "Media session closed");
        true
    }
}
