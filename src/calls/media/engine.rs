//! Capability interface of the WebRTC engine.
//!
//! Nothing here implements audio capture or peer connections; an embedding
//! application supplies a [`MediaEngine`] backed by its WebRTC stack.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::calls::error::MediaError;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Connection state of the peer connection, as mirrored to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IceState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Callback raised by a peer connection.
#[derive(Clone)]
pub enum PeerEvent {
    /// An inbound audio track arrived. May fire more than once per stream.
    Track(Arc<dyn RemoteAudioStream>),
    ConnectionState(ConnectionState),
    IceState(IceState),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Track(stream) => f.debug_tuple("Track").field(&stream.id()).finish(),
            Self::ConnectionState(state) => f.debug_tuple("ConnectionState").field(state).finish(),
            Self::IceState(state) => f.debug_tuple("IceState").field(state).finish(),
        }
    }
}

/// Microphone capture constraints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 48000,
            channel_count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
}

impl Default for PeerConnectionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            ice_candidate_pool_size: 10,
        }
    }
}

/// Inbound RTP statistics for the audio receiver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundAudioStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_lost: i64,
    /// Seconds.
    pub jitter: f64,
    /// 0.0 to 1.0.
    pub audio_level: Option<f64>,
}

/// One microphone capture. Each acquisition is a separate handle: stopping
/// it never affects another capture of the same device.
pub trait LocalAudioStream: Send + Sync {
    fn id(&self) -> &str;

    fn set_tracks_enabled(&self, enabled: bool);

    fn tracks_enabled(&self) -> bool;

    fn stop(&self);
}

pub trait RemoteAudioStream: Send + Sync {
    fn id(&self) -> &str;
}

#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Requests microphone access. Fails with `PermissionDenied` or
    /// `DeviceUnavailable`.
    async fn acquire(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Arc<dyn LocalAudioStream>, MediaError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlaybackError {
    /// Autoplay policy refused playback until a user gesture.
    #[error("playback blocked pending user interaction")]
    Blocked,

    #[error("playback failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play(&self, stream: Arc<dyn RemoteAudioStream>) -> Result<(), PlaybackError>;

    /// Detaches whatever stream is playing.
    async fn stop(&self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn add_local_stream(&self, stream: Arc<dyn LocalAudioStream>) -> Result<(), MediaError>;

    async fn create_offer(&self) -> Result<String, MediaError>;

    async fn create_answer(&self) -> Result<String, MediaError>;

    async fn set_local_description(&self, kind: SdpType, sdp: &str) -> Result<(), MediaError>;

    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), MediaError>;

    async fn stats(&self) -> Result<Option<InboundAudioStats>, MediaError> {
        Ok(None)
    }

    async fn close(&self);
}

pub trait MediaEngine: Send + Sync {
    /// Creates a peer connection whose callbacks are delivered on `events`.
    fn create_peer_connection(
        &self,
        config: &PeerConnectionConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;

    fn audio_capture(&self) -> Arc<dyn AudioCapture>;

    fn audio_output(&self) -> Arc<dyn AudioOutput>;
}
