//! Media plumbing for a call: capability traits implemented by the host's
//! WebRTC engine, and the per-call [`MediaSession`] built on them.

pub mod engine;
mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use engine::{
    AudioCapture, AudioConstraints, AudioOutput, ConnectionState, IceServer, IceState,
    InboundAudioStats, LocalAudioStream, MediaEngine, PeerConnection, PeerConnectionConfig,
    PeerEvent, PlaybackError, RemoteAudioStream, SdpType,
};
pub use session::{
    LocalAudioCheck, MediaSession, MediaSessionConfig, PlaybackRetry, check_local_audio,
};
