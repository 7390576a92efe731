//! Call-related error types.

use callcore::{CallError, CallState};
use thiserror::Error;

use super::media::PlaybackError;

/// Failure of a user command issued through a [`CallHandle`](super::CallHandle).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("cannot {command} while the call is {state}")]
    InvalidState {
        command: &'static str,
        state: CallState,
    },

    #[error("remote party must not be empty")]
    InvalidRemoteParty,

    #[error("call coordinator is not running")]
    CoordinatorStopped,

    #[error(transparent)]
    Media(MediaError),

    #[error(transparent)]
    Playback(PlaybackError),
}

impl CommandError {
    pub fn to_call_error(&self) -> CallError {
        match self {
            Self::InvalidState { command, state } => CallError::invalid_state(command, state),
            Self::InvalidRemoteParty => CallError::invalid_state("dial", "missing a number"),
            Self::CoordinatorStopped => CallError::transport_disconnected(self.to_string()),
            Self::Media(e) => e.to_call_error(),
            Self::Playback(e) => CallError::device_unavailable(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MediaError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("local audio must be acquired before negotiating")]
    NoLocalAudio,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("media session is closed")]
    Closed,

    #[error("media engine error: {0}")]
    Engine(String),
}

impl MediaError {
    pub fn to_call_error(&self) -> CallError {
        match self {
            Self::PermissionDenied(detail) => CallError::permission_denied(detail.as_str()),
            Self::DeviceUnavailable(detail) => CallError::device_unavailable(detail.as_str()),
            Self::NoLocalAudio | Self::Negotiation(_) | Self::Closed | Self::Engine(_) => {
                CallError::negotiation_failed(self.to_string())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling transport already connected")]
    AlreadyConnected,

    #[error("signaling transport is closed")]
    Closed,

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransportError {
    /// Connection-level failures are reported as disconnects; everything
    /// else goes through the classifier so status codes are recognized.
    pub fn to_call_error(&self) -> CallError {
        match self {
            Self::AlreadyConnected | Self::Closed | Self::Connect(_) => {
                CallError::transport_disconnected(self.to_string())
            }
            Self::Http { status, body } => callcore::classify(body, Some(*status)),
            Self::Decode(_) | Self::Unsupported(_) | Self::Other(_) => {
                callcore::classify(&self.to_string(), None)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recorder failed to start: {0}")]
    Start(String),

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error("upload endpoint rejected the recording")]
    Rejected,

    #[error("upload failed: {0}")]
    Upload(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore::ErrorCategory;

    #[test]
    fn test_media_error_categories() {
        assert_eq!(
            MediaError::PermissionDenied("NotAllowedError".into())
                .to_call_error()
                .category,
            ErrorCategory::PermissionDenied
        );
        assert_eq!(
            MediaError::DeviceUnavailable("NotFoundError".into())
                .to_call_error()
                .category,
            ErrorCategory::DeviceUnavailable
        );
        assert_eq!(
            MediaError::Negotiation("bad sdp".into())
                .to_call_error()
                .category,
            ErrorCategory::NegotiationFailed
        );
    }

    #[test]
    fn test_transport_error_categories() {
        assert_eq!(
            TransportError::Connect("refused".into())
                .to_call_error()
                .category,
            ErrorCategory::TransportDisconnected
        );

        let busy = TransportError::Http {
            status: 486,
            body: "Busy Here".into(),
        }
        .to_call_error();
        assert_eq!(busy.category, ErrorCategory::Busy);
        assert_eq!(busy.code, Some(486));
    }

    #[test]
    fn test_command_error_display() {
        let err = CommandError::InvalidState {
            command: "mute",
            state: CallState::Idle,
        };
        assert_eq!(err.to_string(), "cannot mute while the call is idle");
        assert_eq!(err.to_call_error().category, ErrorCategory::InvalidState);
    }
}
