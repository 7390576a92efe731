//! What the coordinator publishes to observers.

use callcore::types::{CallDirection, CallId, RemoteParty, ZERO_DURATION, format_duration};
use callcore::{CallError, CallState};
use chrono::{DateTime, Utc};

use super::media::{ConnectionState, IceState};
use super::recording::RecordingStatus;

/// Point-in-time view of the call, published on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub direction: Option<CallDirection>,
    pub call_id: Option<CallId>,
    pub remote_party: Option<RemoteParty>,
    pub muted: bool,
    /// Set only while `Established`.
    pub established_at: Option<DateTime<Utc>>,
    /// Cleared once the display window has passed.
    pub last_error: Option<CallError>,
    pub recording_status: Option<RecordingStatus>,
    /// Latest connection status reported by the signaling transport.
    pub status_text: Option<String>,
    pub connection_state: ConnectionState,
    pub ice_state: IceState,
    /// Remote audio is waiting for a user gesture; see
    /// [`CallHandle::retry_playback`](super::CallHandle::retry_playback).
    pub playback_blocked: bool,
    /// Most recent errors, oldest first.
    pub error_history: Vec<CallError>,
}

impl CallSnapshot {
    /// `mm:ss` since the call was established, `00:00` otherwise.
    pub fn duration_display(&self, now: DateTime<Utc>) -> String {
        match (self.state, self.established_at) {
            (CallState::Established, Some(at)) => format_duration(now.signed_duration_since(at)),
            _ => ZERO_DURATION.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged {
        from: CallState,
        to: CallState,
        call_id: Option<CallId>,
    },
    Error(CallError),
    RecordingStatus(RecordingStatus),
    ConnectionStatus(String),
    /// Autoplay refused the remote audio after every retry.
    PlaybackBlocked,
}
