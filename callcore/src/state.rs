//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::CallError;
use crate::signaling::SignalingMessage;
use crate::types::call::{CallDirection, CallId, RemoteParty, ZERO_DURATION, format_duration};

/// Lifecycle state of the single live call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Idle,
    /// Outbound: dial issued, waiting for the remote answer.
    Calling,
    /// Inbound: offer received, ringing locally.
    Ringing,
    /// Inbound: accept issued, media and accept requests in flight.
    Accepting,
    /// Answer exchanged, waiting for media to connect.
    Establishing,
    Established,
    Terminating,
    Terminated,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// A session exists and has not reached a terminal state.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Idle) && !self.is_terminal()
    }

    /// States in which a hang-up must cancel instead of sending a BYE.
    pub fn is_pre_answer(&self) -> bool {
        matches!(self, Self::Calling | Self::Accepting | Self::Establishing)
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Ringing)
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::Ringing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Accepting => "accepting",
            Self::Establishing => "establishing",
            Self::Established => "established",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    Dial { remote: RemoteParty },
    IncomingOffer { call_id: CallId, remote: RemoteParty },
    RemoteAnswer,
    RemoteRejected { error: CallError },
    LocalAccept,
    AcceptConfirmed,
    LocalReject,
    MediaConnected,
    Hangup,
    MediaClosed,
    RemoteTerminate,
    Timeout { error: CallError },
    Fatal { error: CallError },
    Reset,
}

impl CallTransition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dial { .. } => "Dial",
            Self::IncomingOffer { .. } => "IncomingOffer",
            Self::RemoteAnswer => "RemoteAnswer",
            Self::RemoteRejected { .. } => "RemoteRejected",
            Self::LocalAccept => "LocalAccept",
            Self::AcceptConfirmed => "AcceptConfirmed",
            Self::LocalReject => "LocalReject",
            Self::MediaConnected => "MediaConnected",
            Self::Hangup => "Hangup",
            Self::MediaClosed => "MediaClosed",
            Self::RemoteTerminate => "RemoteTerminate",
            Self::Timeout { .. } => "Timeout",
            Self::Fatal { .. } => "Fatal",
            Self::Reset => "Reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: CallState,
    pub attempted: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// The single call session a coordinator tracks.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CallSession {
    /// Assigned by the remote side; absent until known.
    pub id: Option<CallId>,
    pub direction: Option<CallDirection>,
    pub state: CallState,
    pub remote_party: Option<RemoteParty>,
    pub started_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub last_error: Option<CallError>,
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        self.apply_transition_at(transition, Utc::now())
    }

    /// Apply a state transition at a given instant. Returns error if the
    /// transition is not allowed from the current state.
    pub fn apply_transition_at(
        &mut self,
        transition: CallTransition,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        use CallState::*;

        let attempted = transition.name();
        let invalid = |state| InvalidTransition {
            current_state: state,
            attempted,
        };

        match (self.state, transition) {
            (Idle, CallTransition::Dial { remote }) => {
                *self = Self {
                    direction: Some(CallDirection::Outbound),
                    remote_party: Some(remote),
                    state: Calling,
                    ..Self::default()
                };
            }
            (Idle, CallTransition::IncomingOffer { call_id, remote }) => {
                *self = Self {
                    id: Some(call_id),
                    direction: Some(CallDirection::Inbound),
                    remote_party: Some(remote),
                    state: Ringing,
                    ..Self::default()
                };
            }
            (Calling, CallTransition::RemoteAnswer) => self.state = Establishing,
            (Calling, CallTransition::RemoteRejected { error }) => self.fail(error),
            (Ringing, CallTransition::LocalAccept) => self.state = Accepting,
            (Ringing, CallTransition::LocalReject) => self.state = Terminated,
            (Accepting, CallTransition::AcceptConfirmed) => self.state = Establishing,
            (Establishing, CallTransition::MediaConnected) => {
                self.state = Established;
                self.started_at = Some(now);
            }
            (Calling | Establishing, CallTransition::Timeout { error }) => self.fail(error),
            (Established, CallTransition::Hangup) => self.state = Terminating,
            (Calling | Accepting | Establishing, CallTransition::Hangup) => {
                self.state = Terminated
            }
            (Terminating, CallTransition::MediaClosed) => self.state = Terminated,
            (state, CallTransition::RemoteTerminate) if state.is_live() => {
                self.state = Terminated
            }
            (state, CallTransition::Fatal { error }) if state.is_live() => self.fail(error),
            (Terminated | Failed, CallTransition::Reset) => *self = Self::default(),
            (state, _) => return Err(invalid(state)),
        }

        if self.state != Established {
            self.started_at = None;
        }
        Ok(())
    }

    fn fail(&mut self, error: CallError) {
        self.state = CallState::Failed;
        self.last_error = Some(error);
    }

    pub fn is_initiator(&self) -> bool {
        self.direction == Some(CallDirection::Outbound)
    }

    /// Elapsed time since entering `Established`; zero in any other state.
    pub fn duration_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        match (self.state, self.started_at) {
            (CallState::Established, Some(started)) => now.signed_duration_since(started),
            _ => chrono::Duration::zero(),
        }
    }

    /// `mm:ss` while established, `00:00` otherwise.
    pub fn duration_display(&self, now: DateTime<Utc>) -> String {
        if self.state == CallState::Established {
            format_duration(self.duration_at(now))
        } else {
            ZERO_DURATION.to_string()
        }
    }

    /// Whether a signaling message that names `call_id` belongs to this session.
    ///
    /// Messages without an id bind to the live session; so do messages
    /// arriving before the remote side has assigned one.
    pub fn owns(&self, call_id: Option<&CallId>) -> bool {
        match (call_id, &self.id) {
            (Some(incoming), Some(ours)) => incoming == ours,
            _ => true,
        }
    }

    /// Maps an inbound signaling message onto the transition it implies for
    /// this session, if any. Stale or foreign messages map to `None`.
    pub fn transition_for(&self, message: &SignalingMessage) -> Option<CallTransition> {
        match message {
            SignalingMessage::IncomingCall {
                call_id, from, ..
            } if self.state == CallState::Idle => Some(CallTransition::IncomingOffer {
                call_id: call_id.clone(),
                remote: RemoteParty::parse(from.clone())?,
            }),
            SignalingMessage::RemoteAnswer { call_id, .. }
                if self.state == CallState::Calling && self.owns(call_id.as_ref()) =>
            {
                Some(CallTransition::RemoteAnswer)
            }
            SignalingMessage::Rejected {
                call_id, code, reason,
            } if self.state == CallState::Calling && self.owns(call_id.as_ref()) => {
                Some(CallTransition::RemoteRejected {
                    error: crate::classify::classify(reason, *code),
                })
            }
            SignalingMessage::Terminate { call_id }
                if self.state.is_live() && self.owns(call_id.as_ref()) =>
            {
                Some(CallTransition::RemoteTerminate)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn party() -> RemoteParty {
        RemoteParty::parse("919751577309").unwrap()
    }

    fn make_incoming_call() -> CallSession {
        let mut call = CallSession::new();
        call.apply_transition(CallTransition::IncomingOffer {
            call_id: CallId::new("wacid.HBgLOTE5NzUxNTc3MzA5FQIAEhggQTk"),
            remote: party(),
        })
        .unwrap();
        call
    }

    /// Flow: Idle → Calling → Establishing → Established → Terminating → Terminated
    #[test]
    fn test_outbound_call_flow() {
        let mut call = CallSession::new();
        call.apply_transition(CallTransition::Dial { remote: party() })
            .unwrap();
        assert_eq!(call.state, CallState::Calling);
        assert!(call.is_initiator());
        assert!(call.id.is_none());

        call.apply_transition(CallTransition::RemoteAnswer).unwrap();
        assert_eq!(call.state, CallState::Establishing);

        call.apply_transition(CallTransition::MediaConnected)
            .unwrap();
        assert_eq!(call.state, CallState::Established);
        assert!(call.started_at.is_some());

        call.apply_transition(CallTransition::Hangup).unwrap();
        assert_eq!(call.state, CallState::Terminating);
        assert!(call.started_at.is_none());

        call.apply_transition(CallTransition::MediaClosed).unwrap();
        assert_eq!(call.state, CallState::Terminated);

        call.apply_transition(CallTransition::Reset).unwrap();
        assert_eq!(call.state, CallState::Idle);
        assert!(call.direction.is_none());
    }

    /// Flow: Ringing → Accepting → Establishing → Established
    #[test]
    fn test_inbound_call_flow() {
        let mut call = make_incoming_call();
        assert!(call.state.can_accept());
        assert!(!call.is_initiator());

        call.apply_transition(CallTransition::LocalAccept).unwrap();
        assert_eq!(call.state, CallState::Accepting);
        // Debounced: a second accept is rejected by the state itself.
        assert!(call.apply_transition(CallTransition::LocalAccept).is_err());

        call.apply_transition(CallTransition::AcceptConfirmed)
            .unwrap();
        call.apply_transition(CallTransition::MediaConnected)
            .unwrap();
        assert_eq!(call.state, CallState::Established);
    }

    #[test]
    fn test_inbound_reject() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::LocalReject).unwrap();
        assert_eq!(call.state, CallState::Terminated);
        assert!(call.last_error.is_none());
    }

    #[test]
    fn test_pre_answer_hangup_goes_straight_to_terminated() {
        for setup in [
            vec![CallTransition::Dial { remote: party() }],
            vec![
                CallTransition::Dial { remote: party() },
                CallTransition::RemoteAnswer,
            ],
        ] {
            let mut call = CallSession::new();
            for t in setup {
                call.apply_transition(t).unwrap();
            }
            assert!(call.state.is_pre_answer());
            call.apply_transition(CallTransition::Hangup).unwrap();
            assert_eq!(call.state, CallState::Terminated);
        }
    }

    #[test]
    fn test_timeout_fails_once() {
        let mut call = CallSession::new();
        call.apply_transition(CallTransition::Dial { remote: party() })
            .unwrap();
        call.apply_transition(CallTransition::Timeout {
            error: CallError::timeout("no answer"),
        })
        .unwrap();
        assert_eq!(call.state, CallState::Failed);
        assert_eq!(
            call.last_error.as_ref().unwrap().category,
            ErrorCategory::Timeout
        );

        // A late answer or a second timeout cannot move a failed call.
        assert!(call.apply_transition(CallTransition::RemoteAnswer).is_err());
        assert!(
            call.apply_transition(CallTransition::Timeout {
                error: CallError::timeout("again"),
            })
            .is_err()
        );
    }

    #[test]
    fn test_remote_terminate_from_any_live_state() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::LocalAccept).unwrap();
        call.apply_transition(CallTransition::RemoteTerminate)
            .unwrap();
        assert_eq!(call.state, CallState::Terminated);

        // Not from idle or terminal states.
        assert!(
            call.apply_transition(CallTransition::RemoteTerminate)
                .is_err()
        );
        assert!(
            CallSession::new()
                .apply_transition(CallTransition::RemoteTerminate)
                .is_err()
        );
    }

    #[test]
    fn test_fatal_error_fails_live_call() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::Fatal {
            error: CallError::negotiation_failed("ice failed"),
        })
        .unwrap();
        assert_eq!(call.state, CallState::Failed);
        assert_eq!(
            call.last_error.unwrap().category,
            ErrorCategory::NegotiationFailed
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let mut call = CallSession::new();
        let err = call
            .apply_transition(CallTransition::MediaConnected)
            .unwrap_err();
        assert_eq!(err.current_state, CallState::Idle);
        assert_eq!(err.attempted, "MediaConnected");
        assert!(call.apply_transition(CallTransition::Hangup).is_err());
        assert!(call.apply_transition(CallTransition::Reset).is_err());

        let mut ringing = make_incoming_call();
        assert!(
            ringing
                .apply_transition(CallTransition::Dial { remote: party() })
                .is_err()
        );
    }

    #[test]
    fn test_duration_display() {
        let t0 = Utc::now();
        let mut call = CallSession::new();
        call.apply_transition(CallTransition::Dial { remote: party() })
            .unwrap();
        call.apply_transition(CallTransition::RemoteAnswer).unwrap();
        assert_eq!(call.duration_display(t0), "00:00");

        call.apply_transition_at(CallTransition::MediaConnected, t0)
            .unwrap();
        let later = t0 + chrono::Duration::milliseconds(125_000);
        assert_eq!(call.duration_display(later), "02:05");

        call.apply_transition_at(CallTransition::Hangup, later)
            .unwrap();
        assert_eq!(call.duration_display(later), "00:00");
    }

    #[test]
    fn test_transition_for_drops_foreign_messages() {
        let call = make_incoming_call();
        let foreign = SignalingMessage::Terminate {
            call_id: Some(CallId::new("other")),
        };
        assert!(call.transition_for(&foreign).is_none());

        let unscoped = SignalingMessage::Terminate { call_id: None };
        assert!(matches!(
            call.transition_for(&unscoped),
            Some(CallTransition::RemoteTerminate)
        ));

        // A second offer while ringing is not a transition for this session.
        let offer = SignalingMessage::IncomingCall {
            call_id: CallId::new("second"),
            from: "15550001111".into(),
            sdp: "v=0".into(),
            phone_number_id: None,
        };
        assert!(call.transition_for(&offer).is_none());
    }

    #[test]
    fn test_replaying_messages_is_deterministic() {
        let id = CallId::new("wacid.replay");
        let messages = vec![
            SignalingMessage::IncomingCall {
                call_id: id.clone(),
                from: "15550001111".into(),
                sdp: "v=0".into(),
                phone_number_id: Some("1234".into()),
            },
            SignalingMessage::RemoteAnswer {
                call_id: Some(id.clone()),
                sdp: "v=0".into(),
            },
            SignalingMessage::ConnectionStatus {
                text: "connected".into(),
            },
            SignalingMessage::Terminate {
                call_id: Some(id.clone()),
            },
            SignalingMessage::Terminate { call_id: Some(id) },
        ];

        let run = || {
            let mut session = CallSession::new();
            for message in &messages {
                if let Some(t) = session.transition_for(message) {
                    session.apply_transition(t).unwrap();
                }
            }
            session.state
        };

        assert_eq!(run(), CallState::Terminated);
        assert_eq!(run(), run());
    }
}
