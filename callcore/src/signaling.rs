//! Signaling messages exchanged with the calling backend.
//!
//! Inbound messages arrive as JSON objects tagged by `type`; outbound control
//! requests are JSON bodies posted to the backend (or mapped onto SIP
//! requests by the SIP transport).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

use crate::types::call::{CallId, RemoteParty};

/// Status text reported when a transport loses its connection.
pub const DISCONNECTED: &str = "disconnected";

/// Inbound message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    IncomingCall {
        call_id: CallId,
        from: String,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phone_number_id: Option<String>,
    },
    CallConnect {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    CallTerminate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    CallReject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default)]
        reason: String,
    },
    #[serde(other)]
    Unknown,
}

/// Typed signaling event produced by every transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    IncomingCall {
        call_id: CallId,
        from: String,
        sdp: String,
        phone_number_id: Option<String>,
    },
    RemoteAnswer {
        call_id: Option<CallId>,
        sdp: String,
    },
    Terminate {
        call_id: Option<CallId>,
    },
    ConnectionStatus {
        text: String,
    },
    /// The remote side refused an outbound call.
    Rejected {
        call_id: Option<CallId>,
        code: Option<u16>,
        reason: String,
    },
}

impl SignalingMessage {
    pub fn connection_status(text: impl Into<String>) -> Self {
        Self::ConnectionStatus { text: text.into() }
    }

    pub fn disconnected() -> Self {
        Self::connection_status(DISCONNECTED)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::ConnectionStatus { text } if text == DISCONNECTED)
    }

    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::IncomingCall { call_id, .. } => Some(call_id),
            Self::RemoteAnswer { call_id, .. }
            | Self::Terminate { call_id }
            | Self::Rejected { call_id, .. } => call_id.as_ref(),
            Self::ConnectionStatus { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::IncomingCall { .. } => "incoming_call",
            Self::RemoteAnswer { .. } => "remote_answer",
            Self::Terminate { .. } => "terminate",
            Self::ConnectionStatus { .. } => "connection_status",
            Self::Rejected { .. } => "rejected",
        }
    }
}

impl WireMessage {
    pub fn into_signaling(self) -> Option<SignalingMessage> {
        match self {
            Self::IncomingCall {
                call_id,
                from,
                sdp,
                phone_number_id,
            } => Some(SignalingMessage::IncomingCall {
                call_id,
                from,
                sdp,
                phone_number_id,
            }),
            Self::CallConnect { sdp, call_id } => {
                Some(SignalingMessage::RemoteAnswer { call_id, sdp })
            }
            Self::CallTerminate { call_id } => Some(SignalingMessage::Terminate { call_id }),
            Self::CallReject {
                call_id,
                code,
                reason,
            } => Some(SignalingMessage::Rejected {
                call_id,
                code,
                reason,
            }),
            Self::Unknown => None,
        }
    }
}

/// Parses one inbound JSON payload.
///
/// Returns `Ok(None)` for well-formed messages of a type this crate does not
/// handle, so transports can skip them without treating them as errors.
pub fn parse_message(text: &str) -> Result<Option<SignalingMessage>, serde_json::Error> {
    let wire: WireMessage = serde_json::from_str(text)?;
    Ok(wire.into_signaling())
}

/// Which backend operation a command is delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEndpoint {
    PreAccept,
    Accept,
    Terminate,
    Dial,
}

/// Outbound control request issued by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    PreAccept {
        call_id: CallId,
        sdp: String,
        phone_number_id: Option<String>,
    },
    Accept {
        call_id: CallId,
        sdp: String,
        phone_number_id: Option<String>,
    },
    /// Refuse an inbound call that has not been answered.
    Reject {
        call_id: CallId,
        phone_number_id: Option<String>,
    },
    /// End an answered call.
    Terminate {
        call_id: CallId,
        phone_number_id: Option<String>,
    },
    /// Abandon an outbound call before it was answered.
    Cancel {
        call_id: CallId,
        phone_number_id: Option<String>,
    },
    Dial {
        to: RemoteParty,
        sdp_offer: String,
    },
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreAccept { .. } => "pre_accept",
            Self::Accept { .. } => "accept",
            Self::Reject { .. } => "reject",
            Self::Terminate { .. } => "terminate",
            Self::Cancel { .. } => "cancel",
            Self::Dial { .. } => "dial",
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::PreAccept { call_id, .. }
            | Self::Accept { call_id, .. }
            | Self::Reject { call_id, .. }
            | Self::Terminate { call_id, .. }
            | Self::Cancel { call_id, .. } => Some(call_id),
            Self::Dial { .. } => None,
        }
    }

    /// REST backends expose no dedicated reject or cancel operation; both
    /// go through terminate.
    pub fn endpoint(&self) -> ControlEndpoint {
        match self {
            Self::PreAccept { .. } => ControlEndpoint::PreAccept,
            Self::Accept { .. } => ControlEndpoint::Accept,
            Self::Reject { .. } | Self::Terminate { .. } | Self::Cancel { .. } => {
                ControlEndpoint::Terminate
            }
            Self::Dial { .. } => ControlEndpoint::Dial,
        }
    }

    /// JSON request body. `phone_number_id` is omitted when unset.
    pub fn body(&self) -> Value {
        let mut body = match self {
            Self::PreAccept { call_id, sdp, .. } | Self::Accept { call_id, sdp, .. } => {
                json!({ "call_id": call_id, "sdp": sdp })
            }
            Self::Reject { call_id, .. }
            | Self::Terminate { call_id, .. }
            | Self::Cancel { call_id, .. } => json!({ "call_id": call_id }),
            Self::Dial { to, sdp_offer } => json!({ "to": to, "sdp_offer": sdp_offer }),
        };

        let phone_number_id = match self {
            Self::PreAccept { phone_number_id, .. }
            | Self::Accept { phone_number_id, .. }
            | Self::Reject { phone_number_id, .. }
            | Self::Terminate { phone_number_id, .. }
            | Self::Cancel { phone_number_id, .. } => phone_number_id.as_deref(),
            Self::Dial { .. } => None,
        };
        if let (Some(id), Some(map)) = (phone_number_id, body.as_object_mut()) {
            map.insert("phone_number_id".into(), Value::String(id.to_string()));
        }
        body
    }
}

/// Backend reply to a control request.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ControlResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    /// Backends report either a string or a structured object here.
    #[serde(
        default,
        deserialize_with = "error_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn ok_with_call_id(call_id: CallId) -> Self {
        Self {
            success: true,
            call_id: Some(call_id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            call_id: None,
            error: Some(error.into()),
        }
    }

    /// The failure text to classify, if the request did not succeed.
    pub fn failure_text(&self) -> Option<&str> {
        if self.success {
            None
        } else {
            Some(self.error.as_deref().unwrap_or(""))
        }
    }
}

fn error_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Object(map)) => match map.get("message").and_then(Value::as_str) {
            Some(message) => Some(message.to_string()),
            None => Some(Value::Object(map).to_string()),
        },
        Some(other) => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_incoming_call() {
        let msg = parse_message(
            r#"{"type":"incoming_call","call_id":"wacid.ABC","from":"15550001111","sdp":"v=0\r\n","phone_number_id":"1234"}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            msg,
            SignalingMessage::IncomingCall {
                call_id: CallId::new("wacid.ABC"),
                from: "15550001111".into(),
                sdp: "v=0\r\n".into(),
                phone_number_id: Some("1234".into()),
            }
        );
        assert_eq!(msg.call_id().unwrap().as_str(), "wacid.ABC");
    }

    #[test]
    fn test_parse_connect_and_terminate_without_call_id() {
        let connect = parse_message(r#"{"type":"call_connect","sdp":"v=0"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            connect,
            SignalingMessage::RemoteAnswer {
                call_id: None,
                sdp: "v=0".into()
            }
        );

        let terminate = parse_message(r#"{"type":"call_terminate"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(terminate, SignalingMessage::Terminate { call_id: None });
        assert!(terminate.call_id().is_none());
    }

    #[test]
    fn test_parse_reject() {
        let msg = parse_message(r#"{"type":"call_reject","code":486,"reason":"Busy Here"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            SignalingMessage::Rejected {
                call_id: None,
                code: Some(486),
                reason: "Busy Here".into()
            }
        );
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        assert_eq!(
            parse_message(r#"{"type":"status_update","status":"ringing"}"#).unwrap(),
            None
        );
        assert!(parse_message("not json").is_err());
        assert!(parse_message(r#"{"type":"incoming_call"}"#).is_err());
    }

    #[test]
    fn test_command_bodies() {
        let accept = ControlCommand::Accept {
            call_id: CallId::new("c1"),
            sdp: "v=0".into(),
            phone_number_id: Some("99".into()),
        };
        assert_eq!(
            accept.body(),
            json!({"call_id": "c1", "sdp": "v=0", "phone_number_id": "99"})
        );
        assert_eq!(accept.endpoint(), ControlEndpoint::Accept);

        let terminate = ControlCommand::Terminate {
            call_id: CallId::new("c1"),
            phone_number_id: None,
        };
        assert_eq!(terminate.body(), json!({"call_id": "c1"}));

        let dial = ControlCommand::Dial {
            to: RemoteParty::parse("15550001111").unwrap(),
            sdp_offer: "v=0".into(),
        };
        assert_eq!(dial.body(), json!({"to": "15550001111", "sdp_offer": "v=0"}));
        assert!(dial.call_id().is_none());

        let reject = ControlCommand::Reject {
            call_id: CallId::new("c2"),
            phone_number_id: None,
        };
        assert_eq!(reject.endpoint(), ControlEndpoint::Terminate);
    }

    #[test]
    fn test_control_response_error_shapes() {
        let ok: ControlResponse =
            serde_json::from_str(r#"{"success":true,"call_id":"wacid.X"}"#).unwrap();
        assert!(ok.success);
        assert_eq!(ok.call_id, Some(CallId::new("wacid.X")));
        assert!(ok.failure_text().is_none());

        let text: ControlResponse =
            serde_json::from_str(r#"{"success":false,"error":"486 Busy Here"}"#).unwrap();
        assert_eq!(text.failure_text(), Some("486 Busy Here"));

        let object: ControlResponse = serde_json::from_str(
            r#"{"success":false,"error":{"message":"Business initiated calls daily limit hit","code":138012}}"#,
        )
        .unwrap();
        assert_eq!(
            object.error.as_deref(),
            Some("Business initiated calls daily limit hit")
        );

        let bare: ControlResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(bare.failure_text(), Some(""));
    }
}
