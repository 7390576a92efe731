//! SIP-over-WebSocket transport.
//!
//! The SIP stack itself is an external capability ([`SipUserAgent`]); this
//! module adapts its events and requests to the signaling contract.

use async_trait::async_trait;
use callcore::types::{CallId, RemoteParty};
use callcore::{ControlCommand, ControlResponse, SignalingMessage};
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::calls::error::TransportError;
use crate::calls::transport::{SIGNALING_CHANNEL_CAPACITY, SignalingTransport};

pub const WHATSAPP_SIP_DOMAIN: &str = "wa.meta.vc";

/// Registration parameters for the user agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SipRegistration {
    /// Address of record, e.g. `sip:+15550001111@example.com`.
    pub uri: String,
    pub authorization_username: String,
    pub authorization_password: String,
    /// WebSocket URL of the SIP server.
    pub server: String,
    /// Domain used for outbound WhatsApp targets.
    pub domain: String,
}

impl Default for SipRegistration {
    fn default() -> Self {
        Self {
            uri: String::new(),
            authorization_username: String::new(),
            authorization_password: String::new(),
            server: String::new(),
            domain: WHATSAPP_SIP_DOMAIN.to_string(),
        }
    }
}

/// Events raised by the user agent.
#[derive(Debug, Clone, PartialEq)]
pub enum SipEvent {
    Registered,
    Unregistered,
    Disconnected,
    /// Inbound INVITE.
    Invite {
        call_id: CallId,
        from: String,
        sdp: String,
    },
    /// 2xx to our INVITE.
    Answered { call_id: CallId, sdp: String },
    /// Final non-2xx response to our INVITE.
    Failed {
        call_id: CallId,
        code: u16,
        reason: String,
    },
    Bye { call_id: CallId },
    Cancelled { call_id: CallId },
}

/// SIP stack capability driven by [`SipTransport`].
#[async_trait]
pub trait SipUserAgent: Send + Sync {
    /// Connects to the server and registers; events flow until `stop`.
    async fn start(
        &self,
        registration: &SipRegistration,
        events: mpsc::Sender<SipEvent>,
    ) -> anyhow::Result<()>;

    /// Sends an INVITE and returns the dialog's call id.
    async fn invite(&self, target: &str, sdp_offer: &str) -> anyhow::Result<CallId>;

    async fn accept(&self, call_id: &CallId, sdp_answer: &str) -> anyhow::Result<()>;

    async fn reject(&self, call_id: &CallId) -> anyhow::Result<()>;

    async fn cancel(&self, call_id: &CallId) -> anyhow::Result<()>;

    async fn bye(&self, call_id: &CallId) -> anyhow::Result<()>;

    async fn stop(&self);
}

pub fn dial_target(to: &RemoteParty, domain: &str) -> String {
    format!("sip:+{}@{}", to.digits(), domain)
}

fn translate(event: SipEvent) -> SignalingMessage {
    match event {
        SipEvent::Registered => SignalingMessage::connection_status("Registered"),
        SipEvent::Unregistered => SignalingMessage::connection_status("Unregistered"),
        SipEvent::Disconnected => SignalingMessage::disconnected(),
        SipEvent::Invite { call_id, from, sdp } => SignalingMessage::IncomingCall {
            call_id,
            from,
            sdp,
            phone_number_id: None,
        },
        SipEvent::Answered { call_id, sdp } => SignalingMessage::RemoteAnswer {
            call_id: Some(call_id),
            sdp,
        },
        SipEvent::Failed {
            call_id,
            code,
            reason,
        } => SignalingMessage::Rejected {
            call_id: Some(call_id),
            code: Some(code),
            reason: format!("{code} {reason}"),
        },
        SipEvent::Bye { call_id } | SipEvent::Cancelled { call_id } => {
            SignalingMessage::Terminate {
                call_id: Some(call_id),
            }
        }
    }
}

pub struct SipTransport {
    agent: Arc<dyn SipUserAgent>,
    registration: SipRegistration,
    started: AtomicBool,
    closed: AtomicBool,
}

impl SipTransport {
    pub fn new(agent: Arc<dyn SipUserAgent>, registration: SipRegistration) -> Self {
        Self {
            agent,
            registration,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

/// SIP request failures carry the status line; hand it back as backend
/// error text so the classifier sees it.
fn reply(result: anyhow::Result<()>) -> ControlResponse {
    match result {
        Ok(()) => ControlResponse::ok(),
        Err(e) => ControlResponse::failed(e.to_string()),
    }
}

#[async_trait]
impl SignalingTransport for SipTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<SignalingMessage>, TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }

        info!(target: "Call/Sip", "Registering {} via {}", self.registration.uri, self.registration.server);
        let (sip_tx, mut sip_rx) = mpsc::channel(SIGNALING_CHANNEL_CAPACITY);
        self.agent
            .start(&self.registration, sip_tx)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SIGNALING_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(event) = sip_rx.recv().await {
                debug!(target: "Call/Sip", "SIP event: {event:?}");
                let disconnected = event == SipEvent::Disconnected;
                if tx.send(translate(event)).await.is_err() || disconnected {
                    return;
                }
            }
            let _ = tx.send(SignalingMessage::disconnected()).await;
        });
        Ok(rx)
    }

    async fn send(&self, command: ControlCommand) -> Result<ControlResponse, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        debug!(target: "Call/Sip", "Sending {}", command.name());

        let response = match command {
            // SIP answers with 180 on its own; there is nothing to pre-accept.
            ControlCommand::PreAccept { .. } => ControlResponse::ok(),
            ControlCommand::Accept { call_id, sdp, .. } => {
                reply(self.agent.accept(&call_id, &sdp).await)
            }
            ControlCommand::Reject { call_id, .. } => reply(self.agent.reject(&call_id).await),
            ControlCommand::Cancel { call_id, .. } => reply(self.agent.cancel(&call_id).await),
            ControlCommand::Terminate { call_id, .. } => reply(self.agent.bye(&call_id).await),
            ControlCommand::Dial { to, sdp_offer } => {
                let target = dial_target(&to, &self.registration.domain);
                info!(target: "Call/Sip", "Inviting {target}");
                match self.agent.invite(&target, &sdp_offer).await {
                    Ok(call_id) => ControlResponse::ok_with_call_id(call_id),
                    Err(e) => {
                        warn!(target: "Call/Sip", "INVITE failed: {e}");
                        ControlResponse::failed(e.to_string())
                    }
                }
            }
        };
        Ok(response)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(target: "Call/Sip", "Stopping user agent");
            self.agent.stop().await;
        }
    }
}
