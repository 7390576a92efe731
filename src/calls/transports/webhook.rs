//! Webhook relay transport: inbound events arrive as JSON frames on a
//! WebSocket, control requests are POSTed to the backend.

use async_trait::async_trait;
use callcore::net::{Transport, TransportEvent, TransportFactory};
use callcore::signaling::parse_message;
use callcore::{ControlCommand, ControlResponse, SignalingMessage};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

use super::rest::RestControl;
use crate::calls::error::TransportError;
use crate::calls::transport::{SIGNALING_CHANNEL_CAPACITY, SignalingTransport};

/// Status reported once the relay socket is open.
pub const READY_STATUS: &str = "Ready for incoming calls";

#[derive(Default)]
struct Connection {
    started: bool,
    socket: Option<Arc<dyn Transport>>,
}

pub struct WebhookTransport {
    factory: Arc<dyn TransportFactory>,
    ws_url: String,
    control: RestControl,
    connection: Mutex<Connection>,
}

impl WebhookTransport {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        ws_url: impl Into<String>,
        control: RestControl,
    ) -> Self {
        Self {
            factory,
            ws_url: ws_url.into(),
            control,
            connection: Mutex::new(Connection::default()),
        }
    }
}

/// Maps one socket event onto the signaling stream. `None` means the
/// event carries nothing for the coordinator.
fn translate(event: TransportEvent) -> Option<SignalingMessage> {
    match event {
        TransportEvent::Connected => Some(SignalingMessage::connection_status(READY_STATUS)),
        TransportEvent::DataReceived(data) => {
            let text = String::from_utf8_lossy(&data);
            match parse_message(&text) {
                Ok(Some(message)) => Some(message),
                Ok(None) => {
                    debug!(target: "Call/Webhook", "Ignoring unhandled event: {text}");
                    None
                }
                Err(e) => {
                    warn!(target: "Call/Webhook", "Failed to parse relay event: {e}");
                    None
                }
            }
        }
        TransportEvent::Disconnected => Some(SignalingMessage::disconnected()),
    }
}

async fn pump(
    mut events: mpsc::Receiver<TransportEvent>,
    messages: mpsc::Sender<SignalingMessage>,
) {
    while let Some(event) = events.recv().await {
        let disconnected = matches!(event, TransportEvent::Disconnected);
        if let Some(message) = translate(event) {
            if messages.send(message).await.is_err() {
                debug!(target: "Call/Webhook", "Signaling receiver dropped");
                return;
            }
        }
        if disconnected {
            return;
        }
    }
    // Socket task ended without a Disconnected event.
    let _ = messages.send(SignalingMessage::disconnected()).await;
}

#[async_trait]
impl SignalingTransport for WebhookTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<SignalingMessage>, TransportError> {
        let mut connection = self.connection.lock().await;
        if connection.started {
            return Err(TransportError::AlreadyConnected);
        }
        connection.started = true;

        info!(target: "Call/Webhook", "Connecting to relay {}", self.ws_url);
        let (socket, events) = self
            .factory
            .create_transport(&self.ws_url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        connection.socket = Some(socket);

        let (tx, rx) = mpsc::channel(SIGNALING_CHANNEL_CAPACITY);
        tokio::spawn(pump(events, tx));
        Ok(rx)
    }

    async fn send(&self, command: ControlCommand) -> Result<ControlResponse, TransportError> {
        self.control.send(command).await
    }

    async fn close(&self) {
        let socket = self.connection.lock().await.socket.take();
        if let Some(socket) = socket {
            info!(target: "Call/Webhook", "Closing relay connection");
            socket.disconnect().await;
        }
    }
}
