//! Server-sent events transport for the WhatsApp Business API backend.
//!
//! The backend pushes `CONNECTED` (plain status text) and `MESSAGE` (JSON
//! webhook payload) events on a long-lived GET; control requests are POSTed.

use async_trait::async_trait;
use callcore::net::{HttpClient, HttpRequest};
use callcore::signaling::parse_message;
use callcore::sse::{SseEvent, SseParser};
use callcore::{ControlCommand, ControlResponse, SignalingMessage};
use log::{debug, info, warn};
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};

use super::rest::{RestControl, join_url};
use super::webhook::READY_STATUS;
use crate::calls::error::TransportError;
use crate::calls::transport::{SIGNALING_CHANNEL_CAPACITY, SignalingTransport};

pub const DEFAULT_REGISTER_PATH: &str = "/waba/register";

const READ_BUFFER_SIZE: usize = 4096;

pub struct SseTransport {
    http: Arc<dyn HttpClient>,
    register_url: String,
    control: RestControl,
    started: AtomicBool,
    closed: Arc<AtomicBool>,
    /// Flipped by `close` to end the inbound stream without waiting for
    /// the reader thread.
    release: watch::Sender<bool>,
}

impl SseTransport {
    pub fn new(
        http: Arc<dyn HttpClient>,
        backend_url: &str,
        register_path: &str,
        control: RestControl,
    ) -> Self {
        Self {
            http,
            register_url: join_url(backend_url, register_path),
            control,
            started: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            release: watch::Sender::new(false),
        }
    }
}

fn translate(event: SseEvent) -> Option<SignalingMessage> {
    match event.event.as_str() {
        "CONNECTED" => Some(SignalingMessage::connection_status(event.data)),
        "MESSAGE" => match parse_message(&event.data) {
            Ok(Some(message)) => Some(message),
            Ok(None) => {
                debug!(target: "Call/Sse", "Ignoring unhandled event: {}", event.data);
                None
            }
            Err(e) => {
                warn!(target: "Call/Sse", "SSE JSON parse error: {e}");
                None
            }
        },
        other => {
            debug!(target: "Call/Sse", "Ignoring SSE event {other}");
            None
        }
    }
}

/// Reads the event stream on the current (blocking) thread until it ends,
/// the receiver goes away or the transport is closed. A read in progress
/// cannot be interrupted; the thread exits once it returns.
fn read_stream(
    http: Arc<dyn HttpClient>,
    url: String,
    tx: mpsc::Sender<SignalingMessage>,
    closed: Arc<AtomicBool>,
) {
    let request = HttpRequest::get(&url).with_header("Accept", "text/event-stream");
    let mut response = match http.execute_streaming(request) {
        Ok(response) if (200..300).contains(&response.status_code) => response,
        Ok(response) => {
            warn!(target: "Call/Sse", "Event stream refused with HTTP {}", response.status_code);
            let _ = tx.blocking_send(SignalingMessage::disconnected());
            return;
        }
        Err(e) => {
            warn!(target: "Call/Sse", "Failed to open event stream: {e}");
            let _ = tx.blocking_send(SignalingMessage::disconnected());
            return;
        }
    };

    info!(target: "Call/Sse", "Event stream open");
    if tx
        .blocking_send(SignalingMessage::connection_status(READY_STATUS))
        .is_err()
    {
        return;
    }

    let mut parser = SseParser::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        if closed.load(Ordering::SeqCst) {
            debug!(target: "Call/Sse", "Transport closed, stopping reader");
            return;
        }
        let n = match response.body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(target: "Call/Sse", "Event stream read failed: {e}");
                break;
            }
        };
        for event in parser.feed(&buf[..n]) {
            if let Some(message) = translate(event) {
                if tx.blocking_send(message).is_err() {
                    return;
                }
            }
        }
    }

    if !closed.load(Ordering::SeqCst) {
        let _ = tx.blocking_send(SignalingMessage::disconnected());
    }
}

#[async_trait]
impl SignalingTransport for SseTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<SignalingMessage>, TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        info!(target: "Call/Sse", "Registering at {}", self.register_url);
        let (tx, rx) = mpsc::channel(SIGNALING_CHANNEL_CAPACITY);
        let (reader_tx, mut reader_rx) = mpsc::channel(SIGNALING_CHANNEL_CAPACITY);
        let http = self.http.clone();
        let url = self.register_url.clone();
        let closed = self.closed.clone();
        // Detached so a read parked on a quiet stream never holds up
        // runtime shutdown.
        std::thread::Builder::new()
            .name("sse-reader".into())
            .spawn(move || read_stream(http, url, reader_tx, closed))
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut release = self.release.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = reader_rx.recv() => match message {
                        Some(message) => {
                            if tx.send(message).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                    _ = async { release.wait_for(|released| *released).await.map(|_| ()) } => {
                        debug!(target: "Call/Sse", "Event stream released");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn send(&self, command: ControlCommand) -> Result<ControlResponse, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.control.send(command).await
    }

    /// Ends the inbound stream at once. The reader thread stops after its
    /// current read returns.
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(target: "Call/Sse", "Closing event stream");
        }
        self.release.send_replace(true);
    }
}
