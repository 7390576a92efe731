//! Signaling transport abstraction.
//!
//! Every transport turns its channel (SIP over WebSocket, webhook relay
//! over WebSocket, server-sent events) into one stream of
//! [`SignalingMessage`]s and delivers [`ControlCommand`]s back.

use async_trait::async_trait;
use callcore::{ControlCommand, ControlResponse, SignalingMessage};
use tokio::sync::mpsc;

use super::error::TransportError;

pub const SIGNALING_CHANNEL_CAPACITY: usize = 64;

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Opens the channel and returns the inbound message stream.
    ///
    /// The stream runs until the channel is lost, which is reported as a
    /// final `ConnectionStatus { "disconnected" }`. A transport can be
    /// connected once; reconnecting means building a new transport.
    async fn connect(&self) -> Result<mpsc::Receiver<SignalingMessage>, TransportError>;

    /// Delivers a control request and resolves with the backend's reply.
    async fn send(&self, command: ControlCommand) -> Result<ControlResponse, TransportError>;

    /// Tears the channel down. Safe to call more than once.
    async fn close(&self);
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    /// In-memory transport: tests push inbound messages and inspect the
    /// commands the coordinator sent.
    pub struct MockSignalingTransport {
        inbound: Mutex<Option<mpsc::Receiver<SignalingMessage>>>,
        sent: Mutex<Vec<ControlCommand>>,
        responses: Mutex<Vec<ControlResponse>>,
        held: Mutex<Vec<&'static str>>,
        released: watch::Sender<bool>,
        closed: AtomicBool,
    }

    impl MockSignalingTransport {
        pub fn new() -> (Arc<Self>, mpsc::Sender<SignalingMessage>) {
            let (tx, rx) = mpsc::channel(SIGNALING_CHANNEL_CAPACITY);
            let transport = Arc::new(Self {
                inbound: Mutex::new(Some(rx)),
                sent: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
                held: Mutex::new(Vec::new()),
                released: watch::Sender::new(false),
                closed: AtomicBool::new(false),
            });
            (transport, tx)
        }

        /// Queues a reply for the next `send`; unqueued sends succeed.
        pub fn push_response(&self, response: ControlResponse) {
            self.responses.lock().unwrap().push(response);
        }

        /// Sends of `name` block until [`release`](Self::release). A held
        /// command is recorded only once it passes.
        pub fn hold(&self, name: &'static str) {
            self.held.lock().unwrap().push(name);
        }

        pub fn release(&self) {
            self.released.send_replace(true);
        }

        pub fn sent(&self) -> Vec<ControlCommand> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_names(&self) -> Vec<&'static str> {
            self.sent().iter().map(ControlCommand::name).collect()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SignalingTransport for MockSignalingTransport {
        async fn connect(&self) -> Result<mpsc::Receiver<SignalingMessage>, TransportError> {
            self.inbound
                .lock()
                .unwrap()
                .take()
                .ok_or(TransportError::AlreadyConnected)
        }

        async fn send(&self, command: ControlCommand) -> Result<ControlResponse, TransportError> {
            let held = self.held.lock().unwrap().contains(&command.name());
            if held {
                let mut released = self.released.subscribe();
                let _ = released.wait_for(|released| *released).await;
            }
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(command);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(ControlResponse::ok())
            } else {
                Ok(responses.remove(0))
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
