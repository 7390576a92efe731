//! In-memory media engine for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};

use super::engine::*;
use crate::calls::error::MediaError;

pub struct MockLocalStream {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockLocalStream {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalAudioStream for MockLocalStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_tracks_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn tracks_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct MockRemoteStream(pub String);

impl MockRemoteStream {
    pub fn new(id: &str) -> Arc<dyn RemoteAudioStream> {
        Arc::new(Self(id.to_string()))
    }
}

impl RemoteAudioStream for MockRemoteStream {
    fn id(&self) -> &str {
        &self.0
    }
}

pub const MOCK_SDP: &str =
    "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111 0 8 101\r\na=rtpmap:111 opus/48000/2\r\n";

/// Peer connection that records descriptions and lets tests raise callbacks.
pub struct MockPeer {
    pub closes: AtomicUsize,
    events: mpsc::UnboundedSender<PeerEvent>,
    local: Mutex<Option<String>>,
    remote: Mutex<Vec<(SdpType, String)>>,
    stats: Mutex<Option<InboundAudioStats>>,
}

impl MockPeer {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn local_description(&self) -> Option<String> {
        self.local.lock().unwrap().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<(SdpType, String)> {
        self.remote.lock().unwrap().clone()
    }

    pub fn set_stats(&self, stats: InboundAudioStats) {
        *self.stats.lock().unwrap() = Some(stats);
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn add_local_stream(&self, _stream: Arc<dyn LocalAudioStream>) -> Result<(), MediaError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        Ok(MOCK_SDP.to_string())
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        Ok(MOCK_SDP.to_string())
    }

    async fn set_local_description(&self, _kind: SdpType, sdp: &str) -> Result<(), MediaError> {
        *self.local.lock().unwrap() = Some(sdp.to_string());
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), MediaError> {
        self.remote.lock().unwrap().push((kind, sdp.to_string()));
        Ok(())
    }

    async fn stats(&self) -> Result<Option<InboundAudioStats>, MediaError> {
        Ok(self.stats.lock().unwrap().clone())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockOutput {
    pub plays: AtomicUsize,
    blocked: AtomicU32,
}

impl MockOutput {
    /// Refuses the next `n` plays with [`PlaybackError::Blocked`].
    pub fn block_next(&self, n: u32) {
        self.plays.store(0, Ordering::SeqCst);
        self.blocked.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioOutput for MockOutput {
    async fn play(&self, _stream: Arc<dyn RemoteAudioStream>) -> Result<(), PlaybackError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        let blocked = self.blocked.load(Ordering::SeqCst);
        if blocked > 0 {
            self.blocked.store(blocked - 1, Ordering::SeqCst);
            return Err(PlaybackError::Blocked);
        }
        Ok(())
    }

    async fn stop(&self) {}
}

pub struct MockCapture {
    captures: Mutex<Vec<Arc<MockLocalStream>>>,
    error: Mutex<Option<MediaError>>,
    held: AtomicBool,
    gate: Semaphore,
}

impl Default for MockCapture {
    fn default() -> Self {
        Self {
            captures: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl AudioCapture for MockCapture {
    async fn acquire(
        &self,
        _constraints: &AudioConstraints,
    ) -> Result<Arc<dyn LocalAudioStream>, MediaError> {
        if self.held.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(error) = self.error.lock().unwrap().clone() {
            return Err(error);
        }
        let mut captures = self.captures.lock().unwrap();
        let stream = Arc::new(MockLocalStream {
            id: format!("capture-{}", captures.len()),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        captures.push(stream.clone());
        Ok(stream)
    }
}

#[derive(Default)]
pub struct MockEngine {
    capture: Arc<MockCapture>,
    peers: Mutex<Vec<Arc<MockPeer>>>,
    pub output: Arc<MockOutput>,
}

impl MockEngine {
    pub fn fail_capture(&self, error: MediaError) {
        *self.capture.error.lock().unwrap() = Some(error);
    }

    /// Microphone requests wait until [`release_capture`](Self::release_capture).
    pub fn hold_capture(&self) {
        self.capture.held.store(true, Ordering::SeqCst);
    }

    pub fn release_capture(&self) {
        self.capture.gate.add_permits(1);
    }

    pub fn captures(&self) -> Vec<Arc<MockLocalStream>> {
        self.capture.captures.lock().unwrap().clone()
    }

    pub fn capture(&self, index: usize) -> Arc<MockLocalStream> {
        self.captures()[index].clone()
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        self.peers()[index].clone()
    }
}

impl MediaEngine for MockEngine {
    fn create_peer_connection(
        &self,
        _config: &PeerConnectionConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let peer = Arc::new(MockPeer {
            closes: AtomicUsize::new(0),
            events,
            local: Mutex::new(None),
            remote: Mutex::new(Vec::new()),
            stats: Mutex::new(None),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }

    fn audio_capture(&self) -> Arc<dyn AudioCapture> {
        self.capture.clone()
    }

    fn audio_output(&self) -> Arc<dyn AudioOutput> {
        self.output.clone()
    }
}
