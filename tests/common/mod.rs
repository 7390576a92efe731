//! Shared helpers for driving the coordinator end to end. The in-memory
//! transport, media engine and recorder come from the crate's `test-util`
//! mocks.

#![allow(dead_code)]

use callcore::SignalingMessage;
use std::time::Duration;
use whatsapp_calling::{CallHandle, CallSnapshot, CallState};

pub use whatsapp_calling::calls::media::mock::{
    MockEngine, MockLocalStream, MockPeer, MockRemoteStream,
};
pub use whatsapp_calling::calls::recording::mock::{MockRecorder, MockUploader};
pub use whatsapp_calling::calls::transport::mock::MockSignalingTransport;

pub const OFFER_SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111 0 8\r\na=rtpmap:111 opus/48000/2\r\n";

/// Waits until the published snapshot satisfies `pred`.
pub async fn wait_until(
    handle: &CallHandle,
    pred: impl FnMut(&CallSnapshot) -> bool,
) -> CallSnapshot {
    let mut rx = handle.watch();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for snapshot")
        .expect("coordinator stopped")
        .clone();
    snapshot
}

pub async fn wait_for_state(handle: &CallHandle, state: CallState) -> CallSnapshot {
    wait_until(handle, |s| s.state == state).await
}

/// Lets spawned tasks run to quiescence.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn incoming_call(call_id: &str) -> SignalingMessage {
    SignalingMessage::IncomingCall {
        call_id: call_id.into(),
        from: "919751577309".into(),
        sdp: OFFER_SDP.into(),
        phone_number_id: Some("106540352242922".into()),
    }
}
