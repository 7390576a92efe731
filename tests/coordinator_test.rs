mod common;

use callcore::types::CallId;
use callcore::{ControlCommand, ControlResponse, ErrorCategory, SignalingMessage};
use common::*;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use whatsapp_calling::calls::error::{CommandError, MediaError};
use whatsapp_calling::calls::media::{
    ConnectionState, IceState, InboundAudioStats, LocalAudioStream, MediaSessionConfig,
    PeerEvent, PlaybackError, PlaybackRetry,
};
use whatsapp_calling::calls::recording::{RecordingConfig, RecordingStatus, RecordingTrigger};
use whatsapp_calling::calls::{CallCoordinator, CoordinatorConfig};
use whatsapp_calling::config::CallConfig;
use whatsapp_calling::{CallEvent, CallHandle, CallState};

struct Harness {
    handle: CallHandle,
    transport: Arc<MockSignalingTransport>,
    signaling: tokio::sync::mpsc::Sender<SignalingMessage>,
    engine: Arc<MockEngine>,
}

fn harness_with(recording: Option<RecordingTrigger>) -> Harness {
    harness_with_config(CoordinatorConfig::default(), recording)
}

fn harness_with_config(config: CoordinatorConfig, recording: Option<RecordingTrigger>) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let (transport, signaling) = MockSignalingTransport::new();
    let engine = Arc::new(MockEngine::default());
    let handle = CallCoordinator::spawn(
        config,
        transport.clone(),
        engine.clone(),
        recording,
    );
    Harness {
        handle,
        transport,
        signaling,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(None)
}

impl Harness {
    async fn signal(&self, message: SignalingMessage) {
        self.signaling.send(message).await.unwrap();
    }

    async fn ring(&self, call_id: &str) {
        self.signal(incoming_call(call_id)).await;
        let snapshot = wait_for_state(&self.handle, CallState::Ringing).await;
        assert_eq!(snapshot.call_id, Some(CallId::new(call_id)));
    }

    /// Rings, accepts and connects media.
    async fn establish(&self, call_id: &str) {
        self.ring(call_id).await;
        self.handle.accept().await.unwrap();
        wait_for_state(&self.handle, CallState::Establishing).await;

        let peer = self.engine.peer(0);
        peer.emit(PeerEvent::Track(Arc::new(MockRemoteStream("remote-0".into()))));
        peer.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        wait_for_state(&self.handle, CallState::Established).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_dial_times_out_once() {
    let h = harness();
    h.transport
        .push_response(ControlResponse::ok_with_call_id(CallId::new("wacid.out")));

    h.handle.dial("+91 97515 77309").await.unwrap();
    assert_eq!(h.handle.snapshot().state, CallState::Calling);
    wait_until(&h.handle, |s| s.call_id.is_some()).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    let failed = wait_for_state(&h.handle, CallState::Failed).await;
    assert_eq!(
        failed.last_error.as_ref().map(|e| e.category),
        Some(ErrorCategory::Timeout)
    );

    // The answer arrives too late to matter.
    h.signal(SignalingMessage::RemoteAnswer {
        call_id: Some(CallId::new("wacid.out")),
        sdp: OFFER_SDP.into(),
    })
    .await;
    settle().await;

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.state, CallState::Failed);
    assert_eq!(snapshot.error_history.len(), 1);
    assert_eq!(h.transport.sent_names(), vec!["dial", "cancel"]);
    assert_eq!(h.engine.peer(0).closes.load(Ordering::SeqCst), 1);
    assert!(h.engine.peer(0).remote_descriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_file_config_drives_the_coordinator() {
    let config: CallConfig = serde_json::from_str(
        r#"{ "phone_number_id": "1234567890", "timeouts": { "setup_secs": 5 } }"#,
    )
    .unwrap();
    config.validate().unwrap();
    let h = harness_with_config(config.coordinator_config(), None);
    h.transport
        .push_response(ControlResponse::ok_with_call_id(CallId::new("wacid.out")));

    h.handle.dial("+91 97515 77309").await.unwrap();
    wait_until(&h.handle, |s| s.call_id.is_some()).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_for_state(&h.handle, CallState::Failed).await;

    // Callers that omit the business number fall back to the configured one.
    h.signal(SignalingMessage::IncomingCall {
        call_id: "wacid.in".into(),
        from: "919751577309".into(),
        sdp: OFFER_SDP.into(),
        phone_number_id: None,
    })
    .await;
    wait_for_state(&h.handle, CallState::Ringing).await;
    h.handle.reject().await.unwrap();
    settle().await;

    assert_eq!(
        h.transport.sent().last(),
        Some(&ControlCommand::Reject {
            call_id: CallId::new("wacid.in"),
            phone_number_id: Some("1234567890".into()),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_outbound_call_connects() {
    let h = harness();
    h.transport
        .push_response(ControlResponse::ok_with_call_id(CallId::new("wacid.out")));

    h.handle.dial("15550001111").await.unwrap();
    wait_until(&h.handle, |s| s.call_id.is_some()).await;
    match &h.transport.sent()[0] {
        ControlCommand::Dial { to, sdp_offer } => {
            assert_eq!(to.as_str(), "15550001111");
            assert!(sdp_offer.contains("a=ptime:20"));
        }
        other => panic!("unexpected command {other:?}"),
    }

    // Answers for other calls are dropped.
    h.signal(SignalingMessage::RemoteAnswer {
        call_id: Some(CallId::new("wacid.other")),
        sdp: "v=0".into(),
    })
    .await;
    h.signal(SignalingMessage::RemoteAnswer {
        call_id: Some(CallId::new("wacid.out")),
        sdp: "v=0 answer".into(),
    })
    .await;
    wait_for_state(&h.handle, CallState::Establishing).await;
    settle().await;
    assert_eq!(h.engine.peer(0).remote_descriptions().len(), 1);

    h.engine
        .peer(0)
        .emit(PeerEvent::ConnectionState(ConnectionState::Connected));
    let established = wait_for_state(&h.handle, CallState::Established).await;
    assert!(established.established_at.is_some());
    assert_eq!(established.connection_state, ConnectionState::Connected);

    // Well past the setup timeout: the timer was disarmed.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.handle.snapshot().state, CallState::Established);
    assert_eq!(h.handle.snapshot().duration_display(chrono::Utc::now()).len(), 5);
}

#[tokio::test]
async fn test_remote_terminate_wins_over_accept() {
    let h = harness();
    h.engine.hold_capture();
    h.ring("wacid.in").await;

    h.handle.accept().await.unwrap();
    assert_eq!(h.handle.snapshot().state, CallState::Accepting);
    // A second click is refused while the first is in flight.
    assert!(matches!(
        h.handle.accept().await,
        Err(CommandError::InvalidState {
            state: CallState::Accepting,
            ..
        })
    ));

    h.signal(SignalingMessage::Terminate {
        call_id: Some(CallId::new("wacid.in")),
    })
    .await;
    wait_for_state(&h.handle, CallState::Terminated).await;

    h.engine.release_capture();
    settle().await;

    // The accept chain was aborted while it waited for the microphone.
    assert_eq!(h.handle.snapshot().state, CallState::Terminated);
    assert!(h.engine.captures().iter().all(|c| c.is_stopped()));
    assert!(h.engine.peers().is_empty());
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_hangup_while_accepting_sends_no_accept() {
    let h = harness();
    h.transport.hold("pre_accept");
    h.ring("wacid.in").await;

    h.handle.accept().await.unwrap();
    settle().await;
    // Microphone open, answer created, pre_accept parked in the transport.
    assert_eq!(h.handle.snapshot().state, CallState::Accepting);
    assert_eq!(h.engine.captures().len(), 1);

    h.handle.hangup().await.unwrap();
    assert_eq!(h.handle.snapshot().state, CallState::Terminated);

    h.transport.release();
    settle().await;
    assert_eq!(h.transport.sent_names(), vec!["terminate"]);
    assert!(h.engine.capture(0).is_stopped());
    assert_eq!(h.handle.snapshot().state, CallState::Terminated);
}

#[tokio::test]
async fn test_remote_terminate_while_accepting_sends_no_accept() {
    let h = harness();
    h.transport.hold("pre_accept");
    h.ring("wacid.in").await;
    h.handle.accept().await.unwrap();
    settle().await;

    h.signal(SignalingMessage::Terminate {
        call_id: Some(CallId::new("wacid.in")),
    })
    .await;
    wait_for_state(&h.handle, CallState::Terminated).await;

    h.transport.release();
    settle().await;
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_accept_hangup_and_recording() {
    let recorder = Arc::new(MockRecorder::default());
    let uploader = Arc::new(MockUploader::default());
    let h = harness_with(Some(RecordingTrigger::new(
        recorder.clone(),
        uploader.clone(),
        RecordingConfig::default(),
    )));

    h.establish("wacid.in").await;
    assert_eq!(h.transport.sent_names(), vec!["pre_accept", "accept"]);
    wait_until(&h.handle, |s| {
        s.recording_status == Some(RecordingStatus::Started)
    })
    .await;

    h.handle.hangup().await.unwrap();
    wait_for_state(&h.handle, CallState::Terminated).await;
    let snapshot = wait_until(&h.handle, |s| {
        s.recording_status == Some(RecordingStatus::Saved)
    })
    .await;
    assert!(snapshot.last_error.is_none());

    assert_eq!(
        h.transport.sent_names(),
        vec!["pre_accept", "accept", "terminate"]
    );
    assert_eq!(h.engine.peer(0).closes.load(Ordering::SeqCst), 1);
    assert!(h.engine.captures()[0].is_stopped());
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);

    let uploads = uploader.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].0.file_name.starts_with("call_wacid.in_"));
    assert_eq!(uploads[0].1.call_id, Some(CallId::new("wacid.in")));
}

#[tokio::test]
async fn test_recording_can_be_disabled() {
    let recorder = Arc::new(MockRecorder::default());
    let h = harness_with(Some(RecordingTrigger::new(
        recorder.clone(),
        Arc::new(MockUploader::default()),
        RecordingConfig {
            enabled: false,
            ..Default::default()
        },
    )));

    h.establish("wacid.in").await;
    settle().await;
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);
    assert_eq!(h.handle.snapshot().recording_status, None);
}

#[tokio::test]
async fn test_mute_rules() {
    let h = harness();
    assert!(matches!(
        h.handle.toggle_mute().await,
        Err(CommandError::InvalidState {
            state: CallState::Idle,
            ..
        })
    ));

    h.ring("wacid.in").await;
    assert!(h.handle.toggle_mute().await.unwrap());
    assert!(!h.handle.toggle_mute().await.unwrap());
    h.handle.set_muted(true).await.unwrap();

    // Muting before the microphone is open applies to the capture.
    h.handle.accept().await.unwrap();
    wait_for_state(&h.handle, CallState::Establishing).await;
    assert!(!h.engine.captures()[0].tracks_enabled());

    h.handle.set_muted(false).await.unwrap();
    assert!(h.engine.captures()[0].tracks_enabled());
    assert!(!h.handle.snapshot().muted);
}

#[tokio::test]
async fn test_second_incoming_call_is_rejected() {
    let h = harness();
    h.ring("wacid.a").await;

    h.signal(incoming_call("wacid.a")).await;
    h.signal(incoming_call("wacid.b")).await;
    settle().await;

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.state, CallState::Ringing);
    assert_eq!(snapshot.call_id, Some(CallId::new("wacid.a")));
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        &sent[0],
        ControlCommand::Reject { call_id, .. } if call_id.as_str() == "wacid.b"
    ));
}

#[tokio::test]
async fn test_reject_and_reset() {
    let h = harness();
    h.handle.reset().await.unwrap();
    assert!(matches!(
        h.handle.hangup().await,
        Err(CommandError::InvalidState { .. })
    ));
    assert_eq!(
        h.handle.dial("   ").await,
        Err(CommandError::InvalidRemoteParty)
    );

    h.ring("wacid.in").await;
    assert!(h.handle.reset().await.is_err());
    h.handle.reject().await.unwrap();
    assert_eq!(h.handle.snapshot().state, CallState::Terminated);
    settle().await;
    assert!(matches!(
        &h.transport.sent()[0],
        ControlCommand::Reject { phone_number_id: Some(id), .. } if id == "106540352242922"
    ));

    // A new call after a finished one needs no explicit reset.
    h.ring("wacid.next").await;
    h.handle.hangup().await.unwrap();
    assert_eq!(h.handle.snapshot().state, CallState::Terminated);

    h.handle.reset().await.unwrap();
    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.state, CallState::Idle);
    assert_eq!(snapshot.call_id, None);
    h.handle.hangup().await.unwrap_err();
}

#[tokio::test(start_paused = true)]
async fn test_backend_failure_is_classified_and_cleared() {
    let h = harness();
    h.transport.push_response(ControlResponse::failed(
        "Business initiated calls daily limit hit. limit: 100, Next allowed unix epoch time in seconds: 1700000000",
    ));

    h.handle.dial("15550001111").await.unwrap();
    let failed = wait_for_state(&h.handle, CallState::Failed).await;
    let error = failed.last_error.unwrap();
    assert_eq!(error.category, ErrorCategory::RateLimited);
    assert_eq!(error.limit, Some(100));
    assert_eq!(error.retry_after, Some(1_700_000_000));

    tokio::time::sleep(Duration::from_secs(11)).await;
    let cleared = wait_until(&h.handle, |s| s.last_error.is_none()).await;
    assert_eq!(cleared.state, CallState::Failed);
    assert_eq!(cleared.error_history.len(), 1);

    // Dialing again resets implicitly.
    h.handle.dial("15550001111").await.unwrap();
    assert_eq!(h.handle.snapshot().state, CallState::Calling);
}

#[tokio::test]
async fn test_microphone_denied_fails_dial() {
    let h = harness();
    h.engine
        .fail_capture(MediaError::PermissionDenied("NotAllowedError".into()));

    h.handle.dial("15550001111").await.unwrap();
    let failed = wait_for_state(&h.handle, CallState::Failed).await;
    assert_eq!(
        failed.last_error.map(|e| e.category),
        Some(ErrorCategory::PermissionDenied)
    );
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_hangup_while_calling_cancels() {
    let h = harness();
    h.transport
        .push_response(ControlResponse::ok_with_call_id(CallId::new("wacid.out")));
    h.handle.dial("15550001111").await.unwrap();
    wait_until(&h.handle, |s| s.call_id.is_some()).await;

    h.handle.hangup().await.unwrap();
    assert_eq!(h.handle.snapshot().state, CallState::Terminated);
    settle().await;
    assert_eq!(h.transport.sent_names(), vec!["dial", "cancel"]);
    assert_eq!(h.engine.peer(0).closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_hangup_before_microphone_opens() {
    let h = harness();
    h.engine.hold_capture();

    h.handle.dial("15550001111").await.unwrap();
    h.handle.hangup().await.unwrap();
    assert_eq!(h.handle.snapshot().state, CallState::Terminated);

    h.engine.release_capture();
    settle().await;
    // The media session was closed before the microphone opened, so the
    // dial never went out.
    assert!(h.transport.sent().is_empty());
    assert!(h.engine.captures()[0].is_stopped());
}

#[tokio::test]
async fn test_signaling_loss_fails_pending_call() {
    let h = harness();
    h.ring("wacid.in").await;

    h.signal(SignalingMessage::disconnected()).await;
    let failed = wait_for_state(&h.handle, CallState::Failed).await;
    assert_eq!(failed.status_text.as_deref(), Some("disconnected"));
    assert_eq!(
        failed.last_error.map(|e| e.category),
        Some(ErrorCategory::TransportDisconnected)
    );
}

#[tokio::test]
async fn test_shutdown_closes_transport() {
    let h = harness();
    h.establish("wacid.in").await;

    h.handle.shutdown().await;
    // The terminate went out before the transport stopped accepting sends.
    assert_eq!(
        h.transport.sent_names(),
        vec!["pre_accept", "accept", "terminate"]
    );
    assert!(h.transport.is_closed());
    assert_eq!(h.handle.snapshot().state, CallState::Terminated);
    assert_eq!(h.engine.peer(0).closes.load(Ordering::SeqCst), 1);
    assert!(matches!(
        h.handle.accept().await,
        Err(CommandError::CoordinatorStopped)
    ));
}

#[tokio::test]
async fn test_shutdown_waits_for_pending_terminate() {
    let h = harness();
    h.transport.hold("terminate");
    h.establish("wacid.in").await;
    h.handle.hangup().await.unwrap();
    assert_eq!(h.handle.snapshot().state, CallState::Terminating);

    let handle = h.handle.clone();
    let shutdown = tokio::spawn(async move { handle.shutdown().await });
    settle().await;
    assert!(!h.transport.is_closed());

    h.transport.release();
    shutdown.await.unwrap();
    assert_eq!(
        h.transport.sent_names(),
        vec!["pre_accept", "accept", "terminate"]
    );
    assert!(h.transport.is_closed());
    assert_eq!(h.handle.snapshot().state, CallState::Terminated);
}

#[tokio::test]
async fn test_shutdown_rejects_ringing_call() {
    let h = harness();
    h.ring("wacid.in").await;

    h.handle.shutdown().await;
    assert_eq!(h.transport.sent_names(), vec!["reject"]);
    assert!(h.transport.is_closed());
}

#[tokio::test]
async fn test_local_audio_check_leaves_call_capture_alone() {
    let h = harness();
    let idle = h.handle.test_local_audio().await.unwrap();
    assert_eq!(idle.stream_id, "capture-0");
    assert!(h.engine.capture(0).is_stopped());

    h.establish("wacid.in").await;
    h.handle.set_muted(true).await.unwrap();
    let during_call = h.handle.test_local_audio().await.unwrap();
    assert_eq!(during_call.stream_id, "capture-2");
    assert!(during_call.tracks_enabled);
    assert!(h.engine.capture(2).is_stopped());

    // The call's own capture keeps streaming and stays muted.
    let call_capture = h.engine.capture(1);
    assert!(!call_capture.is_stopped());
    assert!(!call_capture.tracks_enabled());
    assert_eq!(h.handle.snapshot().state, CallState::Established);

    h.engine
        .fail_capture(MediaError::PermissionDenied("NotAllowedError".into()));
    assert_eq!(
        h.handle.test_local_audio().await,
        Err(CommandError::Media(MediaError::PermissionDenied(
            "NotAllowedError".into()
        )))
    );
}

#[tokio::test(start_paused = true)]
async fn test_blocked_playback_is_surfaced_and_retried() {
    let h = harness_with_config(
        CoordinatorConfig {
            media: MediaSessionConfig {
                playback: PlaybackRetry {
                    max_attempts: 2,
                    backoff_ms: 100,
                },
                ..Default::default()
            },
            ..Default::default()
        },
        None,
    );
    assert!(matches!(
        h.handle.retry_playback().await,
        Err(CommandError::InvalidState {
            state: CallState::Idle,
            ..
        })
    ));
    let mut events = h.handle.subscribe();
    h.engine.output.block_next(2);

    h.establish("wacid.in").await;
    let blocked = wait_until(&h.handle, |s| s.playback_blocked).await;
    assert_eq!(blocked.state, CallState::Established);
    assert_eq!(h.engine.output.plays.load(Ordering::SeqCst), 2);

    h.handle.retry_playback().await.unwrap();
    assert_eq!(h.engine.output.plays.load(Ordering::SeqCst), 3);
    wait_until(&h.handle, |s| !s.playback_blocked).await;

    h.engine.output.block_next(2);
    assert_eq!(
        h.handle.retry_playback().await,
        Err(CommandError::Playback(PlaybackError::Blocked))
    );
    wait_until(&h.handle, |s| s.playback_blocked).await;

    let mut blocked_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CallEvent::PlaybackBlocked) {
            blocked_events += 1;
        }
    }
    assert_eq!(blocked_events, 2);
}

#[tokio::test]
async fn test_stats_and_ice_state_of_live_call() {
    let h = harness();
    assert!(matches!(
        h.handle.stats().await,
        Err(CommandError::InvalidState { .. })
    ));

    h.establish("wacid.in").await;
    assert_eq!(h.handle.stats().await, Ok(None));

    let peer = h.engine.peer(0);
    peer.set_stats(InboundAudioStats {
        packets_received: 500,
        bytes_received: 80_000,
        jitter: 0.004,
        ..Default::default()
    });
    let stats = h.handle.stats().await.unwrap().unwrap();
    assert_eq!(stats.packets_received, 500);
    assert_eq!(stats.bytes_received, 80_000);

    peer.emit(PeerEvent::IceState(IceState::Completed));
    let snapshot = wait_until(&h.handle, |s| s.ice_state == IceState::Completed).await;
    assert_eq!(snapshot.state, CallState::Established);

    h.handle.hangup().await.unwrap();
    wait_for_state(&h.handle, CallState::Terminated).await;
    assert!(h.handle.stats().await.is_err());
}
