//! Call coordinator.
//!
//! A single task owns the call session and consumes one event queue:
//! user commands, signaling messages, peer callbacks, completions of
//! background work and timers. Background work (microphone, SDP, HTTP)
//! runs in spawned tasks whose completions come back through the queue
//! tagged with the generation of the media session they were started for,
//! so anything finishing after its session ended is discarded.

use callcore::types::{CallId, RemoteParty, format_duration};
use callcore::{
    CallError, CallSession, CallState, CallTransition, ControlCommand, ControlResponse,
    ErrorHistory, InvalidTransition, SignalingMessage, classify,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::error::{CommandError, MediaError};
use super::media::{
    AudioConstraints, ConnectionState, IceState, InboundAudioStats, LocalAudioCheck,
    MediaEngine, MediaSession, MediaSessionConfig, PeerEvent, PlaybackError, check_local_audio,
};
use super::recording::{RecordingHandle, RecordingStatus, RecordingTrigger};
use super::snapshot::{CallEvent, CallSnapshot};
use super::transport::SignalingTransport;

const EVENT_BUS_CAPACITY: usize = 64;
/// How long shutdown waits for the final control request to be delivered.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Armed on entering `Calling`, re-armed on entering `Establishing`.
    pub setup_timeout: Duration,
    /// How long `last_error` stays visible.
    pub error_display: Duration,
    pub error_history_len: usize,
    pub audio: AudioConstraints,
    pub media: MediaSessionConfig,
    /// Used when an incoming call does not name one.
    pub phone_number_id: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(30),
            error_display: Duration::from_secs(10),
            error_history_len: callcore::error::DEFAULT_ERROR_HISTORY,
            audio: AudioConstraints::default(),
            media: MediaSessionConfig::default(),
            phone_number_id: None,
        }
    }
}

#[derive(Debug)]
enum Command {
    Dial(String),
    Accept,
    Reject,
    Hangup,
    ToggleMute,
    SetMuted(bool),
    Reset,
    StopRecording,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Dial(_) => "dial",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Hangup => "hang up",
            Self::ToggleMute | Self::SetMuted(_) => "mute",
            Self::Reset => "reset",
            Self::StopRecording => "stop recording",
        }
    }
}

/// Background work that finished.
enum Completion {
    DialSent(Result<ControlResponse, CallError>),
    AcceptFinished(Result<(), CallError>),
    RemoteAnswerApplied(Result<(), CallError>),
    MediaClosed,
}

enum Event {
    Command {
        command: Command,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Signaling(SignalingMessage),
    SignalingClosed,
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    Completed {
        generation: u64,
        completion: Completion,
    },
    SetupTimeout {
        generation: u64,
        epoch: u64,
    },
    ClearError {
        generation: u64,
        epoch: u64,
    },
    Recording {
        generation: u64,
        status: RecordingStatus,
    },
    Playback {
        generation: u64,
        result: Result<(), PlaybackError>,
    },
    TestLocalAudio(oneshot::Sender<Result<LocalAudioCheck, CommandError>>),
    RetryPlayback(oneshot::Sender<Result<(), CommandError>>),
    Stats(oneshot::Sender<Result<Option<InboundAudioStats>, CommandError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front end of a running coordinator.
#[derive(Clone)]
pub struct CallHandle {
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<CallSnapshot>,
    bus: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    async fn command(&self, command: Command) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Command { command, reply })
            .map_err(|_| CommandError::CoordinatorStopped)?;
        rx.await.map_err(|_| CommandError::CoordinatorStopped)?
    }

    /// Places an outbound call.
    pub async fn dial(&self, remote: impl Into<String>) -> Result<(), CommandError> {
        self.command(Command::Dial(remote.into())).await
    }

    pub async fn accept(&self) -> Result<(), CommandError> {
        self.command(Command::Accept).await
    }

    pub async fn reject(&self) -> Result<(), CommandError> {
        self.command(Command::Reject).await
    }

    pub async fn hangup(&self) -> Result<(), CommandError> {
        self.command(Command::Hangup).await
    }

    /// Flips the mute flag and returns the new value.
    pub async fn toggle_mute(&self) -> Result<bool, CommandError> {
        self.command(Command::ToggleMute).await?;
        Ok(self.state.borrow().muted)
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CommandError> {
        self.command(Command::SetMuted(muted)).await
    }

    /// Returns a finished call to `Idle`.
    pub async fn reset(&self) -> Result<(), CommandError> {
        self.command(Command::Reset).await
    }

    pub async fn stop_recording(&self) -> Result<(), CommandError> {
        self.command(Command::StopRecording).await
    }

    async fn request<T>(
        &self,
        event: impl FnOnce(oneshot::Sender<Result<T, CommandError>>) -> Event,
    ) -> Result<T, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(event(reply))
            .map_err(|_| CommandError::CoordinatorStopped)?;
        rx.await.map_err(|_| CommandError::CoordinatorStopped)?
    }

    /// Opens and releases a throwaway microphone capture. Works with or
    /// without a call; the call's own capture is left untouched.
    pub async fn test_local_audio(&self) -> Result<LocalAudioCheck, CommandError> {
        self.request(Event::TestLocalAudio).await
    }

    /// Plays the remote audio again, typically after a user gesture lifted
    /// an autoplay block.
    pub async fn retry_playback(&self) -> Result<(), CommandError> {
        self.request(Event::RetryPlayback).await
    }

    /// Inbound audio statistics of the live call, if the engine reports any.
    pub async fn stats(&self) -> Result<Option<InboundAudioStats>, CommandError> {
        self.request(Event::Stats).await
    }

    /// Ends any live call, closes the transport and stops the coordinator.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.events.send(Event::Shutdown(done)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.bus.subscribe()
    }
}

pub struct CallCoordinator;

impl CallCoordinator {
    /// Starts the coordinator task. The transport is connected from inside
    /// the task.
    pub fn spawn(
        config: CoordinatorConfig,
        transport: Arc<dyn SignalingTransport>,
        engine: Arc<dyn MediaEngine>,
        recording: Option<RecordingTrigger>,
    ) -> CallHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallSnapshot::default());
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let coordinator = Coordinator {
            history: ErrorHistory::with_capacity(config.error_history_len),
            config,
            transport,
            engine,
            recording,
            events: events_tx.clone(),
            session: CallSession::new(),
            generation: 0,
            media: None,
            offer_sdp: None,
            phone_number_id: None,
            early_connected: false,
            established_at: None,
            accept_task: None,
            playback_blocked: false,
            timer_epoch: 0,
            setup_timer: None,
            error_epoch: 0,
            recording_handle: None,
            recording_status: None,
            status_text: None,
            state_tx,
            bus: bus.clone(),
        };
        tokio::spawn(coordinator.run(events_rx));

        CallHandle {
            events: events_tx,
            state: state_rx,
            bus,
        }
    }
}

struct Coordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn SignalingTransport>,
    engine: Arc<dyn MediaEngine>,
    recording: Option<RecordingTrigger>,
    events: mpsc::UnboundedSender<Event>,

    session: CallSession,
    /// Bumped for every new media session.
    generation: u64,
    media: Option<Arc<MediaSession>>,
    /// Remote offer of the ringing call.
    offer_sdp: Option<String>,
    phone_number_id: Option<String>,
    /// Media connected while the accept requests were still in flight.
    early_connected: bool,
    /// Kept past `Established` for the recording duration.
    established_at: Option<DateTime<Utc>>,
    /// Microphone, answer and accept requests; aborted on leaving `Accepting`.
    accept_task: Option<JoinHandle<()>>,
    playback_blocked: bool,

    timer_epoch: u64,
    setup_timer: Option<JoinHandle<()>>,
    error_epoch: u64,

    recording_handle: Option<RecordingHandle>,
    recording_status: Option<RecordingStatus>,
    status_text: Option<String>,
    history: ErrorHistory,

    state_tx: watch::Sender<CallSnapshot>,
    bus: broadcast::Sender<CallEvent>,
}

impl Coordinator {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        match self.transport.connect().await {
            Ok(mut inbound) => {
                let tx = self.events.clone();
                tokio::spawn(async move {
                    while let Some(message) = inbound.recv().await {
                        if tx.send(Event::Signaling(message)).is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Event::SignalingClosed);
                });
            }
            Err(e) => {
                warn!(target: "Call/Coordinator", "Signaling transport failed to connect: {e}");
                self.status_text = Some(callcore::signaling::DISCONNECTED.to_string());
                self.idle_error(e.to_call_error());
            }
        }
        self.publish();

        while let Some(event) = events.recv().await {
            match event {
                Event::Shutdown(done) => {
                    self.shutdown(&mut events).await;
                    let _ = done.send(());
                    return;
                }
                event => self.handle_event(event).await,
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Command { command, reply } => {
                let result = self.handle_command(command).await;
                let _ = reply.send(result);
            }
            Event::Signaling(message) => self.handle_signaling(message).await,
            Event::SignalingClosed => {
                debug!(target: "Call/Coordinator", "Signaling stream ended");
            }
            Event::Peer { generation, event } => {
                if generation == self.generation {
                    self.handle_peer_event(event).await;
                } else {
                    debug!(target: "Call/Coordinator", "Dropping peer event of generation {generation}");
                }
            }
            Event::Completed {
                generation,
                completion,
            } => self.handle_completion(generation, completion).await,
            Event::SetupTimeout { generation, epoch } => {
                if generation == self.generation && epoch == self.timer_epoch {
                    self.setup_timed_out().await;
                }
            }
            Event::ClearError { generation, epoch } => {
                if generation == self.generation && epoch == self.error_epoch {
                    self.session.last_error = None;
                    self.publish();
                }
            }
            Event::Recording { generation, status } => {
                if generation == self.generation {
                    self.recording_status = Some(status);
                    let _ = self.bus.send(CallEvent::RecordingStatus(status));
                    self.publish();
                }
            }
            Event::Playback { generation, result } => {
                if generation == self.generation {
                    self.playback_finished(result);
                }
            }
            Event::TestLocalAudio(reply) => {
                let engine = self.engine.clone();
                let audio = self.config.audio.clone();
                tokio::spawn(async move {
                    let result = check_local_audio(engine.as_ref(), &audio)
                        .await
                        .map_err(CommandError::Media);
                    let _ = reply.send(result);
                });
            }
            Event::RetryPlayback(reply) => match self.live_media() {
                Some(media) => self.spawn_playback(media, Some(reply)),
                None => {
                    let _ = reply.send(Err(self.invalid("retry playback")));
                }
            },
            Event::Stats(reply) => match self.live_media() {
                Some(media) => {
                    tokio::spawn(async move {
                        let _ = reply.send(media.stats().await.map_err(CommandError::Media));
                    });
                }
                None => {
                    let _ = reply.send(Err(self.invalid("read stats")));
                }
            },
            Event::Shutdown(_) => {}
        }
    }

    // ---- commands ----

    async fn handle_command(&mut self, command: Command) -> Result<(), CommandError> {
        let name = command.name();
        let result = match command {
            Command::Dial(remote) => self.dial(remote).await,
            Command::Accept => self.accept().await,
            Command::Reject => self.reject().await,
            Command::Hangup => self.hangup().await,
            Command::ToggleMute => self.set_muted(!self.session.muted),
            Command::SetMuted(muted) => self.set_muted(muted),
            Command::Reset => self.reset().await,
            Command::StopRecording => {
                self.stop_recording();
                Ok(())
            }
        };
        if let Err(e) = &result {
            debug!(target: "Call/Coordinator", "Refused {name}: {e}");
        }
        result
    }

    fn invalid(&self, command: &'static str) -> CommandError {
        CommandError::InvalidState {
            command,
            state: self.session.state,
        }
    }

    async fn dial(&mut self, raw: String) -> Result<(), CommandError> {
        let remote = RemoteParty::parse(raw).ok_or(CommandError::InvalidRemoteParty)?;
        if self.session.state.is_live() {
            return Err(self.invalid("dial"));
        }
        self.reset_if_terminal().await;
        self.new_media_session();
        self.transition(CallTransition::Dial {
            remote: remote.clone(),
        })
        .await
        .map_err(|_| self.invalid("dial"))?;

        let Some(media) = self.media.clone() else {
            return Ok(());
        };
        let transport = self.transport.clone();
        let audio = self.config.audio.clone();
        self.spawn_completion(async move {
            let result = async {
                media
                    .acquire_local_audio(&audio)
                    .await
                    .map_err(|e| e.to_call_error())?;
                let sdp_offer = media.create_offer().await.map_err(|e| e.to_call_error())?;
                transport
                    .send(ControlCommand::Dial {
                        to: remote,
                        sdp_offer,
                    })
                    .await
                    .map_err(|e| e.to_call_error())
            }
            .await;
            Completion::DialSent(result)
        });
        Ok(())
    }

    async fn accept(&mut self) -> Result<(), CommandError> {
        if !self.session.state.can_accept() {
            return Err(self.invalid("accept"));
        }
        let (Some(media), Some(call_id), Some(offer)) = (
            self.media.clone(),
            self.session.id.clone(),
            self.offer_sdp.clone(),
        ) else {
            return Err(self.invalid("accept"));
        };
        self.transition(CallTransition::LocalAccept)
            .await
            .map_err(|_| self.invalid("accept"))?;

        let transport = self.transport.clone();
        let audio = self.config.audio.clone();
        let phone_number_id = self.phone_number_id.clone();
        self.accept_task = Some(self.spawn_completion(async move {
            let result = async {
                media
                    .acquire_local_audio(&audio)
                    .await
                    .map_err(|e| e.to_call_error())?;
                let sdp = media
                    .create_answer(&offer)
                    .await
                    .map_err(|e| e.to_call_error())?;

                let pre_accept = ControlCommand::PreAccept {
                    call_id: call_id.clone(),
                    sdp: sdp.clone(),
                    phone_number_id: phone_number_id.clone(),
                };
                let accept = ControlCommand::Accept {
                    call_id,
                    sdp,
                    phone_number_id,
                };
                for command in [pre_accept, accept] {
                    if media.is_closed() {
                        return Err(MediaError::Closed.to_call_error());
                    }
                    let response = transport
                        .send(command)
                        .await
                        .map_err(|e| e.to_call_error())?;
                    if let Some(text) = response.failure_text() {
                        return Err(classify(text, None));
                    }
                }
                Ok(())
            }
            .await;
            Completion::AcceptFinished(result)
        }));
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), CommandError> {
        if !self.session.state.can_reject() {
            return Err(self.invalid("reject"));
        }
        let command = self.end_command(CallState::Ringing);
        self.transition(CallTransition::LocalReject)
            .await
            .map_err(|_| self.invalid("reject"))?;
        if let Some(command) = command {
            self.send_in_background(command);
        }
        Ok(())
    }

    /// The control request that ends a call currently in `state`.
    fn end_command(&self, state: CallState) -> Option<ControlCommand> {
        let call_id = self.session.id.clone()?;
        let phone_number_id = self.phone_number_id.clone();
        Some(match state {
            CallState::Ringing => ControlCommand::Reject {
                call_id,
                phone_number_id,
            },
            // Outbound calls were never answered; inbound ones were.
            CallState::Calling => ControlCommand::Cancel {
                call_id,
                phone_number_id,
            },
            _ => ControlCommand::Terminate {
                call_id,
                phone_number_id,
            },
        })
    }

    /// Ends the call according to the state it is in right now.
    async fn hangup(&mut self) -> Result<(), CommandError> {
        let state = self.session.state;
        match state {
            CallState::Established => {
                let command = self.end_command(state);
                self.transition(CallTransition::Hangup)
                    .await
                    .map_err(|_| self.invalid("hang up"))?;
                let transport = self.transport.clone();
                let media = self.media.clone();
                self.spawn_completion(async move {
                    if let Some(command) = command {
                        deliver(transport.as_ref(), command).await;
                    }
                    if let Some(media) = media {
                        media.close().await;
                    }
                    Completion::MediaClosed
                });
                Ok(())
            }
            CallState::Ringing => self.reject().await,
            state if state.is_pre_answer() => {
                let command = self.end_command(state);
                self.transition(CallTransition::Hangup)
                    .await
                    .map_err(|_| self.invalid("hang up"))?;
                if let Some(command) = command {
                    self.send_in_background(command);
                }
                Ok(())
            }
            _ => Err(self.invalid("hang up")),
        }
    }

    fn set_muted(&mut self, muted: bool) -> Result<(), CommandError> {
        if !self.session.state.is_live() {
            return Err(self.invalid("mute"));
        }
        self.session.muted = match &self.media {
            Some(media) => {
                media.set_muted(muted).map_err(|_| self.invalid("mute"))?;
                media.is_muted()
            }
            None => muted,
        };
        info!(target: "Call/Coordinator", "Microphone {}", if muted { "muted" } else { "unmuted" });
        self.publish();
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), CommandError> {
        match self.session.state {
            CallState::Idle => Ok(()),
            state if state.is_terminal() => {
                self.reset_if_terminal().await;
                Ok(())
            }
            _ => Err(self.invalid("reset")),
        }
    }

    // ---- signaling ----

    async fn handle_signaling(&mut self, message: SignalingMessage) {
        debug!(target: "Call/Coordinator", "Signaling message: {}", message.kind());
        match message {
            SignalingMessage::IncomingCall {
                call_id,
                from,
                sdp,
                phone_number_id,
            } => {
                self.incoming_call(call_id, from, sdp, phone_number_id)
                    .await
            }
            SignalingMessage::RemoteAnswer { call_id, sdp } => {
                self.remote_answer(call_id, sdp).await
            }
            SignalingMessage::ConnectionStatus { text } => self.connection_status(text).await,
            message => match self.session.transition_for(&message) {
                Some(transition) => {
                    if let Err(e) = self.transition(transition).await {
                        warn!(target: "Call/Coordinator", "{e}");
                    }
                }
                None => {
                    debug!(
                        target: "Call/Coordinator",
                        "Ignoring {} for {:?} while {}",
                        message.kind(),
                        message.call_id(),
                        self.session.state
                    );
                }
            },
        }
    }

    async fn incoming_call(
        &mut self,
        call_id: CallId,
        from: String,
        sdp: String,
        phone_number_id: Option<String>,
    ) {
        let phone_number_id = phone_number_id.or_else(|| self.config.phone_number_id.clone());
        if self.session.state.is_live() {
            if self.session.id.as_ref() == Some(&call_id) {
                debug!(target: "Call/Coordinator", "Duplicate offer for {call_id}");
            } else {
                warn!(
                    target: "Call/Coordinator",
                    "Rejecting {call_id}: already {} with another call",
                    self.session.state
                );
                self.send_in_background(ControlCommand::Reject {
                    call_id,
                    phone_number_id,
                });
            }
            return;
        }
        let Some(remote) = RemoteParty::parse(from) else {
            warn!(target: "Call/Coordinator", "Incoming call {call_id} has no caller, ignoring");
            return;
        };

        info!(target: "Call/Coordinator", "Incoming call {call_id} from {remote}");
        self.reset_if_terminal().await;
        self.new_media_session();
        self.offer_sdp = Some(sdp);
        self.phone_number_id = phone_number_id;
        if let Err(e) = self
            .transition(CallTransition::IncomingOffer { call_id, remote })
            .await
        {
            warn!(target: "Call/Coordinator", "{e}");
        }
    }

    async fn remote_answer(&mut self, call_id: Option<CallId>, sdp: String) {
        if !self.session.owns(call_id.as_ref()) {
            debug!(target: "Call/Coordinator", "Ignoring answer for foreign call {call_id:?}");
            return;
        }
        match self.session.state {
            CallState::Calling => {
                if self.session.id.is_none() {
                    self.session.id = call_id;
                }
                if let Err(e) = self.transition(CallTransition::RemoteAnswer).await {
                    warn!(target: "Call/Coordinator", "{e}");
                    return;
                }
                let Some(media) = self.media.clone() else {
                    return;
                };
                self.spawn_completion(async move {
                    let result = media
                        .apply_remote_answer(&sdp)
                        .await
                        .map_err(|e| e.to_call_error());
                    Completion::RemoteAnswerApplied(result)
                });
            }
            CallState::Accepting | CallState::Establishing | CallState::Established => {
                info!(target: "Call/Coordinator", "Backend confirmed the call connection");
            }
            state => {
                debug!(target: "Call/Coordinator", "Ignoring late answer while {state}");
            }
        }
    }

    async fn connection_status(&mut self, text: String) {
        let disconnected = text == callcore::signaling::DISCONNECTED;
        info!(target: "Call/Coordinator", "Signaling status: {text}");
        self.status_text = Some(text.clone());
        let _ = self.bus.send(CallEvent::ConnectionStatus(text));

        if disconnected {
            let error = CallError::transport_disconnected("signaling connection lost");
            match self.session.state {
                CallState::Established | CallState::Terminating => {
                    warn!(target: "Call/Coordinator", "Signaling lost while {}", self.session.state);
                }
                state if state.is_live() => {
                    let _ = self.transition(CallTransition::Fatal { error }).await;
                    return;
                }
                _ => self.idle_error(error),
            }
        }
        self.publish();
    }

    // ---- peer events ----

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(media) = self.media.clone() else {
            return;
        };
        media.observe(&event);
        match event {
            PeerEvent::Track(stream) => {
                if media.attach_remote_stream(stream) {
                    self.spawn_playback(media, None);
                }
            }
            PeerEvent::ConnectionState(ConnectionState::Connected) => self.media_connected().await,
            PeerEvent::IceState(state) if state.is_connected() => self.media_connected().await,
            PeerEvent::ConnectionState(ConnectionState::Failed)
            | PeerEvent::IceState(IceState::Failed) => {
                if self.session.state.is_live() {
                    let error = CallError::negotiation_failed("peer connection failed");
                    let _ = self.transition(CallTransition::Fatal { error }).await;
                    return;
                }
            }
            PeerEvent::ConnectionState(ConnectionState::Disconnected)
            | PeerEvent::IceState(IceState::Disconnected) => {
                warn!(target: "Call/Coordinator", "Media connection interrupted");
            }
            _ => {}
        }
        self.publish();
    }

    async fn media_connected(&mut self) {
        match self.session.state {
            CallState::Establishing => {
                let _ = self.transition(CallTransition::MediaConnected).await;
            }
            CallState::Accepting => self.early_connected = true,
            _ => {}
        }
    }

    // ---- completions and timers ----

    async fn handle_completion(&mut self, generation: u64, completion: Completion) {
        let current = generation == self.generation && self.session.state.is_live();
        match completion {
            Completion::DialSent(result) => {
                if !current {
                    // The call was abandoned while the dial was in flight.
                    if let Ok(ControlResponse {
                        call_id: Some(call_id),
                        ..
                    }) = result
                    {
                        info!(target: "Call/Coordinator", "Cancelling abandoned call {call_id}");
                        self.send_in_background(ControlCommand::Cancel {
                            call_id,
                            phone_number_id: None,
                        });
                    }
                    return;
                }
                let error = match result {
                    Ok(response) => match response.failure_text() {
                        None => {
                            if let Some(call_id) = response.call_id {
                                info!(target: "Call/Coordinator", "Backend assigned call id {call_id}");
                                self.session.id.get_or_insert(call_id);
                                self.publish();
                            }
                            return;
                        }
                        Some(text) => classify(text, None),
                    },
                    Err(error) => error,
                };
                let _ = self.transition(CallTransition::Fatal { error }).await;
            }
            Completion::AcceptFinished(result) => {
                if !current || self.session.state != CallState::Accepting {
                    debug!(target: "Call/Coordinator", "Discarding stale accept completion");
                    return;
                }
                match result {
                    Ok(()) => {
                        let _ = self.transition(CallTransition::AcceptConfirmed).await;
                        if self.early_connected {
                            let _ = self.transition(CallTransition::MediaConnected).await;
                        }
                    }
                    Err(error) => {
                        if let Some(call_id) = self.session.id.clone() {
                            self.send_in_background(ControlCommand::Reject {
                                call_id,
                                phone_number_id: self.phone_number_id.clone(),
                            });
                        }
                        let _ = self.transition(CallTransition::Fatal { error }).await;
                    }
                }
            }
            Completion::RemoteAnswerApplied(result) => {
                if let (true, Err(error)) = (current, result) {
                    let _ = self.transition(CallTransition::Fatal { error }).await;
                }
            }
            Completion::MediaClosed => {
                if generation == self.generation && self.session.state == CallState::Terminating {
                    let _ = self.transition(CallTransition::MediaClosed).await;
                }
            }
        }
    }

    fn playback_finished(&mut self, result: Result<(), PlaybackError>) {
        let blocked = result == Err(PlaybackError::Blocked);
        if blocked && !self.playback_blocked {
            warn!(target: "Call/Coordinator", "Remote audio blocked until the user interacts");
            let _ = self.bus.send(CallEvent::PlaybackBlocked);
        }
        self.playback_blocked = blocked;
        self.publish();
    }

    async fn setup_timed_out(&mut self) {
        let state = self.session.state;
        if !matches!(state, CallState::Calling | CallState::Establishing) {
            return;
        }
        warn!(target: "Call/Coordinator", "Call setup timed out while {state}");
        let call_id = self.session.id.clone();
        let error = CallError::timeout(format!(
            "no media after {}s",
            self.config.setup_timeout.as_secs()
        ));
        if self
            .transition(CallTransition::Timeout { error })
            .await
            .is_ok()
        {
            if let Some(call_id) = call_id {
                self.send_in_background(ControlCommand::Cancel {
                    call_id,
                    phone_number_id: self.phone_number_id.clone(),
                });
            }
        }
    }

    fn arm_setup_timer(&mut self) {
        self.disarm_setup_timer();
        let tx = self.events.clone();
        let generation = self.generation;
        let epoch = self.timer_epoch;
        let timeout = self.config.setup_timeout;
        self.setup_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Event::SetupTimeout { generation, epoch });
        }));
    }

    fn disarm_setup_timer(&mut self) {
        self.timer_epoch += 1;
        if let Some(timer) = self.setup_timer.take() {
            timer.abort();
        }
    }

    fn schedule_error_clear(&mut self) {
        self.error_epoch += 1;
        let tx = self.events.clone();
        let generation = self.generation;
        let epoch = self.error_epoch;
        let window = self.config.error_display;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(Event::ClearError { generation, epoch });
        });
    }

    // ---- state ----

    async fn transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let from = self.session.state;
        let name = transition.name();
        self.session.apply_transition(transition)?;
        let to = self.session.state;
        info!(target: "Call/Coordinator", "{from} -> {to} ({name})");
        let _ = self.bus.send(CallEvent::StateChanged {
            from,
            to,
            call_id: self.session.id.clone(),
        });
        self.on_enter(to).await;
        self.publish();
        Ok(())
    }

    async fn on_enter(&mut self, state: CallState) {
        match state {
            CallState::Calling | CallState::Establishing => self.arm_setup_timer(),
            _ => self.disarm_setup_timer(),
        }
        if state != CallState::Accepting {
            if let Some(task) = self.accept_task.take() {
                task.abort();
            }
        }
        match state {
            CallState::Established => {
                self.established_at = self.session.started_at;
                self.start_recording();
            }
            CallState::Terminating => self.stop_recording(),
            CallState::Terminated | CallState::Failed => self.enter_terminal().await,
            _ => {}
        }
    }

    async fn enter_terminal(&mut self) {
        self.stop_recording();
        if let Some(media) = &self.media {
            media.close().await;
        }
        if let Some(error) = self.session.last_error.clone() {
            warn!(target: "Call/Coordinator", "Call failed: {error}");
            self.push_error(error);
            self.schedule_error_clear();
        }
    }

    fn push_error(&mut self, error: CallError) {
        self.history.push(error.clone());
        let _ = self.bus.send(CallEvent::Error(error));
    }

    /// Reports an error that is not tied to a call in progress.
    fn idle_error(&mut self, error: CallError) {
        self.session.last_error = Some(error.clone());
        self.push_error(error);
        self.schedule_error_clear();
    }

    async fn reset_if_terminal(&mut self) {
        if self.session.state.is_terminal() {
            let _ = self.transition(CallTransition::Reset).await;
            self.media = None;
            self.offer_sdp = None;
            self.established_at = None;
        }
    }

    fn new_media_session(&mut self) {
        self.generation += 1;
        self.early_connected = false;
        self.playback_blocked = false;
        self.recording_status = None;

        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let tx = self.events.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                if tx.send(Event::Peer { generation, event }).is_err() {
                    return;
                }
            }
        });
        self.media = Some(Arc::new(MediaSession::new(
            self.engine.clone(),
            self.config.media.clone(),
            peer_tx,
        )));
    }

    fn start_recording(&mut self) {
        let (Some(trigger), Some(media)) = (&self.recording, &self.media) else {
            return;
        };
        if !trigger.is_enabled() {
            debug!(target: "Call/Coordinator", "Recording disabled");
            return;
        }
        let tx = self.events.clone();
        let generation = self.generation;
        self.recording_handle = Some(trigger.start(
            media.clone(),
            Box::new(move |status| {
                let _ = tx.send(Event::Recording { generation, status });
            }),
        ));
    }

    fn stop_recording(&mut self) {
        if let Some(handle) = self.recording_handle.take() {
            let duration = self
                .established_at
                .map(|at| format_duration(Utc::now().signed_duration_since(at)))
                .unwrap_or_else(|| callcore::types::ZERO_DURATION.to_string());
            // The upload outlives the call.
            drop(handle.stop(self.session.id.clone(), duration));
        }
    }

    fn spawn_completion<F>(&self, work: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = Completion> + Send + 'static,
    {
        let tx = self.events.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let completion = work.await;
            let _ = tx.send(Event::Completed {
                generation,
                completion,
            });
        })
    }

    /// Fire-and-forget control request; the outcome is only logged.
    fn send_in_background(&self, command: ControlCommand) {
        let transport = self.transport.clone();
        tokio::spawn(async move { deliver(transport.as_ref(), command).await });
    }

    fn live_media(&self) -> Option<Arc<MediaSession>> {
        self.media
            .clone()
            .filter(|media| self.session.state.is_live() && !media.is_closed())
    }

    fn spawn_playback(
        &self,
        media: Arc<MediaSession>,
        reply: Option<oneshot::Sender<Result<(), CommandError>>>,
    ) {
        let tx = self.events.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = media.play_remote().await;
            let _ = tx.send(Event::Playback {
                generation,
                result: result.clone(),
            });
            if let Some(reply) = reply {
                let _ = reply.send(result.map_err(CommandError::Playback));
            }
        });
    }

    fn publish(&self) {
        let snapshot = CallSnapshot {
            state: self.session.state,
            direction: self.session.direction,
            call_id: self.session.id.clone(),
            remote_party: self.session.remote_party.clone(),
            muted: self.session.muted,
            established_at: self.session.started_at,
            last_error: self.session.last_error.clone(),
            recording_status: self.recording_status,
            status_text: self.status_text.clone(),
            connection_state: self
                .media
                .as_ref()
                .map(|m| m.connection_state())
                .unwrap_or_default(),
            ice_state: self
                .media
                .as_ref()
                .map(|m| m.ice_state())
                .unwrap_or_default(),
            playback_blocked: self.playback_blocked,
            error_history: self.history.to_vec(),
        };
        self.state_tx.send_replace(snapshot);
    }

    /// Ends a live call and waits, bounded by [`SHUTDOWN_GRACE`], for its
    /// final control request before the transport goes away.
    async fn shutdown(&mut self, events: &mut mpsc::UnboundedReceiver<Event>) {
        info!(target: "Call/Coordinator", "Shutting down");
        match self.session.state {
            CallState::Terminating => {
                // The terminate request is already in flight.
                let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                    while self.session.state == CallState::Terminating {
                        match events.recv().await {
                            Some(Event::Completed {
                                generation,
                                completion,
                            }) => self.handle_completion(generation, completion).await,
                            Some(_) => {}
                            None => break,
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    warn!(target: "Call/Coordinator", "Terminate still pending at shutdown");
                }
            }
            state if state.is_live() => {
                let command = self.end_command(state);
                let transition = if state == CallState::Ringing {
                    CallTransition::LocalReject
                } else {
                    CallTransition::Hangup
                };
                if self.transition(transition).await.is_ok() {
                    if let Some(command) = command {
                        let name = command.name();
                        let delivery = deliver(self.transport.as_ref(), command);
                        if tokio::time::timeout(SHUTDOWN_GRACE, delivery).await.is_err() {
                            warn!(target: "Call/Coordinator", "{name} not confirmed before shutdown");
                        }
                    }
                    if self.session.state == CallState::Terminating {
                        if let Some(media) = &self.media {
                            media.close().await;
                        }
                        let _ = self.transition(CallTransition::MediaClosed).await;
                    }
                }
            }
            _ => {}
        }
        self.disarm_setup_timer();
        self.stop_recording();
        if let Some(media) = &self.media {
            media.close().await;
        }
        self.transport.close().await;
    }
}

/// Sends a control request and logs the outcome.
async fn deliver(transport: &dyn SignalingTransport, command: ControlCommand) {
    let name = command.name();
    match transport.send(command).await {
        Ok(response) => match response.failure_text() {
            None => debug!(target: "Call/Coordinator", "{name} delivered"),
            Some(text) => warn!(target: "Call/Coordinator", "{name} refused: {text}"),
        },
        Err(e) => warn!(target: "Call/Coordinator", "{name} failed: {e}"),
    }
}
