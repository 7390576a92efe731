//! Automatic call recording.
//!
//! Once a call is established the trigger waits for both audio streams,
//! records them mixed into one stream, and on stop uploads the result as a
//! single artifact. Nothing here ever changes call state; failures surface
//! only as a [`RecordingStatus`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use callcore::types::CallId;
use chrono::{SecondsFormat, Utc};
use log::{debug, info, warn};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::error::RecordingError;
use super::media::{LocalAudioStream, MediaSession, RemoteAudioStream};

pub const DEFAULT_UPLOAD_URL: &str = "http://localhost:3000/api/upload-recording";
pub const DEFAULT_MIME_TYPE: &str = "audio/webm;codecs=opus";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Recording a call may need the remote party's consent; deployments
    /// that cannot obtain it turn this off.
    pub enabled: bool,
    pub upload_url: String,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub timeslice_ms: u64,
    pub mime_type: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            poll_interval_ms: 500,
            max_attempts: 6,
            timeslice_ms: 1000,
            mime_type: DEFAULT_MIME_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStatus {
    Started,
    StartFailed,
    Processing,
    Uploading,
    Saved,
    SaveFailed,
    UploadFailed,
    NoData,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "Call recording started automatically",
            Self::StartFailed => "failed to start",
            Self::Processing => "Processing recording...",
            Self::Uploading => "Uploading recording...",
            Self::Saved => "Call recording saved successfully",
            Self::SaveFailed => "Failed to save recording",
            Self::UploadFailed => "Failed to upload recording",
            Self::NoData => "No recording data to send",
        }
    }

    /// No further status follows this one.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::StartFailed | Self::Saved | Self::SaveFailed | Self::UploadFailed | Self::NoData
        )
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingOptions {
    pub mime_type: String,
    /// How often the recorder emits an encoded chunk.
    pub timeslice: Duration,
}

/// A recorder that mixes both call directions into one encoded stream.
pub trait MixedStreamRecorder: Send + Sync {
    /// Starts recording. Encoded chunks are sent on `chunks` as they are
    /// produced.
    fn start(
        &self,
        local: Arc<dyn LocalAudioStream>,
        remote: Arc<dyn RemoteAudioStream>,
        options: &RecordingOptions,
        chunks: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Box<dyn ActiveRecording>, RecordingError>;
}

#[async_trait]
pub trait ActiveRecording: Send {
    /// Stops the recorder. Every chunk has been sent once this resolves.
    async fn stop(self: Box<Self>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingArtifact {
    pub data: Bytes,
    /// Container type without codec parameters, e.g. `audio/webm`.
    pub mime_type: String,
    pub file_name: String,
}

impl RecordingArtifact {
    fn from_chunks(chunks: Vec<Bytes>, mime_type: &str, call_id: Option<&CallId>) -> Self {
        let mut data = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks {
            data.extend_from_slice(&chunk);
        }
        let mime_type = mime_type
            .split(';')
            .next()
            .unwrap_or(mime_type)
            .trim()
            .to_string();
        let file_name = format!(
            "call_{}_{}.webm",
            sanitize_file_name(call_id.map_or("unknown", CallId::as_str)),
            Utc::now().timestamp_millis()
        );
        Self {
            data: data.freeze(),
            mime_type,
            file_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingMetadata {
    pub call_id: Option<CallId>,
    /// `mm:ss`.
    pub duration: String,
    /// ISO-8601, millisecond precision.
    pub timestamp: String,
}

#[async_trait]
pub trait RecordingUploader: Send + Sync {
    async fn upload(
        &self,
        artifact: RecordingArtifact,
        metadata: RecordingMetadata,
    ) -> Result<(), RecordingError>;
}

/// Replaces everything outside `[A-Za-z0-9._-]` so a call id can never
/// break out of the `Content-Disposition` header.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Deserialize)]
struct UploadReply {
    #[serde(default)]
    success: bool,
}

/// Posts recordings as `multipart/form-data` to an upload endpoint that
/// answers `{"success": bool}`.
pub struct HttpRecordingUploader {
    client: reqwest::Client,
    url: String,
}

impl HttpRecordingUploader {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RecordingUploader for HttpRecordingUploader {
    async fn upload(
        &self,
        artifact: RecordingArtifact,
        metadata: RecordingMetadata,
    ) -> Result<(), RecordingError> {
        let call_id = metadata
            .call_id
            .as_ref()
            .map_or("unknown", CallId::as_str)
            .to_string();
        let recording = Part::bytes(artifact.data.to_vec())
            .file_name(sanitize_file_name(&artifact.file_name))
            .mime_str(&artifact.mime_type)
            .map_err(|e| RecordingError::Upload(e.into()))?;
        let form = Form::new()
            .part("recording", recording)
            .text("call_id", call_id)
            .text("duration", metadata.duration)
            .text("timestamp", metadata.timestamp);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RecordingError::Upload(e.into()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecordingError::Upload(anyhow::anyhow!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let reply: UploadReply = response
            .json()
            .await
            .map_err(|e| RecordingError::Upload(e.into()))?;
        if reply.success {
            Ok(())
        } else {
            Err(RecordingError::Rejected)
        }
    }
}

pub type StatusCallback = Box<dyn Fn(RecordingStatus) + Send + Sync>;

struct StopRequest {
    call_id: Option<CallId>,
    duration: String,
}

/// A running recording task.
pub struct RecordingHandle {
    stop: oneshot::Sender<StopRequest>,
    task: JoinHandle<()>,
}

impl RecordingHandle {
    /// Finalizes the recording and uploads it. The returned task resolves
    /// once the upload has finished.
    pub fn stop(self, call_id: Option<CallId>, duration: impl Into<String>) -> JoinHandle<()> {
        let request = StopRequest {
            call_id,
            duration: duration.into(),
        };
        if self.stop.send(request).is_err() {
            debug!(target: "Call/Recording", "Recording already finished");
        }
        self.task
    }
}

/// Starts a recording whenever a call becomes established.
pub struct RecordingTrigger {
    recorder: Arc<dyn MixedStreamRecorder>,
    uploader: Arc<dyn RecordingUploader>,
    config: RecordingConfig,
}

impl RecordingTrigger {
    pub fn new(
        recorder: Arc<dyn MixedStreamRecorder>,
        uploader: Arc<dyn RecordingUploader>,
        config: RecordingConfig,
    ) -> Self {
        Self {
            recorder,
            uploader,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn start(&self, media: Arc<MediaSession>, on_status: StatusCallback) -> RecordingHandle {
        let (stop, stop_rx) = oneshot::channel();
        let run = RecordingRun {
            media,
            recorder: self.recorder.clone(),
            uploader: self.uploader.clone(),
            config: self.config.clone(),
            on_status,
        };
        RecordingHandle {
            stop,
            task: tokio::spawn(run.run(stop_rx)),
        }
    }
}

struct RecordingRun {
    media: Arc<MediaSession>,
    recorder: Arc<dyn MixedStreamRecorder>,
    uploader: Arc<dyn RecordingUploader>,
    config: RecordingConfig,
    on_status: StatusCallback,
}

impl RecordingRun {
    fn status(&self, status: RecordingStatus) {
        info!(target: "Call/Recording", "{status}");
        (self.on_status)(status);
    }

    async fn wait_for_streams(
        &self,
    ) -> Option<(Arc<dyn LocalAudioStream>, Arc<dyn RemoteAudioStream>)> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        for attempt in 1..=self.config.max_attempts {
            if self.media.is_closed() {
                return None;
            }
            if let (Some(local), Some(remote)) =
                (self.media.local_stream(), self.media.remote_stream())
            {
                return Some((local, remote));
            }
            debug!(target: "Call/Recording", "Streams not ready, attempt {attempt}/{}", self.config.max_attempts);
            if attempt < self.config.max_attempts {
                tokio::time::sleep(interval).await;
            }
        }
        None
    }

    async fn run(self, mut stop_rx: oneshot::Receiver<StopRequest>) {
        let streams = tokio::select! {
            streams = self.wait_for_streams() => streams,
            _ = &mut stop_rx => {
                debug!(target: "Call/Recording", "Call ended before recording started");
                return;
            }
        };
        let Some((local, remote)) = streams else {
            warn!(target: "Call/Recording", "Audio streams never became available");
            self.status(RecordingStatus::StartFailed);
            return;
        };

        let options = RecordingOptions {
            mime_type: self.config.mime_type.clone(),
            timeslice: Duration::from_millis(self.config.timeslice_ms),
        };
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let active = match self.recorder.start(local, remote, &options, chunk_tx) {
            Ok(active) => active,
            Err(e) => {
                warn!(target: "Call/Recording", "Failed to start recorder: {e}");
                self.status(RecordingStatus::StartFailed);
                return;
            }
        };
        self.status(RecordingStatus::Started);

        let mut chunks = Vec::new();
        let mut receiving = true;
        let request = loop {
            tokio::select! {
                chunk = chunk_rx.recv(), if receiving => match chunk {
                    Some(chunk) => chunks.push(chunk),
                    None => receiving = false,
                },
                request = &mut stop_rx => break request,
            }
        };

        self.status(RecordingStatus::Processing);
        active.stop().await;
        while let Ok(chunk) = chunk_rx.try_recv() {
            chunks.push(chunk);
        }

        let Ok(request) = request else {
            debug!(target: "Call/Recording", "Recording handle dropped, discarding data");
            return;
        };
        chunks.retain(|chunk| !chunk.is_empty());
        if chunks.is_empty() {
            self.status(RecordingStatus::NoData);
            return;
        }

        let artifact =
            RecordingArtifact::from_chunks(chunks, &self.config.mime_type, request.call_id.as_ref());
        let metadata = RecordingMetadata {
            call_id: request.call_id,
            duration: request.duration,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        info!(
            target: "Call/Recording",
            "Uploading {} ({} bytes)", artifact.file_name, artifact.data.len()
        );
        self.status(RecordingStatus::Uploading);
        let status = match self.uploader.upload(artifact, metadata).await {
            Ok(()) => RecordingStatus::Saved,
            Err(RecordingError::Rejected) => RecordingStatus::SaveFailed,
            Err(e) => {
                warn!(target: "Call/Recording", "Recording upload failed: {e}");
                RecordingStatus::UploadFailed
            }
        };
        self.status(status);
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockActiveRecording;

    #[async_trait]
    impl ActiveRecording for MockActiveRecording {
        async fn stop(self: Box<Self>) {}
    }

    /// Emits a single chunk as soon as it starts.
    #[derive(Default)]
    pub struct MockRecorder {
        pub starts: AtomicUsize,
    }

    impl MixedStreamRecorder for MockRecorder {
        fn start(
            &self,
            _local: Arc<dyn LocalAudioStream>,
            _remote: Arc<dyn RemoteAudioStream>,
            _options: &RecordingOptions,
            chunks: mpsc::UnboundedSender<Bytes>,
        ) -> Result<Box<dyn ActiveRecording>, RecordingError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let _ = chunks.send(Bytes::from_static(b"OggS"));
            Ok(Box::new(MockActiveRecording))
        }
    }

    #[derive(Default)]
    pub struct MockUploader {
        pub uploads: Mutex<Vec<(RecordingArtifact, RecordingMetadata)>>,
    }

    #[async_trait]
    impl RecordingUploader for MockUploader {
        async fn upload(
            &self,
            artifact: RecordingArtifact,
            metadata: RecordingMetadata,
        ) -> Result<(), RecordingError> {
            self.uploads.lock().unwrap().push((artifact, metadata));
            Ok(())
        }
    }
}
