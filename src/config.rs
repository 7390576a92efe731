//! Runtime configuration, loaded from an optional JSON file.

use callcore::sdp::CodecPreferences;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::calls::coordinator::CoordinatorConfig;
use crate::calls::media::{
    AudioConstraints, IceServer, MediaSessionConfig, PeerConnectionConfig, PlaybackRetry,
};
use crate::calls::recording::RecordingConfig;
use crate::calls::transports::sse::DEFAULT_REGISTER_PATH;
use crate::calls::transports::{ControlEndpoints, SipRegistration};

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3000";
pub const DEFAULT_WS_URL: &str = "wss://webhook-service-meta.onrender.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// WebSocket relay of WhatsApp webhooks.
    #[default]
    WebhookWs,
    /// Server-sent events from the WhatsApp Business API backend.
    Sse,
    /// SIP over WebSocket.
    Sip,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WebhookWs => "webhook_ws",
            Self::Sse => "sse",
            Self::Sip => "sip",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub setup_secs: u64,
    pub error_display_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            setup_secs: 30,
            error_display_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub backend_url: String,
    pub transport: TransportKind,
    pub ws_url: String,
    pub sse_path: String,
    /// Control request paths; the transport's preset when absent.
    pub endpoints: Option<ControlEndpoints>,
    pub phone_number_id: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    pub sip: SipRegistration,
    pub timeouts: Timeouts,
    pub error_history_len: usize,
    pub audio: AudioConstraints,
    pub codecs: CodecPreferences,
    pub recording: RecordingConfig,
    pub playback: PlaybackRetry,
}

impl Default for CallConfig {
    fn default() -> Self {
        let peer = PeerConnectionConfig::default();
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            transport: TransportKind::default(),
            ws_url: DEFAULT_WS_URL.to_string(),
            sse_path: DEFAULT_REGISTER_PATH.to_string(),
            endpoints: None,
            phone_number_id: None,
            ice_servers: peer.ice_servers,
            ice_candidate_pool_size: peer.ice_candidate_pool_size,
            sip: SipRegistration::default(),
            timeouts: Timeouts::default(),
            error_history_len: callcore::error::DEFAULT_ERROR_HISTORY,
            audio: AudioConstraints::default(),
            codecs: CodecPreferences::default(),
            recording: RecordingConfig::default(),
            playback: PlaybackRetry::default(),
        }
    }
}

impl CallConfig {
    /// Reads and validates `path`, or returns the defaults when there is none.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.backend_url.trim().is_empty() {
            return invalid("backend_url must not be empty".into());
        }
        if self.transport == TransportKind::WebhookWs && self.ws_url.trim().is_empty() {
            return invalid("ws_url must not be empty for the webhook transport".into());
        }
        if self.transport == TransportKind::Sip && self.sip.server.trim().is_empty() {
            return invalid("sip.server must be set for the SIP transport".into());
        }
        if self.recording.enabled && self.recording.upload_url.trim().is_empty() {
            return invalid("recording.upload_url must not be empty".into());
        }
        if self.timeouts.setup_secs == 0 || self.timeouts.error_display_secs == 0 {
            return invalid("timeouts must be greater than zero".into());
        }
        if self.recording.poll_interval_ms == 0 || self.recording.max_attempts == 0 {
            return invalid("recording polling must be greater than zero".into());
        }
        if let Some(pt) = self.codecs.duplicate_payload_type() {
            return invalid(format!("payload type {pt} is assigned to more than one codec"));
        }
        Ok(())
    }

    pub fn endpoints(&self) -> ControlEndpoints {
        match (&self.endpoints, self.transport) {
            (Some(endpoints), _) => endpoints.clone(),
            (None, TransportKind::Sse) => ControlEndpoints::waba(),
            (None, _) => ControlEndpoints::webhook_relay(),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            setup_timeout: Duration::from_secs(self.timeouts.setup_secs),
            error_display: Duration::from_secs(self.timeouts.error_display_secs),
            error_history_len: self.error_history_len,
            audio: self.audio.clone(),
            media: MediaSessionConfig {
                peer: PeerConnectionConfig {
                    ice_servers: self.ice_servers.clone(),
                    ice_candidate_pool_size: self.ice_candidate_pool_size,
                },
                codecs: self.codecs.clone(),
                playback: self.playback.clone(),
            },
            phone_number_id: self.phone_number_id.clone(),
        }
    }
}
