//! WhatsApp Business calling.
//!
//! # Architecture
//!
//! - [`SignalingTransport`]: one inbound stream of signaling messages and
//!   delivery of control requests, over the webhook relay, SSE or SIP
//! - [`MediaSession`]: local capture, peer connection and remote stream of
//!   one call, on top of a host-supplied [`MediaEngine`]
//! - [`CallCoordinator`]: the single owner of call state, driven through a
//!   [`CallHandle`]
//! - [`RecordingTrigger`]: records established calls and uploads them
//!
//! State machine, wire format and error normalization live in `callcore`.

pub mod coordinator;
pub mod error;
pub mod media;
pub mod recording;
pub mod snapshot;
pub mod transport;
pub mod transports;

pub use callcore::{CallError, CallState, ErrorCategory};
pub use coordinator::{CallCoordinator, CallHandle, CoordinatorConfig};
pub use error::{CommandError, MediaError, RecordingError, TransportError};
pub use media::{MediaEngine, MediaSession, MediaSessionConfig};
pub use recording::{
    HttpRecordingUploader, MixedStreamRecorder, RecordingConfig, RecordingStatus,
    RecordingTrigger, RecordingUploader,
};
pub use snapshot::{CallEvent, CallSnapshot};
pub use transport::SignalingTransport;
