pub mod classify;
pub mod error;
pub mod net;
pub mod sdp;
pub mod signaling;
pub mod sse;
pub mod state;
pub mod types;

pub use classify::{Classifier, classify};
pub use error::{CallError, ErrorCategory, ErrorHistory};
pub use signaling::{ControlCommand, ControlResponse, SignalingMessage};
pub use state::{CallSession, CallState, CallTransition, InvalidTransition};
