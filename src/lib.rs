//! Call coordination for WhatsApp Business voice calls.
//!
//! Signaling arrives over one of three transports, media runs on a
//! host-supplied WebRTC engine, and a single coordinator task owns the call
//! state. See [`calls`] for the moving parts.

pub mod calls;
pub mod config;

pub use calls::{CallCoordinator, CallEvent, CallHandle, CallSnapshot, CallState};
pub use config::{CallConfig, ConfigError, TransportKind};
