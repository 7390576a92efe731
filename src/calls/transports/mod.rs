//! Concrete signaling transports.

pub(crate) mod rest;
pub mod sip;
pub mod sse;
pub mod webhook;

pub use rest::{ControlEndpoints, RestControl};
pub use sip::{SipEvent, SipRegistration, SipTransport, SipUserAgent};
pub use sse::SseTransport;
pub use webhook::WebhookTransport;
