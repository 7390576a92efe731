pub mod call;

pub use call::{CallDirection, CallId, RemoteParty, ZERO_DURATION, format_duration};
