//! Types shared by the request/response recorder.
//!
//! The writer and the HTTP middleware live in the server crate; this module
//! only defines what a recorded line looks like and how secrets are scrubbed
//! from it.

pub mod sanitizer;
pub mod types;

pub use sanitizer::{Sanitizer, SENSITIVE_HEADERS};
pub use types::*;
