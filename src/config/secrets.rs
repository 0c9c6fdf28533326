//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers do not need a direct dependency.

pub use secrecy::{ExposeSecret, SecretString};
