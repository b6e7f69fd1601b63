//! External surface of the alerting engine: the TCP event provider and the
//! admin HTTP API, both built thinly against `bangarang`'s `Pipeline`.

/// Admin HTTP API routes (incidents, config, stats).
pub mod admin;
/// Centralized environment variable names and typed accessors.
pub mod env_vars;
/// TCP event provider: handshake, length-prefixed framing, decode, forward.
pub mod tcp;

pub use tcp::{Codec, START_HANDSHAKE};
