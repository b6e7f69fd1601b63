//! Crate-wide error taxonomy.
//!
//! Every kind here maps to one of the propagation rules in the engine's
//! error handling design: predicate and destination errors stay local to
//! the policy/escalation that raised them, provider errors close only the
//! offending connection, and `Fatal` is only ever returned before the
//! dispatcher starts.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All error kinds the engine can produce.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration document failed to compile (bad regex, dangling
    /// escalation reference, ...). The caller keeps the previous config.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A connected event provider sent a malformed handshake, length
    /// prefix, or payload. The connection is closed; the listener keeps
    /// running.
    #[error("provider protocol violation: {0}")]
    ProviderProtocol(String),

    /// The incident index failed a read or write. Logged and swallowed;
    /// the event that triggered it is still considered processed.
    #[error("incident index error: {0}")]
    IndexIo(String),

    /// An escalation destination failed to send. Logged; the remaining
    /// destinations in the set still run.
    #[error("escalation destination send failed: {0}")]
    DestinationSend(String),

    /// A condition's predicate could not be evaluated. Treated as "not
    /// satisfied".
    #[error("predicate evaluation error: {0}")]
    Predicate(String),

    /// Unrecoverable startup failure (bad config file, unbindable
    /// listener address). Never returned once the dispatcher is running.
    #[error("fatal startup error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_include_context() {
        let e = Error::ConfigInvalid("missing escalation \"page\"".into());
        assert!(e.to_string().contains("missing escalation"));

        let e = Error::Predicate("nan metric".into());
        assert!(e.to_string().starts_with("predicate evaluation error"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
