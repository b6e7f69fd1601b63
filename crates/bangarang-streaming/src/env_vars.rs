//! Centralized environment variable names and typed accessors for the
//! TCP provider and admin API binaries.

/// TCP provider bind address (default `0.0.0.0`).
pub const TCP_BIND_ADDR: &str = "BANGARANG_TCP_BIND_ADDR";
/// TCP provider port (default `5555`, matching the original's listener).
pub const TCP_PORT: &str = "BANGARANG_TCP_PORT";
/// Wire codec for inbound events: `json` (default) or `msgpack`.
pub const TCP_CODEC: &str = "BANGARANG_TCP_CODEC";
/// Admin HTTP API bind address (default `0.0.0.0`).
pub const ADMIN_BIND_ADDR: &str = "BANGARANG_ADMIN_BIND_ADDR";

// =============================================================================
// Typed helpers
// =============================================================================

/// Reads an environment variable as a string, returning `None` if unset.
#[must_use]
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Reads an environment variable as a string, returning `default` if unset.
#[must_use]
pub fn env_string_or_default(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Reads an environment variable as a `u16`, returning `default` if unset or invalid.
#[must_use]
pub fn env_u16_or_default(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn with_env_var<F, R>(name: &str, value: Option<&str>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(name).ok();
        match value {
            Some(v) => env::set_var(name, v),
            None => env::remove_var(name),
        }
        let result = f();
        match original {
            Some(v) => env::set_var(name, v),
            None => env::remove_var(name),
        }
        result
    }

    #[test]
    fn env_u16_or_default_falls_back_on_missing() {
        with_env_var(TCP_PORT, None, || {
            assert_eq!(env_u16_or_default(TCP_PORT, 5555), 5555);
        });
    }

    #[test]
    fn env_u16_or_default_parses_set_value() {
        with_env_var(TCP_PORT, Some("9000"), || {
            assert_eq!(env_u16_or_default(TCP_PORT, 5555), 9000);
        });
    }

    #[test]
    fn env_string_or_default_falls_back_on_invalid_utf8_free_case() {
        with_env_var(TCP_CODEC, None, || {
            assert_eq!(env_string_or_default(TCP_CODEC, "json"), "json");
        });
    }
}
