//! Error types surfaced by the session engine.

use std::{fmt, io};

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An application-level error the server returned inside an `rpc_result`.
///
/// Numeric suffixes are stripped from the name and placed in
/// [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with the numeric suffix removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw server error message like `"FLOOD_WAIT_30"`.
    pub fn from_wire(code: i32, message: &str) -> Self {
        // Numeric suffix after the last underscore becomes `value`.
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    return Self {
                        code,
                        name: message[..idx].to_string(),
                        value: Some(v),
                    };
                }
            }
        }
        Self {
            code,
            name: message.to_string(),
            value: None,
        }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type resolved into a caller's future when a request fails.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// Network / I/O failure.
    Io(io::Error),
    /// The server reported an unrecoverable `bad_msg_notification` code.
    BadMessage { code: i32 },
    /// Response deserialization failed.
    Deserialize(String),
    /// A single request exceeding the container size limit.
    PayloadTooLarge,
    /// The request was dropped (engine shut down before an answer arrived).
    Dropped,
    /// The caller's abort token cancelled the request.
    Aborted,
    /// The auth key is no longer accepted by the server.
    ConnectionBroken,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::BadMessage { code } => write!(f, "bad message (code {code})"),
            Self::Deserialize(s) => write!(f, "deserialize error: {s}"),
            Self::PayloadTooLarge => write!(f, "request too large for a single container"),
            Self::Dropped => write!(f, "request dropped"),
            Self::Aborted => write!(f, "request aborted"),
            Self::ConnectionBroken => write!(f, "connection broken, re-authentication required"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tether_mtproto::tl::Error> for InvocationError {
    fn from(e: tether_mtproto::tl::Error) -> Self {
        Self::Deserialize(e.to_string())
    }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_suffix_becomes_value() {
        let err = RpcError::from_wire(420, "FLOOD_WAIT_30");
        assert_eq!(err.name, "FLOOD_WAIT");
        assert_eq!(err.value, Some(30));
    }

    #[test]
    fn plain_name_has_no_value() {
        let err = RpcError::from_wire(401, "AUTH_KEY_UNREGISTERED");
        assert_eq!(err.name, "AUTH_KEY_UNREGISTERED");
        assert_eq!(err.value, None);
    }

    #[test]
    fn wildcard_matching() {
        let err = RpcError::from_wire(400, "PHONE_CODE_EXPIRED");
        assert!(err.is("PHONE_CODE_EXPIRED"));
        assert!(err.is("PHONE_CODE_*"));
        assert!(err.is("*_EXPIRED"));
        assert!(!err.is("PHONE_CODE"));
    }
}
