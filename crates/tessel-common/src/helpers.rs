//! Common helper functions for Tessel.

/// Performs a constant-time comparison of two byte strings.
/// This is used when checking key confirmation values received from a peer.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Parse an optional environment value, naming the variable on failure.
pub fn parse_env_value<T>(name: &str, value: Option<String>) -> crate::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| crate::Error::config(format!("{name}={raw:?}: {e}"))),
    }
}
