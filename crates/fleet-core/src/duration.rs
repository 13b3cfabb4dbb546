//! Human-readable duration strings used throughout `fleet.toml`.

use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Parse a duration string like `"30s"`, `"5m"`, `"1h"` or `"500ms"`.
///
/// A bare number is interpreted as seconds.
pub fn parse_duration(s: &str) -> CoreResult<Duration> {
    let s = s.trim();
    let invalid = || CoreError::InvalidDuration(s.to_string());

    let (digits, scale_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };

    let value = digits.trim().parse::<u64>().map_err(|_| invalid())?;
    let millis = value.checked_mul(scale_ms).ok_or_else(invalid)?;
    Ok(Duration::from_millis(millis))
}

/// Parse an optional duration, falling back to `default` when absent.
pub fn parse_duration_or(s: Option<&str>, default: Duration) -> CoreResult<Duration> {
    match s {
        Some(s) => parse_duration(s),
        None => Ok(default),
    }
}
