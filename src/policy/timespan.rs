//! Timeout field codec
//!
//! Timeouts travel in the .NET constant timespan shape `[d.]hh:mm:ss[.fffffff]`, where
//! the fraction counts 100ns ticks. Parsing also accepts `hh:mm` and a bare day count.

use crate::error::{CacheError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static TIMESPAN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(\d+)\.)?(\d+):(\d+)(?::(\d+)(?:\.(\d{1,7}))?)?$")
        .expect("invalid timespan regex")
});

const NANOS_PER_TICK: u32 = 100;

fn invalid(value: &str, reason: impl Into<String>) -> CacheError {
    CacheError::InvalidTimeout {
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn component(value: &str, digits: Option<regex::Match<'_>>, max: Option<u64>, name: &str) -> Result<u64> {
    let Some(digits) = digits else {
        return Ok(0);
    };
    let parsed: u64 = digits
        .as_str()
        .parse()
        .map_err(|_| invalid(value, format!("{} out of range", name)))?;
    if let Some(max) = max {
        if parsed > max {
            return Err(invalid(value, format!("{} must be at most {}", name, max)));
        }
    }
    Ok(parsed)
}

/// Parse a timeout field. The caller handles the empty field (no timeout).
pub fn parse_timespan(value: &str) -> Result<Duration> {
    let value = value.trim();

    if value.starts_with('-') {
        return Err(invalid(value, "negative timeouts are not allowed"));
    }

    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        let days: u64 = value
            .parse()
            .map_err(|_| invalid(value, "days out of range"))?;
        return days
            .checked_mul(86_400)
            .map(Duration::from_secs)
            .ok_or_else(|| invalid(value, "days out of range"));
    }

    let caps = TIMESPAN_REGEX
        .captures(value)
        .ok_or_else(|| invalid(value, "expected [d.]hh:mm:ss[.fffffff]"))?;

    let days = component(value, caps.get(1), None, "days")?;
    let hours = component(value, caps.get(2), Some(23), "hours")?;
    let minutes = component(value, caps.get(3), Some(59), "minutes")?;
    let seconds = component(value, caps.get(4), Some(59), "seconds")?;

    // Right-pad the fraction to seven digits of ticks
    let ticks = match caps.get(5) {
        Some(fraction) => {
            let padded = format!("{:0<7}", fraction.as_str());
            padded
                .parse::<u32>()
                .map_err(|_| invalid(value, "bad fraction"))?
        }
        None => 0,
    };

    let secs = days
        .checked_mul(86_400)
        .and_then(|d| d.checked_add(hours * 3_600 + minutes * 60 + seconds))
        .ok_or_else(|| invalid(value, "days out of range"))?;

    Ok(Duration::new(secs, ticks * NANOS_PER_TICK))
}

/// Drop the part of `duration` finer than one 100ns tick
pub fn truncate_to_ticks(duration: Duration) -> Duration {
    let nanos = duration.subsec_nanos();
    Duration::new(duration.as_secs(), nanos - nanos % NANOS_PER_TICK)
}

/// Format a duration as `[d.]hh:mm:ss[.fffffff]`. Sub-tick precision is truncated.
pub fn format_timespan(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    let ticks = duration.subsec_nanos() / NANOS_PER_TICK;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{}.", days));
    }
    out.push_str(&format!("{:02}:{:02}:{:02}", hours, minutes, seconds));
    if ticks > 0 {
        out.push_str(&format!(".{:07}", ticks));
    }
    out
}
