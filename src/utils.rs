use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

// Helpers for tolerating the loosely typed values the server sends
// (ids as numbers or numeric strings, flags as bools or "1"/"true").
pub mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn value_to_i64(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn value_to_string(value: &Value) -> Option<String> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn value_to_bool(value: &Value) -> Option<bool> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|i| i != 0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value.as_ref().and_then(value_to_i64))
    }

    pub fn i64_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        Ok(opt_i64(d)?.unwrap_or(0))
    }

    pub fn u64_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        Ok(opt_i64(d)?.filter(|v| *v > 0).map(|v| v as u64).unwrap_or(0))
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value.as_ref().and_then(value_to_string))
    }

    pub fn string_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(opt_string(d)?.unwrap_or_default())
    }

    pub fn opt_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        let value = Option::<Value>::deserialize(d)?;
        Ok(value.as_ref().and_then(value_to_bool))
    }
}

static DEVICE_NOT_FOUND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)device[\s_-]*(not[\s_-]*(found|registered)|unknown)")
        .expect("device-not-found pattern is valid")
});
static INVALID_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(invalid|expired)[\s_-]*token|token[\s_-]*(invalid|expired)")
        .expect("invalid-token pattern is valid")
});
static CONTENT_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*bytes\s+(\d+)-(\d+)/(\d+|\*)\s*$").expect("content-range pattern is valid")
});
static UNSATISFIED_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*bytes\s+\*/(\d+)\s*$").expect("unsatisfied-range pattern is valid")
});

pub fn is_device_not_found(body: &str) -> bool {
    DEVICE_NOT_FOUND_RE.is_match(body)
}

pub fn is_invalid_token(body: &str) -> bool {
    INVALID_TOKEN_RE.is_match(body)
}

/// Parse a `Content-Range: bytes start-end/total` header value.
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let caps = CONTENT_RANGE_RE.captures(value)?;
    let start = caps.get(1)?.as_str().parse().ok()?;
    let end = caps.get(2)?.as_str().parse().ok()?;
    let total = caps.get(3).and_then(|m| m.as_str().parse().ok());
    Some((start, end, total))
}

/// Complete length from the `bytes */total` form sent with a 416.
pub fn parse_unsatisfied_range(value: &str) -> Option<u64> {
    UNSATISFIED_RANGE_RE.captures(value)?.get(1)?.as_str().parse().ok()
}

pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Linear backoff (`base * attempt`) with up to ±20% jitter.
pub fn linear_backoff(base: Duration, attempt: u32) -> Duration {
    let linear = base.saturating_mul(attempt.max(1));
    let jitter_factor = rand::random::<f32>() * 0.4 - 0.2; // -0.2 to +0.2
    let jitter = linear.mul_f32(jitter_factor.abs());
    if jitter_factor >= 0.0 {
        linear + jitter
    } else {
        linear.saturating_sub(jitter)
    }
}

/// Keep only characters that are safe in a file name on every platform.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "media".to_string()
    } else {
        trimmed.to_string()
    }
}
