//! Parsing of raw model output into chunk-local segments.

use super::ServiceError;
use crate::store::{Chunk, Segment};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Seconds of slack before a timestamp is considered past the end of the chunk.
const DURATION_TOLERANCE_SECS: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct RawEntry {
    start: Value,
    end: Value,
    text: String,
    #[serde(default)]
    translation: Option<String>,
}

/// Parses the `{start, end, text, translation}` list returned by the service.
pub struct ResponseParser {
    timestamp: Regex,
    fence: Regex,
}

impl ResponseParser {
    pub fn new() -> Self {
        // SS(.fff), MM:SS(.fff) or HH:MM:SS(.fff)
        let timestamp = Regex::new(r"^(?:(?:(\d+):)?(\d+):)?(\d+(?:\.\d+)?)$").expect("Invalid regex");
        let fence = Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*\n?(.*?)\n?\s*```$").expect("Invalid regex");
        Self { timestamp, fence }
    }

    /// Parse one timestamp value into seconds.
    pub fn parse_timestamp(&self, value: &Value) -> Result<f64, String> {
        let seconds = match value {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| format!("unrepresentable number {}", n))?,
            Value::String(s) => self.parse_timestamp_str(s.trim())?,
            other => return Err(format!("unsupported timestamp {}", other)),
        };

        if !seconds.is_finite() || seconds < 0.0 {
            return Err(format!("invalid timestamp {}", value));
        }
        Ok(seconds)
    }

    fn parse_timestamp_str(&self, s: &str) -> Result<f64, String> {
        let caps = self
            .timestamp
            .captures(s)
            .ok_or_else(|| format!("unrecognized timestamp \"{}\"", s))?;

        let hours: Option<f64> = caps.get(1).and_then(|m| m.as_str().parse().ok());
        let minutes: Option<f64> = caps.get(2).and_then(|m| m.as_str().parse().ok());
        let seconds: f64 = caps[3]
            .parse()
            .map_err(|_| format!("unrecognized timestamp \"{}\"", s))?;

        if minutes.is_some() && seconds >= 60.0 {
            return Err(format!("seconds out of range in \"{}\"", s));
        }
        if hours.is_some() && minutes.unwrap_or(0.0) >= 60.0 {
            return Err(format!("minutes out of range in \"{}\"", s));
        }

        Ok(hours.unwrap_or(0.0) * 3600.0 + minutes.unwrap_or(0.0) * 60.0 + seconds)
    }

    /// Parse the raw response into segments, in service order.
    ///
    /// Accepts a bare JSON array or an object with a `segments` array, optionally
    /// wrapped in a markdown code fence.
    pub fn parse(&self, raw: &str) -> Result<Vec<Segment>, ServiceError> {
        let trimmed = raw.trim();
        let body = match self.fence.captures(trimmed) {
            Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or_default(),
            None => trimmed,
        };

        let value: Value = serde_json::from_str(body)
            .map_err(|e| ServiceError::Malformed(format!("invalid JSON: {}", e)))?;

        let entries = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("segments") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(ServiceError::Malformed(
                        "missing \"segments\" array".to_string(),
                    ))
                }
            },
            _ => {
                return Err(ServiceError::Malformed(
                    "expected a JSON array or object".to_string(),
                ))
            }
        };

        entries
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let entry: RawEntry = serde_json::from_value(item)
                    .map_err(|e| ServiceError::Malformed(format!("segment {}: {}", i, e)))?;
                let start = self
                    .parse_timestamp(&entry.start)
                    .map_err(|e| ServiceError::Malformed(format!("segment {} start: {}", i, e)))?;
                let end = self
                    .parse_timestamp(&entry.end)
                    .map_err(|e| ServiceError::Malformed(format!("segment {} end: {}", i, e)))?;
                if end < start {
                    return Err(ServiceError::Malformed(format!(
                        "segment {} ends before it starts ({} < {})",
                        i, end, start
                    )));
                }
                Ok(Segment::new(
                    start,
                    end,
                    entry.text.trim().to_string(),
                    entry.translation.unwrap_or_default().trim().to_string(),
                ))
            })
            .collect()
    }

    /// Parse and convert to the chunk-local clock.
    pub fn parse_for_chunk(&self, raw: &str, chunk: &Chunk) -> Result<Vec<Segment>, ServiceError> {
        Ok(to_local_clock(self.parse(raw)?, chunk))
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Map timestamps onto the chunk-local clock `[0, duration]`.
///
/// A value past the chunk duration that falls inside the chunk's range in the
/// source recording was given on the source clock and is shifted back.
pub fn to_local_clock(segments: Vec<Segment>, chunk: &Chunk) -> Vec<Segment> {
    let duration = chunk.duration_seconds();
    let local = |t: f64| -> f64 {
        let shifted = if t > duration + DURATION_TOLERANCE_SECS
            && t >= chunk.start_seconds
            && t <= chunk.end_seconds + DURATION_TOLERANCE_SECS
        {
            t - chunk.start_seconds
        } else {
            t
        };
        shifted.clamp(0.0, duration)
    };

    segments
        .into_iter()
        .map(|s| Segment {
            start_seconds: local(s.start_seconds),
            end_seconds: local(s.end_seconds),
            ..s
        })
        .collect()
}
