// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric points, their validation rules, and the telnet-style `put` line format.

use crate::errors::ParseError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub type Tags = BTreeMap<String, String>;

/// One measurement as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub metric: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub value: f64,
    #[serde(default)]
    pub tags: Tags,
}

impl Point {
    /// Builds a point stamped with the current time.
    pub fn now(metric: impl Into<String>, value: f64, tags: Tags) -> Self {
        Self {
            metric: metric.into(),
            timestamp: unix_now(),
            value,
            tags,
        }
    }

    /// Seconds between the point's timestamp and `now`; negative for future points.
    pub fn age_secs(&self, now: i64) -> i64 {
        now.saturating_sub(self.timestamp)
    }

    /// Checks the metric name, every tag and the value.
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_name(&self.metric) {
            return Err(format!("invalid metric name '{}'", self.metric));
        }
        if let Some((k, v)) = self
            .tags
            .iter()
            .find(|(k, v)| !is_valid_name(k) || !is_valid_name(v))
        {
            return Err(format!("invalid tag '{k}={v}' on '{}'", self.metric));
        }
        if !self.value.is_finite() {
            return Err(format!("non-finite value for '{}'", self.metric));
        }
        Ok(())
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Whether `name` is usable as a metric name, tag key or tag value.
///
/// Allowed: ASCII alphanumerics, `-`, `_`, `.`, `/` and any Unicode letter.
///
/// ```
/// use telemetry_delivery::point::is_valid_name;
///
/// assert!(is_valid_name("os.cpu"));
/// assert!(is_valid_name("host/eth0_rx-bytes"));
/// assert!(!is_valid_name(""));
/// assert!(!is_valid_name("has space"));
/// ```
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|ch| {
            ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/') || ch.is_alphabetic()
        })
}

/// Parses tags given as `key:value` pairs separated by spaces or commas.
///
/// Malformed pairs are skipped.
pub fn parse_tags(tags: &str) -> Tags {
    tags.replace(',', " ")
        .split_whitespace()
        .filter_map(|kv| {
            let (k, v) = kv.split_once(':')?;
            (!k.is_empty() && !v.is_empty()).then(|| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// A parsed `put <metric> <timestamp> <value> <tagk=tagv>...` line.
///
/// The timestamp field is required by the format but ignored: points are stamped when they are
/// submitted to the delivery queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PutLine {
    pub metric: String,
    pub value: f64,
    pub tags: Tags,
}

pub fn parse_put_line(line: &str) -> Result<PutLine, ParseError> {
    let mut fields = line.split_whitespace();
    match fields.next() {
        Some("put") => {}
        _ => return Err(ParseError::NotPut(line.to_string())),
    }
    let (Some(metric), Some(_timestamp), Some(value)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err(ParseError::MissingFields);
    };
    let value = value
        .parse::<f64>()
        .map_err(|_| ParseError::InvalidValue(value.to_string()))?;
    let tags = fields
        .map(|tag| {
            tag.split_once('=')
                .filter(|(k, v)| !k.is_empty() && !v.is_empty())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| ParseError::InvalidTag(tag.to_string()))
        })
        .collect::<Result<Tags, _>>()?;
    Ok(PutLine {
        metric: metric.to_string(),
        value,
        tags,
    })
}
