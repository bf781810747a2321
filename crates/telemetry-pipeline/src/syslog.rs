// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog line adapter (RFC 5424 and RFC 3164).
//!
//! Parsing never fails: a line that matches neither format still becomes a
//! message carrying the whole line, the current time and `parser=syslog`.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::record::{BaseMessage, Severity, Source};

const SEVERITY_NAMES: [&str; 8] = [
    "emergency",
    "alert",
    "critical",
    "error",
    "warning",
    "notice",
    "info",
    "debug",
];

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

#[allow(clippy::expect_used)]
lazy_static! {
    /// `<PRI>VERSION TIMESTAMP HOST APP PROCID MSGID [SD] MSG`
    static ref RFC5424_REGEX: Regex = Regex::new(
        r#"^<(\d{1,3})>(\d{1,2}) (\S+) (\S+) (\S+) (\S+) (\S+) (-|(?:\[(?:[^\]"]|"(?:[^"\\]|\\.)*")*\])+)(?: (.*))?$"#
    )
    .expect("failed creating regex");

    /// `[<PRI>]Mmm dd hh:mm:ss HOST TAG[PID]: MSG`
    static ref RFC3164_REGEX: Regex = Regex::new(
        r"^(?:<(\d{1,3})>)?([A-Z][a-z]{2}) +(\d{1,2}) (\d{2}):(\d{2}):(\d{2}) (\S+) (?:([^:\[\s]+)(?:\[([^\]]*)\])?: ?)?(.*)$"
    )
    .expect("failed creating regex");

    static ref SYSLOG_HINT_REGEX: Regex =
        Regex::new(r"^(?:<\d{1,3}>|[A-Z][a-z]{2}\s+\d{1,2} \d{2}:\d{2}:\d{2} \S+)")
            .expect("failed creating regex");
}

/// Cheap check used to route plain-text lines to the syslog adapter.
#[must_use]
pub fn is_syslog_line(line: &str) -> bool {
    SYSLOG_HINT_REGEX.is_match(line)
}

/// Parses one syslog line against the current clock.
#[must_use]
pub fn parse_syslog_line(line: &str) -> BaseMessage {
    parse_syslog_line_at(line, Utc::now())
}

/// Parses one syslog line; `now` resolves missing timestamps and the year of
/// RFC 3164 dates.
#[must_use]
pub fn parse_syslog_line_at(line: &str, now: DateTime<Utc>) -> BaseMessage {
    let mut message = if let Some(caps) = RFC5424_REGEX.captures(line) {
        parse_rfc5424(&caps, now)
    } else if let Some(caps) = RFC3164_REGEX.captures(line) {
        parse_rfc3164(&caps, now)
    } else {
        BaseMessage::new(Source::Syslog, now.timestamp_millis(), line)
    };
    message
        .attributes
        .insert("parser".to_string(), Value::from("syslog"));
    message.raw = Value::String(line.to_string());
    message
}

fn group<'a>(caps: &Captures<'a>, index: usize) -> Option<&'a str> {
    caps.get(index)
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty() && *s != "-")
}

fn apply_priority(message: &mut BaseMessage, pri: Option<&str>) {
    let Some(pri) = pri.and_then(|p| p.parse::<u8>().ok()) else {
        return;
    };
    message.severity = Some(Severity::Text(
        SEVERITY_NAMES[usize::from(pri % 8)].to_string(),
    ));
    message
        .attributes
        .insert("facility".to_string(), Value::from(pri / 8));
    message.attributes.insert("pri".to_string(), Value::from(pri));
}

fn parse_rfc5424(caps: &Captures<'_>, now: DateTime<Utc>) -> BaseMessage {
    let timestamp = group(caps, 3)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map_or_else(|| now.timestamp_millis(), |dt| dt.timestamp_millis());
    let text = group(caps, 9)
        .map(|m| m.trim_start_matches('\u{feff}'))
        .unwrap_or_default();

    let mut message = BaseMessage::new(Source::Syslog, timestamp, text);
    message.host = group(caps, 4).map(str::to_string);
    message.app = group(caps, 5).map(str::to_string);
    apply_priority(&mut message, group(caps, 1));
    if let Some(procid) = group(caps, 6) {
        message
            .attributes
            .insert("procid".to_string(), Value::from(procid));
    }
    if let Some(msgid) = group(caps, 7) {
        message
            .attributes
            .insert("msgid".to_string(), Value::from(msgid));
    }
    if let Some(sd) = group(caps, 8) {
        message
            .attributes
            .insert("structuredData".to_string(), Value::from(sd));
    }
    message
}

fn parse_rfc3164(caps: &Captures<'_>, now: DateTime<Utc>) -> BaseMessage {
    let timestamp = rfc3164_timestamp(caps, now).unwrap_or_else(|| now.timestamp_millis());
    let text = caps.get(10).map_or("", |m| m.as_str());

    let mut message = BaseMessage::new(Source::Syslog, timestamp, text);
    message.host = group(caps, 7).map(str::to_string);
    message.app = group(caps, 8).map(str::to_string);
    apply_priority(&mut message, group(caps, 1));
    if let Some(pid) = group(caps, 9) {
        message
            .attributes
            .insert("procid".to_string(), Value::from(pid));
    }
    message
}

/// RFC 3164 dates carry no year: assume the current one, or the previous
/// one when that would put the line more than a day in the future.
fn rfc3164_timestamp(caps: &Captures<'_>, now: DateTime<Utc>) -> Option<i64> {
    let month = MONTHS.iter().position(|m| Some(*m) == group(caps, 2))?;
    let month = u32::try_from(month).ok()? + 1;
    let field = |i: usize| group(caps, i).and_then(|v| v.parse::<u32>().ok());
    let (day, hour, minute, second) = (field(3)?, field(4)?, field(5)?, field(6)?);

    let at_year = |year: i32| {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
            .single()
    };
    let candidate = at_year(now.year())?;
    let resolved = if candidate > now + Duration::days(1) {
        at_year(now.year() - 1)?
    } else {
        candidate
    };
    Some(resolved.timestamp_millis())
}
