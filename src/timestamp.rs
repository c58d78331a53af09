// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Timestamp and duration grammar shared by query translation and response decoding.
//!
//! Accepted timestamp forms, tried in order:
//! - `now`
//! - RFC3339 with optional fractional seconds (`T` or space delimiter, offset optional)
//! - a relative duration such as `1h`, `-15m` or `now-1h5m`
//! - a date prefix `YYYY`, `YYYY-MM`, `YYYY-MM-DD`, `YYYY-MM-DDTHH`,
//!   `YYYY-MM-DDTHH:MM` or `YYYY-MM-DDTHH:MM:SS`, optionally followed by `Z` or `±HH:MM`
//! - Unix seconds, or milliseconds when the value is at least 2^32

use chrono::{DateTime, Datelike, NaiveDateTime, TimeDelta, TimeZone, Utc};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1, one_of},
    combinator::{all_consuming, map, map_res, opt, recognize},
    error::Error as NomError,
    multi::fold_many1,
    sequence::pair,
};
use thiserror::Error;

pub const MIN_VALID_YEAR: i32 = 1970;
pub const MAX_VALID_YEAR: i32 = 2262;

const NANOS_PER_MILLI: f64 = 1_000_000.0;
const NANOS_PER_SECOND: f64 = 1_000_000_000.0;
const MILLIS_THRESHOLD: f64 = 4_294_967_296.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("cannot parse empty timestamp")]
    Empty,
    #[error("cannot parse {input}: {reason}")]
    Invalid { input: String, reason: String },
    #[error("cannot parse year from {0:?}: year must be in range [1970, 2262]")]
    YearOutOfRange(String),
    #[error("cannot parse duration {0:?}")]
    Duration(String),
}

/// Parses `input` relative to the current wall clock.
pub fn parse_time(input: &str) -> Result<DateTime<Utc>, TimeError> {
    parse_time_at(input, Utc::now())
}

pub fn parse_time_at(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(TimeError::Empty);
    }
    if s == "now" {
        return Ok(now);
    }
    if let Some(ts) = parse_rfc3339(s) {
        return check_year(ts, s);
    }
    if !s.is_ascii() {
        return Err(invalid(s, "unexpected non-ASCII characters"));
    }

    let (body, offset_secs) = split_offset(s)?;
    let body = body.strip_suffix('Z').unwrap_or(body);

    if is_relative(body) {
        let rest = body.strip_prefix("now").unwrap_or(body);
        let delta = parse_duration(rest)
            .map_err(|err| invalid(s, &err.to_string()))?;
        let delta = if delta > TimeDelta::zero() { -delta } else { delta };
        return now
            .checked_add_signed(delta)
            .ok_or_else(|| invalid(s, "relative time is out of range"));
    }

    if body.len() == 4 {
        return parse_date_prefix(s, body, offset_secs);
    }
    if !s.contains('-') {
        return parse_unix(s);
    }
    match body.len() {
        7 | 10 | 13 | 16 | 19 => parse_date_prefix(s, body, offset_secs),
        _ => Err(invalid(s, "unsupported timestamp format")),
    }
}

/// Parses a Prometheus-style duration: `1h5m`, `-30s`, `1.5d`, `250ms`.
/// A bare number is interpreted as seconds.
pub fn parse_duration(input: &str) -> Result<TimeDelta, TimeError> {
    let trimmed = input.trim();
    let nanos = all_consuming(duration_expr)
        .parse(trimmed)
        .map(|(_, nanos)| nanos)
        .map_err(|_| TimeError::Duration(input.to_string()))?;
    if !nanos.is_finite() || nanos.abs() > i64::MAX as f64 {
        return Err(TimeError::Duration(input.to_string()));
    }
    Ok(TimeDelta::nanoseconds(nanos.round() as i64))
}

/// Renders a duration with the largest whole units first, e.g. `1m30s`, `15s`, `500ms`, `30d`.
pub fn format_duration(delta: TimeDelta) -> String {
    let total_ms = delta.num_milliseconds();
    if total_ms == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    if total_ms < 0 {
        out.push('-');
    }
    let mut rest = total_ms.unsigned_abs();
    for (unit, size) in [
        ("d", 86_400_000u64),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
        ("ms", 1),
    ] {
        let count = rest / size;
        if count > 0 {
            out.push_str(&count.to_string());
            out.push_str(unit);
            rest -= count * size;
        }
    }
    out
}

type NomResult<'a, T> = IResult<&'a str, T, NomError<&'a str>>;

fn duration_expr(input: &str) -> NomResult<'_, f64> {
    map(
        pair(
            opt(one_of("+-")),
            alt((
                fold_many1(duration_segment, || 0f64, |acc, nanos| acc + nanos),
                map(number, |secs| secs * NANOS_PER_SECOND),
            )),
        ),
        |(sign, nanos)| if sign == Some('-') { -nanos } else { nanos },
    )
    .parse(input)
}

fn duration_segment(input: &str) -> NomResult<'_, f64> {
    map(pair(number, duration_unit), |(value, unit)| value * unit).parse(input)
}

fn duration_unit(input: &str) -> NomResult<'_, f64> {
    alt((
        map(tag("ms"), |_| NANOS_PER_MILLI),
        map(char('s'), |_| NANOS_PER_SECOND),
        map(char('m'), |_| 60.0 * NANOS_PER_SECOND),
        map(char('h'), |_| 3_600.0 * NANOS_PER_SECOND),
        map(char('d'), |_| 86_400.0 * NANOS_PER_SECOND),
        map(char('w'), |_| 7.0 * 86_400.0 * NANOS_PER_SECOND),
        map(char('y'), |_| 365.0 * 86_400.0 * NANOS_PER_SECOND),
    ))
    .parse(input)
}

fn number(input: &str) -> NomResult<'_, f64> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |text: &str| text.parse::<f64>(),
    )
    .parse(input)
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    if s.len() < "2006-01-02T15:04:05".len() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    // No offset at all: treat as UTC.
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn split_offset(s: &str) -> Result<(&str, i64), TimeError> {
    if s.len() <= 6 {
        return Ok((s, 0));
    }
    let (body, tz) = s.split_at(s.len() - 6);
    let bytes = tz.as_bytes();
    if !matches!(bytes[0], b'+' | b'-') || bytes[3] != b':' {
        return Ok((s, 0));
    }
    let hours: i64 = tz[1..3]
        .parse()
        .map_err(|err| invalid(s, &format!("cannot parse hour from timezone offset {tz:?}: {err}")))?;
    let minutes: i64 = tz[4..]
        .parse()
        .map_err(|err| invalid(s, &format!("cannot parse minute from timezone offset {tz:?}: {err}")))?;
    let offset = hours * 3_600 + minutes * 60;
    Ok((body, if bytes[0] == b'+' { offset } else { -offset }))
}

fn is_relative(body: &str) -> bool {
    let bytes = body.as_bytes();
    let looks_relative = match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => *last > b'9' || *first == b'-',
        _ => false,
    };
    looks_relative || body.starts_with("now")
}

fn parse_date_prefix(
    original: &str,
    body: &str,
    offset_secs: i64,
) -> Result<DateTime<Utc>, TimeError> {
    let padding = match body.len() {
        4 => "-01-01T00:00:00",
        7 => "-01T00:00:00",
        10 => "T00:00:00",
        13 => ":00:00",
        16 => ":00",
        _ => "",
    };
    let full = format!("{body}{padding}");
    let naive = NaiveDateTime::parse_from_str(&full, "%Y-%m-%dT%H:%M:%S")
        .map_err(|err| invalid(original, &err.to_string()))?;
    let ts = naive.and_utc() - TimeDelta::seconds(offset_secs);
    check_year(ts, original)
}

fn parse_unix(s: &str) -> Result<DateTime<Utc>, TimeError> {
    let mut value: f64 = s
        .parse()
        .map_err(|err: std::num::ParseFloatError| invalid(s, &err.to_string()))?;
    if !value.is_finite() {
        return Err(invalid(s, "timestamp must be finite"));
    }
    if value >= MILLIS_THRESHOLD {
        value /= 1_000.0;
    }
    let millis = (value * 1_000.0).round();
    if millis.abs() > i64::MAX as f64 {
        return Err(TimeError::YearOutOfRange(s.to_string()));
    }
    let ts = Utc
        .timestamp_millis_opt(millis as i64)
        .single()
        .ok_or_else(|| TimeError::YearOutOfRange(s.to_string()))?;
    check_year(ts, s)
}

fn check_year(ts: DateTime<Utc>, input: &str) -> Result<DateTime<Utc>, TimeError> {
    if (MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&ts.year()) {
        Ok(ts)
    } else {
        Err(TimeError::YearOutOfRange(input.to_string()))
    }
}

fn invalid(input: &str, reason: &str) -> TimeError {
    TimeError::Invalid {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn fixed_now() -> DateTime<Utc> {
        utc(2024, 6, 1, 12, 0, 0)
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(parse_time_at("", fixed_now()), Err(TimeError::Empty));
        assert_eq!(parse_time_at("   ", fixed_now()), Err(TimeError::Empty));
    }

    #[test]
    fn parses_now_and_relative_offsets() {
        let now = fixed_now();
        assert_eq!(parse_time_at("now", now).unwrap(), now);
        assert_eq!(
            parse_time_at("1h", now).unwrap(),
            now - TimeDelta::hours(1)
        );
        assert_eq!(
            parse_time_at("-1h", now).unwrap(),
            now - TimeDelta::hours(1)
        );
        assert_eq!(
            parse_time_at("now-1h5m", now).unwrap(),
            now - TimeDelta::minutes(65)
        );
    }

    #[test]
    fn parses_date_prefixes_as_utc() {
        let now = fixed_now();
        assert_eq!(parse_time_at("2019", now).unwrap(), utc(2019, 1, 1, 0, 0, 0));
        assert_eq!(parse_time_at("2019-02", now).unwrap(), utc(2019, 2, 1, 0, 0, 0));
        assert_eq!(
            parse_time_at("2019-02-10", now).unwrap(),
            utc(2019, 2, 10, 0, 0, 0)
        );
        assert_eq!(
            parse_time_at("2019-02-10T10", now).unwrap(),
            utc(2019, 2, 10, 10, 0, 0)
        );
        assert_eq!(
            parse_time_at("2019-02-10T10:01", now).unwrap(),
            utc(2019, 2, 10, 10, 1, 0)
        );
        assert_eq!(
            parse_time_at("2019-02-10T10:01:02", now).unwrap(),
            utc(2019, 2, 10, 10, 1, 2)
        );
    }

    #[test]
    fn applies_explicit_offsets() {
        let now = fixed_now();
        assert_eq!(
            parse_time_at("2019-02-10T10:01+02:00", now).unwrap(),
            utc(2019, 2, 10, 8, 1, 0)
        );
        assert_eq!(
            parse_time_at("2019-02-10-03:30", now).unwrap(),
            utc(2019, 2, 10, 3, 30, 0)
        );
        assert_eq!(
            parse_time_at("2019-02-10T10:01:02+02:00", now).unwrap(),
            utc(2019, 2, 10, 8, 1, 2)
        );
    }

    #[test]
    fn parses_rfc3339_with_fraction() {
        let now = fixed_now();
        assert_eq!(
            parse_time_at("2024-02-20T14:04:27Z", now).unwrap(),
            utc(2024, 2, 20, 14, 4, 27)
        );
        let ts = parse_time_at("2024-09-10T12:24:38.124811792Z", now).unwrap();
        assert_eq!(ts.timestamp(), utc(2024, 9, 10, 12, 24, 38).timestamp());
        assert_eq!(ts.timestamp_subsec_nanos(), 124_811_792);
        let ts = parse_time_at("2024-09-10 12:24:38.5", now).unwrap();
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn parses_unix_seconds_and_millis() {
        let now = fixed_now();
        assert_eq!(
            parse_time_at("1562529662", now).unwrap(),
            utc(2019, 7, 7, 20, 1, 2)
        );
        let ts = parse_time_at("1562529662678", now).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_562_529_662_678);
        let ts = parse_time_at("1562529662.5", now).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_562_529_662_500);
    }

    #[test]
    fn rejects_years_out_of_range() {
        let now = fixed_now();
        assert!(matches!(
            parse_time_at("1869", now),
            Err(TimeError::YearOutOfRange(_))
        ));
        assert!(matches!(
            parse_time_at("2263-01-01", now),
            Err(TimeError::YearOutOfRange(_))
        ));
        assert!(matches!(
            parse_time_at("1960-01-01T00:00:00Z", now),
            Err(TimeError::YearOutOfRange(_))
        ));
    }

    #[test]
    fn rejects_garbage() {
        let now = fixed_now();
        assert!(parse_time_at("acdf", now).is_err());
        assert!(parse_time_at("2019-13-45", now).is_err());
        assert!(parse_time_at("12:00", now).is_err());
    }

    #[test]
    fn parses_prometheus_durations() {
        assert_eq!(parse_duration("15s").unwrap(), TimeDelta::seconds(15));
        assert_eq!(parse_duration("1h5m").unwrap(), TimeDelta::minutes(65));
        assert_eq!(parse_duration("-30s").unwrap(), TimeDelta::seconds(-30));
        assert_eq!(parse_duration("250ms").unwrap(), TimeDelta::milliseconds(250));
        assert_eq!(parse_duration("1.5d").unwrap(), TimeDelta::hours(36));
        assert_eq!(parse_duration("2w").unwrap(), TimeDelta::days(14));
        assert_eq!(parse_duration("1y").unwrap(), TimeDelta::days(365));
        assert_eq!(parse_duration("123").unwrap(), TimeDelta::seconds(123));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("a3").is_err());
        assert!(parse_duration("1h5").is_err());
    }

    #[test]
    fn formats_durations_compactly() {
        assert_eq!(format_duration(TimeDelta::seconds(15)), "15s");
        assert_eq!(format_duration(TimeDelta::seconds(90)), "1m30s");
        assert_eq!(format_duration(TimeDelta::milliseconds(500)), "500ms");
        assert_eq!(format_duration(TimeDelta::hours(1)), "1h");
        assert_eq!(format_duration(TimeDelta::days(30)), "30d");
        assert_eq!(format_duration(TimeDelta::zero()), "0s");
        assert_eq!(format_duration(TimeDelta::seconds(-5)), "-5s");
    }
}
