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

use chrono::TimeDelta;

use crate::{
    query::TimeRange,
    timestamp::{TimeError, parse_duration},
};

pub const DEFAULT_RESOLUTION: i64 = 1500;
pub const TIME_FIELD: &str = "_time";

const VAR_RANGE: &str = "$__range";
const VAR_INTERVAL_MS: &str = "$__interval_ms";
const VAR_INTERVAL: &str = "$__interval";

pub fn default_interval() -> TimeDelta {
    TimeDelta::seconds(15)
}

/// Human-friendly step sizes, in milliseconds.
const LADDER_MS: [i64; 30] = [
    1,
    10,
    20,
    50,
    100,
    200,
    500,
    1_000,
    2_000,
    5_000,
    10_000,
    15_000,
    20_000,
    30_000,
    60_000,
    120_000,
    300_000,
    600_000,
    900_000,
    1_200_000,
    1_800_000,
    3_600_000,
    7_200_000,
    10_800_000,
    21_600_000,
    43_200_000,
    86_400_000,
    604_800_000,
    2_592_000_000,
    31_536_000_000,
];

/// Snaps `interval` up to the smallest ladder step that is not shorter than it.
/// Anything past the top of the ladder is clamped to one year.
pub fn round_interval(interval: TimeDelta) -> TimeDelta {
    let wanted = interval.num_milliseconds();
    let ms = LADDER_MS
        .iter()
        .copied()
        .find(|step| *step >= wanted)
        .unwrap_or(LADDER_MS[LADDER_MS.len() - 1]);
    TimeDelta::milliseconds(ms)
}

pub fn calculate_step(
    min_interval: TimeDelta,
    range: &TimeRange,
    max_data_points: i64,
) -> TimeDelta {
    let resolution = if max_data_points > 0 {
        max_data_points
    } else {
        DEFAULT_RESOLUTION
    };
    let span = range.to - range.from;
    let calculated = TimeDelta::milliseconds(span.num_milliseconds() / resolution);
    round_interval(calculated.max(min_interval))
}

/// Picks the minimum step for a query.
///
/// Precedence: `query_interval_ms`, then `query_interval`, then the datasource
/// interval, then `default`. `"0s"` and the unresolved `$__interval` variable
/// count as an absent query interval.
pub fn resolve_min_interval(
    ds_interval: &str,
    query_interval: &str,
    query_interval_ms: i64,
    default: TimeDelta,
) -> Result<TimeDelta, TimeError> {
    if query_interval_ms > 0 {
        return Ok(TimeDelta::milliseconds(query_interval_ms));
    }
    let query_interval = query_interval.trim();
    if !query_interval.is_empty() && query_interval != "0s" && query_interval != VAR_INTERVAL {
        return parse_interval(query_interval);
    }
    let ds_interval = ds_interval.trim();
    if !ds_interval.is_empty() {
        return parse_interval(ds_interval);
    }
    Ok(default)
}

/// Parses an interval setting such as `10s`, `<1m>` or `30` (seconds).
pub fn parse_interval(interval: &str) -> Result<TimeDelta, TimeError> {
    let trimmed = interval.replacen('<', "", 1).replacen('>', "", 1);
    let trimmed = trimmed.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return parse_duration(&format!("{trimmed}s"));
    }
    parse_duration(trimmed)
}

/// Renders a duration in its single largest whole unit, e.g. `90s` becomes `1m`.
pub fn format_interval(interval: TimeDelta) -> String {
    const UNITS: [(&str, i64); 6] = [
        ("y", 365 * 86_400_000),
        ("d", 86_400_000),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
        ("ms", 1),
    ];
    let ms = interval.num_milliseconds();
    UNITS
        .iter()
        .find(|(_, size)| ms >= *size)
        .map(|(unit, size)| format!("{}{unit}", ms / size))
        .unwrap_or_else(|| "1ms".to_string())
}

/// Substitutes `$__range`, `$__interval_ms` and `$__interval` in that order.
pub fn replace_template_variables(expr: &str, interval_ms: i64, range: &TimeRange) -> String {
    expr.replace(VAR_RANGE, &range_to_string(range))
        .replace(VAR_INTERVAL_MS, &interval_ms.to_string())
        .replace(
            VAR_INTERVAL,
            &format_interval(TimeDelta::milliseconds(interval_ms)),
        )
}

/// Prefixes `expr` with a `_time:[from, to]` filter unless its first pipe
/// stage already mentions `_time`.
pub fn add_time_field_with_range(expr: &str, range: &TimeRange) -> String {
    if expr.is_empty() || has_time_field(expr) {
        return expr.to_string();
    }
    format!("{TIME_FIELD}:{} {expr}", range_to_string(range))
}

fn has_time_field(expr: &str) -> bool {
    expr.split('|')
        .next()
        .is_some_and(|first| first.contains(TIME_FIELD))
}

fn range_to_string(range: &TimeRange) -> String {
    format!("[{}, {}]", range.from.timestamp(), range.to.timestamp())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn hour_range() -> TimeRange {
        TimeRange {
            from: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2021, 1, 1, 1, 0, 0).unwrap(),
        }
    }

    #[test]
    fn ladder_values_are_fixed_points() {
        for ms in LADDER_MS {
            let step = TimeDelta::milliseconds(ms);
            assert_eq!(round_interval(step), step, "{ms}ms");
        }
    }

    #[test]
    fn rounding_snaps_up() {
        assert_eq!(round_interval(TimeDelta::zero()), TimeDelta::milliseconds(1));
        assert_eq!(round_interval(TimeDelta::milliseconds(11)), TimeDelta::milliseconds(20));
        assert_eq!(round_interval(TimeDelta::seconds(16)), TimeDelta::seconds(20));
        assert_eq!(round_interval(TimeDelta::seconds(61)), TimeDelta::minutes(2));
        assert_eq!(round_interval(TimeDelta::hours(25)), TimeDelta::weeks(1));
        assert_eq!(round_interval(TimeDelta::days(400)), TimeDelta::days(365));
    }

    #[test]
    fn step_uses_range_and_resolution() {
        let range = hour_range();
        // 3600s / 1500 = 2.4s
        assert_eq!(
            calculate_step(TimeDelta::seconds(1), &range, 0),
            TimeDelta::seconds(5)
        );
        // 3600s / 60 = 60s
        assert_eq!(
            calculate_step(TimeDelta::seconds(1), &range, 60),
            TimeDelta::minutes(1)
        );
        assert_eq!(
            calculate_step(TimeDelta::minutes(3), &range, 60),
            TimeDelta::minutes(5)
        );
    }

    #[test]
    fn step_is_monotonic_in_min_interval() {
        let range = hour_range();
        let mut previous = TimeDelta::zero();
        for secs in [0, 1, 2, 5, 7, 15, 16, 45, 90, 600, 3_600, 100_000] {
            let min = TimeDelta::seconds(secs);
            let step = calculate_step(min, &range, 0);
            assert!(step >= previous);
            assert!(step >= round_interval(min));
            previous = step;
        }
    }

    #[test]
    fn min_interval_precedence() {
        let default = default_interval();
        assert_eq!(
            resolve_min_interval("1m", "30s", 2_000, default).unwrap(),
            TimeDelta::seconds(2)
        );
        assert_eq!(
            resolve_min_interval("1m", "30s", 0, default).unwrap(),
            TimeDelta::seconds(30)
        );
        assert_eq!(
            resolve_min_interval("1m", "0s", 0, default).unwrap(),
            TimeDelta::minutes(1)
        );
        assert_eq!(
            resolve_min_interval("1m", "$__interval", 0, default).unwrap(),
            TimeDelta::minutes(1)
        );
        assert_eq!(resolve_min_interval("", "", 0, default).unwrap(), default);
        assert!(resolve_min_interval("", "soon", 0, default).is_err());
    }

    #[test]
    fn interval_strings() {
        assert_eq!(parse_interval("30").unwrap(), TimeDelta::seconds(30));
        assert_eq!(parse_interval("<10s>").unwrap(), TimeDelta::seconds(10));
        assert_eq!(parse_interval("1d").unwrap(), TimeDelta::days(1));
    }

    #[test]
    fn formats_interval_in_largest_unit() {
        assert_eq!(format_interval(TimeDelta::milliseconds(0)), "1ms");
        assert_eq!(format_interval(TimeDelta::milliseconds(500)), "500ms");
        assert_eq!(format_interval(TimeDelta::seconds(90)), "1m");
        assert_eq!(format_interval(TimeDelta::hours(49)), "2d");
        assert_eq!(format_interval(TimeDelta::days(800)), "2y");
    }

    #[test]
    fn substitutes_template_variables() {
        let range = hour_range();
        assert_eq!(
            replace_template_variables(
                "_time:$__range | stats by (_time:$__interval) count() | limit $__interval_ms",
                30_000,
                &range,
            ),
            "_time:[1609459200, 1609462800] | stats by (_time:30s) count() | limit 30000"
        );
    }

    #[test]
    fn injects_time_filter_once() {
        let range = hour_range();
        assert_eq!(
            add_time_field_with_range("* | stats count()", &range),
            "_time:[1609459200, 1609462800] * | stats count()"
        );
        assert_eq!(
            add_time_field_with_range("_time:5m error | stats count()", &range),
            "_time:5m error | stats count()"
        );
        assert_eq!(
            add_time_field_with_range("error | stats by (_time:1m) count()", &range),
            "_time:[1609459200, 1609462800] error | stats by (_time:1m) count()"
        );
        assert_eq!(add_time_field_with_range("", &range), "");
    }
}
