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

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, de};

use crate::timestamp::parse_time;

pub const DEFAULT_MAX_LINES: i64 = 1000;
pub const LEGEND_FORMAT_AUTO: &str = "__auto";
const METRIC_NAME_LABEL: &str = "__name__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryKind {
    #[default]
    Instant,
    Stats,
    StatsRange,
    Hits,
    Tail,
}

impl QueryKind {
    pub fn path(self) -> &'static str {
        match self {
            QueryKind::Instant => "/query",
            QueryKind::Stats => "/stats_query",
            QueryKind::StatsRange => "/stats_query_range",
            QueryKind::Hits => "/hits",
            QueryKind::Tail => "/tail",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Instant => "instant",
            QueryKind::Stats => "stats",
            QueryKind::StatsRange => "statsRange",
            QueryKind::Hits => "hits",
            QueryKind::Tail => "tail",
        }
    }
}

impl<'de> Deserialize<'de> for QueryKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw.as_deref() {
            Some("stats") => QueryKind::Stats,
            Some("statsRange") => QueryKind::StatsRange,
            Some("hits") => QueryKind::Hits,
            Some("tail") => QueryKind::Tail,
            // unknown kinds fall back to a plain log search
            _ => QueryKind::Instant,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Time range as sent by the caller; either bound may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RawTimeRange {
    #[serde(default, deserialize_with = "deserialize_bound")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_bound")]
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default)]
    pub ref_id: String,
    #[serde(default)]
    pub expr: String,
    #[serde(default, rename = "queryType")]
    pub kind: QueryKind,
    #[serde(default)]
    pub time_range: RawTimeRange,
    #[serde(default)]
    pub max_lines: i64,
    #[serde(default)]
    pub max_data_points: i64,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub interval_ms: i64,
    #[serde(default)]
    pub interval: String,
    /// Per-query override of the datasource minimum interval.
    #[serde(default)]
    pub time_interval: String,
    #[serde(default)]
    pub legend_format: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub extra_filters: String,
    #[serde(default)]
    pub timezone_offset: Option<String>,
    #[serde(skip)]
    pub for_alerting: bool,
}

impl Query {
    pub fn max_lines(&self) -> i64 {
        if self.max_lines <= 0 {
            DEFAULT_MAX_LINES
        } else {
            self.max_lines
        }
    }

    /// Resolves missing bounds to `now-5m` and `now`.
    pub fn time_range_at(&self, now: DateTime<Utc>) -> TimeRange {
        TimeRange {
            from: self
                .time_range
                .from
                .unwrap_or_else(|| now - TimeDelta::minutes(5)),
            to: self.time_range.to.unwrap_or(now),
        }
    }

    /// Display name for a series: legend template, `__auto`, or the canonical label rendering.
    pub fn legend(&self, expr: &str, labels: &BTreeMap<String, String>) -> String {
        match self.legend_format.as_str() {
            LEGEND_FORMAT_AUTO => expr.to_string(),
            "" => {
                let rendered = labels_to_string(labels);
                if rendered == "{}" {
                    expr.to_string()
                } else {
                    rendered
                }
            }
            template => {
                let rendered = render_legend(template, labels);
                if rendered.is_empty() {
                    expr.to_string()
                } else {
                    rendered
                }
            }
        }
    }
}

/// Replaces `{{ label }}` placeholders with label values; unknown labels render empty.
fn render_legend(template: &str, labels: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = rest[start + 2..start + 2 + len].trim();
        if let Some(value) = labels.get(name) {
            out.push_str(value);
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    out
}

/// Renders `name{k="v",...}` with sorted labels, excluding `__name__`.
pub fn labels_to_string(labels: &BTreeMap<String, String>) -> String {
    let metric = labels
        .get(METRIC_NAME_LABEL)
        .map(String::as_str)
        .unwrap_or_default();
    let pairs = labels
        .iter()
        .filter(|(name, _)| name.as_str() != METRIC_NAME_LABEL)
        .map(|(name, value)| format!("{name}={value:?}"))
        .collect::<Vec<_>>();
    if pairs.is_empty() && !metric.is_empty() {
        return metric.to_string();
    }
    format!("{metric}{{{}}}", pairs.join(","))
}

fn deserialize_bound<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawBound {
        Text(String),
        Number(f64),
    }

    let text = match Option::<RawBound>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(RawBound::Number(value)) if value == 0.0 => return Ok(None),
        Some(RawBound::Number(value)) => value.to_string(),
        Some(RawBound::Text(text)) if text.trim().is_empty() || text.trim() == "0" => {
            return Ok(None);
        }
        Some(RawBound::Text(text)) => text,
    };
    parse_time(&text).map(Some).map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn deserializes_grafana_style_query() {
        let query: Query = serde_json::from_str(
            r#"{
                "refId": "A",
                "expr": "error",
                "queryType": "statsRange",
                "timeRange": {"from": "1609459200000", "to": "2021-01-01T01:00:00Z"},
                "maxDataPoints": 600,
                "intervalMs": 2000,
                "legendFormat": "{{level}}",
                "fields": ["level"]
            }"#,
        )
        .unwrap();
        assert_eq!(query.ref_id, "A");
        assert_eq!(query.kind, QueryKind::StatsRange);
        assert_eq!(
            query.time_range.from,
            Some(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            query.time_range.to,
            Some(Utc.with_ymd_and_hms(2021, 1, 1, 1, 0, 0).unwrap())
        );
        assert_eq!(query.max_lines(), DEFAULT_MAX_LINES);
        assert!(!query.for_alerting);
    }

    #[test]
    fn unknown_kind_is_instant() {
        let query: Query = serde_json::from_str(r#"{"queryType": "logs"}"#).unwrap();
        assert_eq!(query.kind, QueryKind::Instant);
        let query: Query = serde_json::from_str(r#"{"queryType": null}"#).unwrap();
        assert_eq!(query.kind, QueryKind::Instant);
    }

    #[test]
    fn missing_bounds_default_to_last_five_minutes() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let query: Query =
            serde_json::from_str(r#"{"timeRange": {"from": 0, "to": ""}}"#).unwrap();
        let range = query.time_range_at(now);
        assert_eq!(range.to, now);
        assert_eq!(range.from, now - TimeDelta::minutes(5));
    }

    #[test]
    fn rejects_unparsable_bounds() {
        let result = serde_json::from_str::<Query>(r#"{"timeRange": {"from": "yesterday-ish"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn legend_variants() {
        let labels = BTreeMap::from([
            ("__name__".to_string(), "hits".to_string()),
            ("level".to_string(), "error".to_string()),
            ("app".to_string(), "web".to_string()),
        ]);
        let mut query = Query::default();
        assert_eq!(query.legend("expr", &labels), r#"hits{app="web",level="error"}"#);
        assert_eq!(query.legend("expr", &BTreeMap::new()), "expr");

        query.legend_format = LEGEND_FORMAT_AUTO.to_string();
        assert_eq!(query.legend("expr", &labels), "expr");

        query.legend_format = "{{ level }} on {{app}}".to_string();
        assert_eq!(query.legend("expr", &labels), "error on web");

        query.legend_format = "{{missing}}".to_string();
        assert_eq!(query.legend("expr", &labels), "expr");
    }
}
