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

use chrono::{DateTime, Utc};
use log::debug;
use url::{Url, form_urlencoded};

use crate::{
    error::AppError,
    interval::{
        add_time_field_with_range, calculate_step, default_interval, replace_template_variables,
        resolve_min_interval,
    },
    query::{Query, QueryKind, TimeRange},
    settings::{DatasourceSettings, HttpMethod},
    timestamp::format_duration,
};

/// A fully resolved request against the log-search API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub kind: QueryKind,
    pub method: HttpMethod,
    pub url: Url,
    /// Expression actually sent, after template substitution and `_time` injection.
    pub expr: String,
}

type Params = BTreeMap<String, Vec<String>>;

pub fn translate(
    query: &Query,
    settings: &DatasourceSettings,
    now: DateTime<Utc>,
) -> Result<QueryRequest, AppError> {
    if settings.url.trim().is_empty() {
        return Err(AppError::Translation("url can't be blank".to_string()));
    }
    let mut url = Url::parse(settings.url.trim()).map_err(|err| {
        AppError::Translation(format!("failed to parse datasource url: {err}"))
    })?;
    let custom = parse_custom_params(&settings.custom_query_params)?;

    let mut params = Params::new();
    for (key, value) in url.query_pairs() {
        add(&mut params, &key, value.into_owned());
    }
    for (key, value) in custom {
        add(&mut params, &key, value);
    }

    let range = query.time_range_at(now);
    let expr = replace_template_variables(&query.expr, query.interval_ms, &range);
    let expr = match query.kind {
        QueryKind::Instant => {
            set(&mut params, "limit", query.max_lines().to_string());
            set_bounds(&mut params, &range);
            expr
        }
        QueryKind::Stats => {
            set(&mut params, "time", range.to.timestamp().to_string());
            add_time_field_with_range(&expr, &range)
        }
        QueryKind::StatsRange | QueryKind::Hits => {
            set_bounds(&mut params, &range);
            set(&mut params, "step", step(query, settings, &range)?);
            if let Some(offset) = query.timezone_offset.as_deref()
                && !offset.trim().is_empty()
            {
                set(&mut params, "offset", offset.trim().to_string());
            }
            if query.kind == QueryKind::Hits {
                for field in &query.fields {
                    add(&mut params, "field", field.clone());
                }
                if !query.extra_filters.trim().is_empty() {
                    set(&mut params, "extra_filters", query.extra_filters.clone());
                }
            }
            expr
        }
        QueryKind::Tail => expr,
    };
    set(&mut params, "query", expr.clone());

    let path = request_path(url.path(), &settings.api_prefix, query.kind);
    url.set_path(&path);
    url.set_query(None);
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, values) in &params {
            for value in values {
                pairs.append_pair(key, value);
            }
        }
    }

    debug!(
        "translated {} query {:?} to {} {}",
        query.kind.as_str(),
        query.ref_id,
        settings.http_method,
        url
    );
    Ok(QueryRequest {
        kind: query.kind,
        method: settings.http_method,
        url,
        expr,
    })
}

fn step(
    query: &Query,
    settings: &DatasourceSettings,
    range: &TimeRange,
) -> Result<String, AppError> {
    if let Some(step) = query.step.as_deref()
        && !step.trim().is_empty()
    {
        return Ok(step.trim().to_string());
    }
    let ds_interval = if query.time_interval.trim().is_empty() {
        settings.min_interval.as_str()
    } else {
        query.time_interval.as_str()
    };
    let min_interval = resolve_min_interval(
        ds_interval,
        &query.interval,
        query.interval_ms,
        default_interval(),
    )
    .map_err(|err| AppError::Translation(format!("failed to calculate minimal interval: {err}")))?;
    Ok(format_duration(calculate_step(
        min_interval,
        range,
        query.max_data_points,
    )))
}

fn request_path(base: &str, prefix: &str, kind: QueryKind) -> String {
    let base = base.trim_end_matches('/');
    let prefix = prefix.trim().trim_matches('/');
    if prefix.is_empty() {
        format!("{base}{}", kind.path())
    } else {
        format!("{base}/{prefix}{}", kind.path())
    }
}

fn parse_custom_params(raw: &str) -> Result<Vec<(String, String)>, AppError> {
    let raw = raw.trim().trim_start_matches('?');
    let bytes = raw.as_bytes();
    for (idx, byte) in bytes.iter().enumerate() {
        if *byte != b'%' {
            continue;
        }
        let valid = bytes
            .get(idx + 1..idx + 3)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
        if !valid {
            let escape: String = raw[idx..].chars().take(3).collect();
            return Err(AppError::Translation(format!(
                "failed to parse query params: invalid URL escape {escape:?}"
            )));
        }
    }
    Ok(form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .filter(|(key, _)| !key.is_empty())
        .collect())
}

fn set_bounds(params: &mut Params, range: &TimeRange) {
    set(params, "start", range.from.timestamp().to_string());
    set(params, "end", range.to.timestamp().to_string());
}

fn set(params: &mut Params, key: &str, value: String) {
    params.insert(key.to_string(), vec![value]);
}

fn add(params: &mut Params, key: &str, value: String) {
    params.entry(key.to_string()).or_default().push(value);
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::query::RawTimeRange;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 1, 0, 0).unwrap()
    }

    fn query(kind: QueryKind, expr: &str) -> Query {
        Query {
            ref_id: "A".to_string(),
            expr: expr.to_string(),
            kind,
            time_range: RawTimeRange {
                from: Some(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()),
                to: Some(Utc.with_ymd_and_hms(2021, 1, 1, 1, 0, 0).unwrap()),
            },
            ..Query::default()
        }
    }

    fn settings() -> DatasourceSettings {
        DatasourceSettings::new("http://127.0.0.1:9428")
    }

    #[test]
    fn instant_query() {
        let mut q = query(QueryKind::Instant, "_time:1s");
        q.max_lines = 10;
        let request = translate(&q, &settings(), now()).unwrap();
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.url.path(), "/select/logsql/query");
        assert_eq!(
            request.url.query(),
            Some("end=1609462800&limit=10&query=_time%3A1s&start=1609459200")
        );
    }

    #[test]
    fn instant_query_defaults_limit() {
        let request = translate(&query(QueryKind::Instant, ""), &settings(), now()).unwrap();
        assert_eq!(
            request.url.as_str(),
            "http://127.0.0.1:9428/select/logsql/query?end=1609462800&limit=1000&query=&start=1609459200"
        );
    }

    #[test]
    fn stats_query_injects_time_filter() {
        let q = query(QueryKind::Stats, "* and syslog | stats by(type) count()");
        let request = translate(&q, &settings(), now()).unwrap();
        assert_eq!(
            request.url.as_str(),
            "http://127.0.0.1:9428/select/logsql/stats_query?query=_time%3A%5B1609459200%2C+1609462800%5D+*+and+syslog+%7C+stats+by%28type%29+count%28%29&time=1609462800"
        );
        assert_eq!(
            request.expr,
            "_time:[1609459200, 1609462800] * and syslog | stats by(type) count()"
        );

        let q = query(QueryKind::Stats, "_time:1s | stats by(type) count()");
        let request = translate(&q, &settings(), now()).unwrap();
        assert_eq!(request.expr, "_time:1s | stats by(type) count()");
    }

    #[test]
    fn stats_range_query_computes_step() {
        let q = query(QueryKind::StatsRange, "_time:1s | stats by(type) count()");
        let request = translate(&q, &settings(), now()).unwrap();
        assert_eq!(
            request.url.query(),
            Some("end=1609462800&query=_time%3A1s+%7C+stats+by%28type%29+count%28%29&start=1609459200&step=15s")
        );

        let mut q = query(QueryKind::StatsRange, "*");
        q.step = Some("1m".to_string());
        q.timezone_offset = Some("3h".to_string());
        let request = translate(&q, &settings(), now()).unwrap();
        assert_eq!(
            request.url.query(),
            Some("end=1609462800&offset=3h&query=*&start=1609459200&step=1m")
        );
    }

    #[test]
    fn hits_query_repeats_fields() {
        let mut q = query(QueryKind::Hits, "error");
        q.fields = vec!["level".to_string(), "app".to_string()];
        q.extra_filters = r#"{"level":"warn"}"#.to_string();
        q.interval_ms = 60_000;
        let request = translate(&q, &settings(), now()).unwrap();
        assert_eq!(request.url.path(), "/select/logsql/hits");
        assert_eq!(
            request.url.query(),
            Some("end=1609462800&extra_filters=%7B%22level%22%3A%22warn%22%7D&field=level&field=app&query=error&start=1609459200&step=1m")
        );
    }

    #[test]
    fn tail_query_sets_only_query() {
        let q = query(QueryKind::Tail, "error");
        let request = translate(&q, &settings(), now()).unwrap();
        assert_eq!(
            request.url.as_str(),
            "http://127.0.0.1:9428/select/logsql/tail?query=error"
        );
    }

    #[test]
    fn merges_base_and_custom_params() {
        let mut settings = DatasourceSettings::new("http://vl:9428/prefix/?tenant=7");
        settings.custom_query_params = "a=1&b=2".to_string();
        settings.http_method = HttpMethod::Post;
        let mut q = query(QueryKind::Instant, "_time:1s and syslog");
        q.max_lines = 10;
        let request = translate(&q, &settings, now()).unwrap();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(
            request.url.as_str(),
            "http://vl:9428/prefix/select/logsql/query?a=1&b=2&end=1609462800&limit=10&query=_time%3A1s+and+syslog&start=1609459200&tenant=7"
        );
    }

    #[test]
    fn substitutes_template_variables() {
        let mut q = query(QueryKind::Instant, "_time:$__range | limit $__interval_ms");
        q.interval_ms = 500;
        let request = translate(&q, &settings(), now()).unwrap();
        assert_eq!(request.expr, "_time:[1609459200, 1609462800] | limit 500");
    }

    #[test]
    fn rejects_bad_inputs() {
        let q = query(QueryKind::Instant, "*");
        let err = translate(&q, &DatasourceSettings::new(""), now()).unwrap_err();
        assert_eq!(err.to_string(), "url can't be blank");

        let err = translate(&q, &DatasourceSettings::new("not a url"), now()).unwrap_err();
        assert!(err.to_string().starts_with("failed to parse datasource url"));

        let mut settings = settings();
        settings.custom_query_params = "a=%zz".to_string();
        let err = translate(&q, &settings, now()).unwrap_err();
        assert!(matches!(err, AppError::Translation(_)));

        let mut q = query(QueryKind::StatsRange, "*");
        q.interval = "soon".to_string();
        let err = translate(&q, &DatasourceSettings::new("http://vl:9428"), now()).unwrap_err();
        assert!(err.to_string().starts_with("failed to calculate minimal interval"));
    }
}
