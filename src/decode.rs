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

//! Response decoding.
//!
//! The response shape decides the decoder: a single document carrying
//! `data.resultType` is an aggregate result, one carrying `hits` is a
//! histogram, anything else is newline-delimited log records.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::{
    client::TransportError,
    error::AppError,
    frame::{
        AggregateResult, Frame, LogFrameBuilder, ParsedLogRecord, ResultKind, Series,
    },
    interval::TIME_FIELD,
    stream::parse_stream_labels,
    timestamp::parse_time,
};

pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 64 * 1024 * 1024;

const MESSAGE_FIELD: &str = "_msg";
const STREAM_FIELD: &str = "_stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Log lines longer than this are skipped.
    pub max_line_bytes: usize,
    /// Upper bound for a single aggregate or hits document.
    pub max_document_bytes: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedResponse {
    /// The body held nothing but whitespace.
    Empty,
    Logs(Frame),
    Aggregate(AggregateResult),
    Hits(Vec<Series>),
}

/// Reads newline-terminated lines, dropping any line longer than the given limit.
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    skipped: u64,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            skipped: 0,
        }
    }

    /// Number of oversized lines dropped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Returns the next line without its terminator. A final line without a
    /// trailing newline is still returned; `None` marks the end of the stream.
    pub async fn next_line(&mut self, limit: usize) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            self.buf.clear();
            let mut oversized = false;
            let mut read_any = false;
            let mut line_len = 0usize;
            loop {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    break;
                }
                read_any = true;
                let newline = available.iter().position(|byte| *byte == b'\n');
                let chunk_len = newline.unwrap_or(available.len());
                line_len += chunk_len;
                if !oversized {
                    if line_len > limit {
                        oversized = true;
                        self.buf.clear();
                    } else {
                        self.buf.extend_from_slice(&available[..chunk_len]);
                    }
                }
                let consumed = newline.map_or(chunk_len, |pos| pos + 1);
                self.reader.consume(consumed);
                if newline.is_some() {
                    break;
                }
            }
            if !read_any {
                return Ok(None);
            }
            if oversized {
                self.skipped += 1;
                warn!("skipping response line of {line_len} bytes, limit is {limit} bytes");
                continue;
            }
            return Ok(Some(std::mem::take(&mut self.buf)));
        }
    }

    async fn read_rest(&mut self, into: &mut Vec<u8>, limit: usize) -> Result<(), AppError> {
        let budget = limit.saturating_sub(into.len()) as u64 + 1;
        (&mut self.reader)
            .take(budget)
            .read_to_end(into)
            .await
            .map_err(TransportError::from)?;
        if into.len() > limit {
            return Err(AppError::Decode(format!(
                "response document exceeds {limit} bytes"
            )));
        }
        Ok(())
    }
}

/// Decodes one NDJSON line. Blank lines yield `None`.
pub fn decode_record(line: &[u8]) -> Result<Option<ParsedLogRecord>, AppError> {
    if is_blank(line) {
        return Ok(None);
    }
    let object: Map<String, Value> = serde_json::from_slice(line)
        .map_err(|err| AppError::Decode(format!("error decode response: {err}")))?;
    record_from_object(object).map(Some)
}

fn record_from_object(object: Map<String, Value>) -> Result<ParsedLogRecord, AppError> {
    let mut record = ParsedLogRecord::default();
    let mut fields = Vec::with_capacity(object.len());
    for (key, value) in object {
        match key.as_str() {
            MESSAGE_FIELD => record.message = Some(value_to_string(value)),
            TIME_FIELD => {
                let raw = value_to_string(value);
                if !raw.is_empty() {
                    let ts = parse_time(&raw).map_err(|err| {
                        AppError::Decode(format!("error parse time from _time field: {err}"))
                    })?;
                    record.timestamp = Some(ts);
                }
            }
            STREAM_FIELD => {
                let raw = value_to_string(value);
                let labels = parse_stream_labels(&raw).map_err(|err| {
                    AppError::Decode(format!("error parse stream field: {err}"))
                })?;
                for label in labels {
                    record.labels.insert(label.label, label.value);
                }
            }
            _ => fields.push((key, value_to_string(value))),
        }
    }
    record.labels.extend(fields);
    Ok(record)
}

/// Decodes a complete response body, choosing the decoder from its shape.
pub async fn decode_response<R>(
    reader: R,
    config: &DecoderConfig,
    now: DateTime<Utc>,
) -> Result<DecodedResponse, AppError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = LineReader::new(reader);
    let first = loop {
        match lines.next_line(config.max_document_bytes).await? {
            None => return Ok(DecodedResponse::Empty),
            Some(line) if is_blank(&line) => continue,
            Some(line) => break line,
        }
    };

    match serde_json::from_slice::<Map<String, Value>>(&first) {
        Ok(object) => match Shape::of(&object) {
            Shape::Aggregate => decode_aggregate(object),
            Shape::Hits => decode_hits(object),
            Shape::Records => {
                let mut builder = LogFrameBuilder::new();
                if first.len() > config.max_line_bytes {
                    warn!(
                        "skipping response line of {} bytes, limit is {} bytes",
                        first.len(),
                        config.max_line_bytes
                    );
                } else {
                    builder.push(record_from_object(object)?, now);
                }
                while let Some(line) = lines.next_line(config.max_line_bytes).await? {
                    if let Some(record) = decode_record(&line)? {
                        builder.push(record, now);
                    }
                }
                Ok(DecodedResponse::Logs(builder.finish()))
            }
        },
        Err(line_err) => {
            // Possibly a document spread over several lines.
            let mut body = first;
            body.push(b'\n');
            lines.read_rest(&mut body, config.max_document_bytes).await?;
            let object = serde_json::from_slice::<Map<String, Value>>(&body)
                .map_err(|_| AppError::Decode(format!("error decode response: {line_err}")))?;
            match Shape::of(&object) {
                Shape::Aggregate => decode_aggregate(object),
                Shape::Hits => decode_hits(object),
                Shape::Records => Err(AppError::Decode(format!(
                    "error decode response: {line_err}"
                ))),
            }
        }
    }
}

enum Shape {
    Aggregate,
    Hits,
    Records,
}

impl Shape {
    fn of(object: &Map<String, Value>) -> Self {
        let reserved = [MESSAGE_FIELD, TIME_FIELD, STREAM_FIELD]
            .iter()
            .any(|field| object.contains_key(*field));
        if reserved {
            return Shape::Records;
        }
        let has_result_type = object
            .get("data")
            .and_then(Value::as_object)
            .is_some_and(|data| data.contains_key("resultType"));
        if has_result_type {
            Shape::Aggregate
        } else if object.get("hits").is_some_and(Value::is_array) {
            Shape::Hits
        } else {
            Shape::Records
        }
    }
}

#[derive(Deserialize)]
struct AggregateResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: Option<AggregateData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregateData {
    result_type: String,
    #[serde(default)]
    result: Vec<RawSeries>,
}

#[derive(Deserialize)]
struct RawSeries {
    #[serde(default)]
    metric: BTreeMap<String, Value>,
    #[serde(default)]
    value: Option<(Value, Value)>,
    #[serde(default)]
    values: Vec<(Value, Value)>,
}

fn decode_aggregate(object: Map<String, Value>) -> Result<DecodedResponse, AppError> {
    let response: AggregateResponse = serde_json::from_value(Value::Object(object))
        .map_err(|err| AppError::Decode(format!("error decode response: {err}")))?;
    if response.status != "success" {
        return Err(AppError::Upstream {
            status: 200,
            message: response
                .error
                .unwrap_or_else(|| format!("unexpected response status {:?}", response.status)),
        });
    }
    let data = response
        .data
        .ok_or_else(|| AppError::Decode("response has no data".to_string()))?;
    let kind = match data.result_type.as_str() {
        "vector" => ResultKind::Vector,
        "matrix" => ResultKind::Matrix,
        other => {
            return Err(AppError::Decode(format!("unknown result type {other:?}")));
        }
    };

    let series = data
        .result
        .into_iter()
        .map(|raw| -> Result<Series, AppError> {
            let labels = raw
                .metric
                .into_iter()
                .map(|(name, value)| (name, value_to_string(value)))
                .collect();
            let raw_points = match kind {
                ResultKind::Vector => raw.value.into_iter().collect(),
                ResultKind::Matrix => raw.values,
            };
            let points = raw_points
                .into_iter()
                .map(|(ts, value)| -> Result<_, AppError> {
                    Ok((point_time(&ts)?, point_value(&value)?))
                })
                .collect::<Result<Vec<_>, AppError>>()?;
            Ok(Series { labels, points })
        })
        .collect::<Result<Vec<_>, AppError>>()?;

    Ok(DecodedResponse::Aggregate(AggregateResult { kind, series }))
}

#[derive(Deserialize)]
struct HitsResponse {
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(default)]
    fields: BTreeMap<String, Value>,
    #[serde(default)]
    timestamps: Vec<Value>,
    #[serde(default)]
    values: Vec<Value>,
}

fn decode_hits(object: Map<String, Value>) -> Result<DecodedResponse, AppError> {
    let response: HitsResponse = serde_json::from_value(Value::Object(object))
        .map_err(|err| AppError::Decode(format!("error decode hits response: {err}")))?;
    let series = response
        .hits
        .into_iter()
        .map(|hit| -> Result<Series, AppError> {
            if hit.timestamps.len() != hit.values.len() {
                return Err(AppError::Decode(format!(
                    "hits response has {} timestamps but {} values",
                    hit.timestamps.len(),
                    hit.values.len()
                )));
            }
            let points = hit
                .timestamps
                .iter()
                .zip(&hit.values)
                .map(|(ts, value)| -> Result<_, AppError> {
                    Ok((point_time(ts)?, point_value(value)?))
                })
                .collect::<Result<Vec<_>, AppError>>()?;
            let labels = hit
                .fields
                .into_iter()
                .map(|(name, value)| (name, value_to_string(value)))
                .collect();
            Ok(Series { labels, points })
        })
        .collect::<Result<Vec<_>, AppError>>()?;
    Ok(DecodedResponse::Hits(series))
}

/// Point timestamps are Unix seconds (possibly fractional) or timestamp strings.
fn point_time(raw: &Value) -> Result<DateTime<Utc>, AppError> {
    match raw {
        Value::Number(number) => {
            let secs = number
                .as_f64()
                .ok_or_else(|| AppError::Decode(format!("invalid timestamp {number}")))?;
            Utc.timestamp_millis_opt((secs * 1_000.0).round() as i64)
                .single()
                .ok_or_else(|| AppError::Decode(format!("timestamp {number} is out of range")))
        }
        Value::String(text) => parse_time(text)
            .map_err(|err| AppError::Decode(format!("cannot parse timestamp: {err}"))),
        other => Err(AppError::Decode(format!("unexpected timestamp {other}"))),
    }
}

/// Empty strings and nulls are missing values, not errors.
fn point_value(raw: &Value) -> Result<Option<f64>, AppError> {
    match raw {
        Value::Null => Ok(None),
        Value::Number(number) => Ok(number.as_f64()),
        Value::String(text) if text.trim().is_empty() => Ok(None),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|err| AppError::Decode(format!("cannot parse value {text:?}: {err}"))),
        other => Err(AppError::Decode(format!("unexpected value {other}"))),
    }
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}
