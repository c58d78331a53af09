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

//! Column-oriented result frames.
//!
//! A frame serialises as `{"schema": ..., "data": ...}`. The schema half is
//! what live tailing compares between consecutive frames; the data half is
//! the incremental payload sent when the schema did not change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::query::Query;

pub const TIME_FIELD: &str = "Time";
pub const LINE_FIELD: &str = "Line";
pub const LABELS_FIELD: &str = "labels";
pub const VALUE_FIELD: &str = "Value";
const LOGS_VISUALISATION: &str = "logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameType {
    #[serde(rename = "log-lines")]
    Logs,
    #[serde(rename = "timeseries-multi")]
    TimeSeriesMulti,
    #[serde(rename = "numeric-multi")]
    NumericMulti,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct FrameMeta {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub frame_type: Option<FrameType>,
    #[serde(
        rename = "preferredVisualisationType",
        skip_serializing_if = "Option::is_none"
    )]
    pub preferred_visualisation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Time,
    String,
    Json,
    Number,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name_from_ds: Option<String>,
    /// Expected spacing between points, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
}

impl FieldConfig {
    fn is_empty(&self) -> bool {
        self.display_name_from_ds.is_none() && self.interval.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValues {
    Time(Vec<DateTime<Utc>>),
    String(Vec<String>),
    Json(Vec<Value>),
    Number(Vec<Option<f64>>),
}

impl FieldValues {
    pub fn len(&self) -> usize {
        match self {
            FieldValues::Time(values) => values.len(),
            FieldValues::String(values) => values.len(),
            FieldValues::Json(values) => values.len(),
            FieldValues::Number(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValues::Time(_) => FieldType::Time,
            FieldValues::String(_) => FieldType::String,
            FieldValues::Json(_) => FieldType::Json,
            FieldValues::Number(_) => FieldType::Number,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            FieldValues::Time(values) => values
                .iter()
                .map(|ts| Value::from(ts.timestamp_millis()))
                .collect(),
            FieldValues::String(values) => values.iter().cloned().map(Value::String).collect(),
            FieldValues::Json(values) => Value::Array(values.clone()),
            FieldValues::Number(values) => values
                .iter()
                .map(|value| value.map_or(Value::Null, Value::from))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub config: FieldConfig,
    pub values: FieldValues,
}

impl Field {
    pub fn new(name: impl Into<String>, values: FieldValues) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            config: FieldConfig::default(),
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub name: String,
    pub meta: FrameMeta,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSchema {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub meta: FrameMeta,
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "FieldConfig::is_empty")]
    pub config: FieldConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameData {
    pub values: Vec<Value>,
}

impl Frame {
    pub fn rows(&self) -> usize {
        self.fields.first().map_or(0, |field| field.values.len())
    }

    pub fn schema(&self) -> FrameSchema {
        FrameSchema {
            name: self.name.clone(),
            meta: self.meta.clone(),
            fields: self
                .fields
                .iter()
                .map(|field| FieldSchema {
                    name: field.name.clone(),
                    field_type: field.values.field_type(),
                    labels: field.labels.clone(),
                    config: field.config.clone(),
                })
                .collect(),
        }
    }

    pub fn data(&self) -> FrameData {
        FrameData {
            values: self.fields.iter().map(|field| field.values.to_json()).collect(),
        }
    }
}

impl Serialize for Frame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        struct Wire {
            schema: FrameSchema,
            data: FrameData,
        }

        Wire {
            schema: self.schema(),
            data: self.data(),
        }
        .serialize(serializer)
    }
}

/// One decoded log line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLogRecord {
    pub message: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Stream labels plus every non-reserved top-level field.
    pub labels: BTreeMap<String, String>,
}

/// Accumulates log records into the Time/Line/labels columns.
///
/// Every push appends exactly one value to each column. A record without a
/// timestamp gets `now`; one without a message gets its labels as JSON.
#[derive(Debug, Default)]
pub struct LogFrameBuilder {
    times: Vec<DateTime<Utc>>,
    lines: Vec<String>,
    labels: Vec<Value>,
}

impl LogFrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn push(&mut self, record: ParsedLogRecord, now: DateTime<Utc>) {
        let labels = Value::Object(
            record
                .labels
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect::<Map<String, Value>>(),
        );
        self.times.push(record.timestamp.unwrap_or(now));
        self.lines
            .push(record.message.unwrap_or_else(|| labels.to_string()));
        self.labels.push(labels);
    }

    pub fn finish(self) -> Frame {
        Frame {
            name: String::new(),
            meta: FrameMeta {
                frame_type: Some(FrameType::Logs),
                preferred_visualisation: Some(LOGS_VISUALISATION.to_string()),
            },
            fields: vec![
                Field::new(TIME_FIELD, FieldValues::Time(self.times)),
                Field::new(LINE_FIELD, FieldValues::String(self.lines)),
                Field::new(LABELS_FIELD, FieldValues::Json(self.labels)),
            ],
        }
    }
}

pub fn log_frame(
    records: impl IntoIterator<Item = ParsedLogRecord>,
    now: DateTime<Utc>,
) -> Frame {
    let mut builder = LogFrameBuilder::new();
    for record in records {
        builder.push(record, now);
    }
    builder.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Vector,
    Matrix,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<(DateTime<Utc>, Option<f64>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult {
    pub kind: ResultKind,
    pub series: Vec<Series>,
}

/// Output shape for numeric results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesShape {
    /// Time + Value columns.
    TimeSeries,
    /// Value column only, for alert evaluation of instant vectors.
    Numeric,
}

impl SeriesShape {
    pub fn for_result(kind: ResultKind, for_alerting: bool) -> Self {
        if for_alerting && kind == ResultKind::Vector {
            SeriesShape::Numeric
        } else {
            SeriesShape::TimeSeries
        }
    }
}

/// Builds one frame per series, named by the query legend.
pub fn series_frames(
    series: Vec<Series>,
    shape: SeriesShape,
    query: &Query,
    expr: &str,
) -> Vec<Frame> {
    series
        .into_iter()
        .map(|series| series_frame(series, shape, query, expr))
        .collect()
}

fn series_frame(series: Series, shape: SeriesShape, query: &Query, expr: &str) -> Frame {
    let legend = query.legend(expr, &series.labels);
    let (times, values): (Vec<_>, Vec<_>) = series.points.into_iter().unzip();

    let mut value = Field::new(VALUE_FIELD, FieldValues::Number(values));
    value.labels = series.labels;
    if !legend.is_empty() {
        value.config.display_name_from_ds = Some(legend.clone());
    }

    let (frame_type, fields) = match shape {
        SeriesShape::Numeric => (FrameType::NumericMulti, vec![value]),
        SeriesShape::TimeSeries => {
            let mut time = Field::new(TIME_FIELD, FieldValues::Time(times));
            if query.interval_ms > 0 {
                time.config.interval = Some(query.interval_ms as f64);
            }
            (FrameType::TimeSeriesMulti, vec![time, value])
        }
    };

    Frame {
        name: legend,
        meta: FrameMeta {
            frame_type: Some(frame_type),
            preferred_visualisation: None,
        },
        fields,
    }
}
