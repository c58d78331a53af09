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

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use log::{debug, error};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    client::{HttpExecutor, HttpRequest, send},
    decode::{DecodedResponse, DecoderConfig, LineReader, decode_record, decode_response},
    error::{AppError, DataStatus},
    frame::{Frame, SeriesShape, log_frame, series_frames},
    query::{Query, QueryKind},
    settings::DatasourceSettings,
    tail::{FrameSender, StreamSink, SubscriptionRegistry},
    translate::{QueryRequest, translate},
};

/// Result slot for one query of a batch.
#[derive(Debug, Serialize)]
pub struct DataResponse {
    pub frames: Vec<Frame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DataStatus>,
}

impl DataResponse {
    pub fn frames(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            error: None,
            status: None,
        }
    }

    pub fn error(err: &AppError) -> Self {
        Self {
            frames: Vec::new(),
            error: Some(err.to_string()),
            status: Some(err.status()),
        }
    }
}

pub struct Datasource {
    settings: DatasourceSettings,
    query_executor: Arc<dyn HttpExecutor>,
    tail_executor: Arc<dyn HttpExecutor>,
    registry: SubscriptionRegistry,
    decoder: DecoderConfig,
}

impl Datasource {
    /// `query_executor` serves point queries and should carry a finite
    /// timeout; `tail_executor` serves live tails and should not.
    pub fn new(
        settings: DatasourceSettings,
        query_executor: Arc<dyn HttpExecutor>,
        tail_executor: Arc<dyn HttpExecutor>,
    ) -> Self {
        Self {
            settings,
            query_executor,
            tail_executor,
            registry: SubscriptionRegistry::new(),
            decoder: DecoderConfig::default(),
        }
    }

    pub fn with_decoder(mut self, decoder: DecoderConfig) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn settings(&self) -> &DatasourceSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn translate(&self, query: &Query) -> Result<QueryRequest, AppError> {
        translate(query, &self.settings, Utc::now())
    }

    /// Runs every query concurrently and collects the results by ref id.
    ///
    /// All queries are translated before anything is sent; one translation
    /// failure rejects the whole batch. Failures after that stay in the
    /// failing query's slot.
    pub async fn query_data(
        &self,
        queries: Vec<Query>,
    ) -> Result<BTreeMap<String, DataResponse>, AppError> {
        let now = Utc::now();
        let requests = queries
            .into_iter()
            .map(|query| {
                let request = translate(&query, &self.settings, now)?;
                Ok((query, request))
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        let tasks: Vec<(String, JoinHandle<Result<Vec<Frame>, AppError>>)> = requests
            .into_iter()
            .map(|(query, request)| {
                let executor = Arc::clone(&self.query_executor);
                let decoder = self.decoder;
                let ref_id = query.ref_id.clone();
                let task = tokio::spawn(async move {
                    run_query(executor.as_ref(), &query, &request, &decoder).await
                });
                (ref_id, task)
            })
            .collect();

        let mut responses = BTreeMap::new();
        for (ref_id, task) in tasks {
            let response = match task.await {
                Ok(Ok(frames)) => DataResponse::frames(frames),
                Ok(Err(err)) => {
                    error!("query {ref_id:?} failed: {err}");
                    DataResponse::error(&err)
                }
                Err(join_err) => {
                    error!("query {ref_id:?} task failed: {join_err}");
                    DataResponse::error(&AppError::Internal(format!(
                        "query task failed: {join_err}"
                    )))
                }
            };
            responses.insert(ref_id, response);
        }
        Ok(responses)
    }

    /// Registers the channel for `path`.
    pub fn subscribe(&self, path: &str) -> FrameSender {
        self.registry.subscribe(path)
    }

    /// Starts the dispatcher for a subscribed `path`.
    pub fn run_stream<S>(&self, path: &str, sink: S) -> Result<JoinHandle<()>, AppError>
    where
        S: StreamSink + 'static,
    {
        self.registry.run_stream(path, sink)
    }

    pub fn unsubscribe(&self, path: &str) -> bool {
        self.registry.unsubscribe(path)
    }

    /// Unsubscribes only the subscription `sender` belongs to.
    pub fn release(&self, sender: &FrameSender) -> bool {
        self.registry.release(sender)
    }

    /// Follows the tail endpoint for `query`, pushing one frame per log line
    /// into `sender` until the response ends or the subscription closes.
    pub async fn run_tail(&self, mut query: Query, sender: FrameSender) -> Result<(), AppError> {
        query.kind = QueryKind::Tail;
        let request = self.translate(&query)?;
        let http_request = HttpRequest::from(&request);
        let body = tokio::select! {
            biased;
            _ = sender.closed() => return Ok(()),
            body = send(self.tail_executor.as_ref(), &http_request) => body?,
        };
        let Some(body) = body else {
            debug!("tail for {} returned no data", sender.path());
            return Ok(());
        };

        let mut lines = LineReader::new(body);
        loop {
            let line = tokio::select! {
                biased;
                _ = sender.closed() => break,
                line = lines.next_line(self.decoder.max_line_bytes) => line?,
            };
            let Some(line) = line else {
                break;
            };
            let Some(record) = decode_record(&line)? else {
                continue;
            };
            if !sender.send(log_frame([record], Utc::now())).await {
                break;
            }
        }
        debug!("tail for {} finished", sender.path());
        Ok(())
    }

    /// Closes every live subscription.
    pub fn dispose(&self) {
        self.registry.dispose();
    }
}

async fn run_query(
    executor: &dyn HttpExecutor,
    query: &Query,
    request: &QueryRequest,
    decoder: &DecoderConfig,
) -> Result<Vec<Frame>, AppError> {
    let Some(body) = send(executor, &HttpRequest::from(request)).await? else {
        return Ok(Vec::new());
    };
    let frames = match decode_response(body, decoder, Utc::now()).await? {
        DecodedResponse::Empty => Vec::new(),
        DecodedResponse::Logs(frame) => vec![frame],
        DecodedResponse::Aggregate(result) => series_frames(
            result.series,
            SeriesShape::for_result(result.kind, query.for_alerting),
            query,
            &request.expr,
        ),
        DecodedResponse::Hits(series) => {
            series_frames(series, SeriesShape::TimeSeries, query, &request.expr)
        }
    };
    Ok(frames)
}

/// Interprets the `FromAlert` request header. Missing or empty means `false`.
pub fn parse_alerting_header(value: Option<&str>) -> Result<bool, AppError> {
    match value.map(str::trim) {
        None | Some("") => Ok(false),
        Some("1" | "t" | "T" | "true" | "TRUE" | "True") => Ok(true),
        Some("0" | "f" | "F" | "false" | "FALSE" | "False") => Ok(false),
        Some(other) => Err(AppError::Translation(format!(
            "failed to parse FromAlert header value: {other}"
        ))),
    }
}
