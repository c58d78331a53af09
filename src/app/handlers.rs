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

use std::{collections::BTreeMap, time::Instant};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path, Query as QueryParams, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use victorialogs_datasource::{
    AppError, DataResponse,
    datasource::parse_alerting_header,
    frame::Frame,
    query::{Query, QueryKind},
    tail::{SinkError, StreamSink},
};

use super::state::AppState;

const FROM_ALERT_HEADER: &str = "FromAlert";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/query", post(query_data))
        .route("/api/tail/{request_id}/{ref_id}", get(tail))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
}

#[derive(Debug, Deserialize)]
struct QueryDataRequest {
    #[serde(default)]
    queries: Vec<Query>,
}

#[derive(Debug, Serialize)]
struct QueryDataResponse {
    results: BTreeMap<String, DataResponse>,
}

#[derive(Debug, Deserialize)]
struct TailParams {
    query: String,
}

async fn query_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryDataRequest>,
) -> Result<Json<QueryDataResponse>, AppError> {
    let for_alerting = alerting_flag(&headers)?;
    debug!(
        "query request received: queries={} for_alerting={}",
        request.queries.len(),
        for_alerting
    );
    let queries = request
        .queries
        .into_iter()
        .map(|mut query| {
            query.for_alerting = for_alerting;
            query
        })
        .collect();
    let results = state.datasource().query_data(queries).await?;
    Ok(Json(QueryDataResponse { results }))
}

fn alerting_flag(headers: &HeaderMap) -> Result<bool, AppError> {
    let value = headers
        .get(FROM_ALERT_HEADER)
        .map(|value| {
            value.to_str().map_err(|err| {
                AppError::Translation(format!("failed to read {FROM_ALERT_HEADER} header: {err}"))
            })
        })
        .transpose()?;
    parse_alerting_header(value)
}

async fn tail(
    State(state): State<AppState>,
    Path((request_id, ref_id)): Path<(String, String)>,
    QueryParams(params): QueryParams<TailParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let mut query: Query = serde_json::from_str(&params.query)
        .map_err(|err| AppError::Translation(format!("failed to parse tail query: {err}")))?;
    query.kind = QueryKind::Tail;
    if query.ref_id.is_empty() {
        query.ref_id = ref_id.clone();
    }
    state.datasource().translate(&query)?;
    let path = format!("{request_id}/{ref_id}");
    Ok(ws.on_upgrade(move |socket| async move {
        stream_tail(socket, state, path, query).await;
    }))
}

async fn stream_tail(socket: WebSocket, state: AppState, path: String, query: Query) {
    let (sink, incoming) = socket.split();
    let datasource = state.datasource();
    let sender = datasource.subscribe(&path);
    let dispatcher = match datasource.run_stream(&path, WebSocketSink { sink }) {
        Ok(handle) => handle,
        Err(err) => {
            // The path belongs to another connection.
            warn!("tail stream {path} not started: {err}");
            return;
        }
    };
    let owner = sender.clone();
    info!("tail stream {path} started");

    tokio::select! {
        result = datasource.run_tail(query, sender) => {
            if let Err(err) = result {
                warn!("tail stream {path} closed: {err}");
            }
        }
        _ = wait_for_close(incoming) => debug!("tail client for {path} disconnected"),
    }

    datasource.release(&owner);
    if let Err(err) = dispatcher.await {
        warn!("tail dispatcher for {path} failed: {err}");
    }
    info!("tail stream {path} finished");
}

async fn wait_for_close(mut incoming: SplitStream<WebSocket>) {
    while let Some(Ok(message)) = incoming.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

/// Writes frames to the websocket as JSON text messages.
struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
}

impl WebSocketSink {
    async fn send_text(&mut self, text: String) -> Result<(), SinkError> {
        // A failed write means the client is gone.
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| SinkError::Cancelled)
    }
}

#[async_trait]
impl StreamSink for WebSocketSink {
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let payload = serde_json::to_string(frame)
            .map_err(|err| SinkError::Failed(format!("failed to encode frame: {err}")))?;
        self.send_text(payload).await
    }

    async fn send_bytes(&mut self, payload: Vec<u8>) -> Result<(), SinkError> {
        let payload = String::from_utf8(payload)
            .map_err(|err| SinkError::Failed(format!("frame data is not utf-8: {err}")))?;
        self.send_text(payload).await
    }
}

async fn log_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let response = next.run(req).await;
    info!(
        "method={} path={} status={} duration_ms={:.3}",
        method,
        uri.path(),
        response.status().as_u16(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    response
}
