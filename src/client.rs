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

use std::{error::Error as StdError, io, pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::TryStreamExt;
use log::{debug, error};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use url::Url;

use crate::{error::AppError, settings::HttpMethod, translate::QueryRequest};

const MAX_ERROR_BODY_BYTES: u64 = 1024 * 1024;

const TRANSIENT_MESSAGES: [&str; 6] = [
    "unexpected eof",
    "end of file",
    "connection closed before message completed",
    "broken pipe",
    "connection reset",
    "reset by peer",
];

pub type Body = Pin<Box<dyn AsyncBufRead + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
}

impl From<&QueryRequest> for HttpRequest {
    fn from(request: &QueryRequest) -> Self {
        Self {
            method: request.method,
            url: request.url.clone(),
        }
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Body,
}

/// Performs a single HTTP exchange.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
    transient: bool,
}

impl TransportError {
    pub fn new(message: impl Into<String>, transient: bool) -> Self {
        Self {
            message: message.into(),
            transient,
        }
    }

    /// Whether the connection dropped in a way worth one more attempt.
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        let transient = is_transient(&err);
        Self::new(err.to_string(), transient)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let transient = is_transient(&err);
        Self::new(error_chain(&err), transient)
    }
}

fn is_transient(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
            if let Some(inner) = io_err.get_ref()
                && is_transient(inner)
            {
                return true;
            }
        }
        let message = err.to_string().to_ascii_lowercase();
        if TRANSIENT_MESSAGES
            .iter()
            .any(|pattern| message.contains(pattern))
        {
            return true;
        }
        current = err.source();
    }
    false
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        message.push_str(": ");
        message.push_str(&source.to_string());
        current = source.source();
    }
    message
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Extra headers attached to every request.
    pub headers: Vec<(String, String)>,
    /// `None` disables the request timeout, as tail requests need.
    pub timeout: Option<Duration>,
}

/// [`HttpExecutor`] backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|err| AppError::Internal(format!("invalid header name {name:?}: {err}")))?;
            let value = HeaderValue::from_str(value.trim()).map_err(|err| {
                AppError::Internal(format!("invalid value for header {name}: {err}"))
            })?;
            headers.append(name, value);
        }
        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| AppError::Internal(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let response = self
            .client
            .request(method, request.url.clone())
            .send()
            .await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(HttpResponse {
            status,
            content_length,
            body: Box::pin(StreamReader::new(stream)),
        })
    }
}

/// Runs `request`, repeating it once if the first attempt hit a transient
/// connection failure.
pub async fn execute_with_retry(
    executor: &dyn HttpExecutor,
    request: &HttpRequest,
) -> Result<HttpResponse, TransportError> {
    match executor.execute(request).await {
        Err(err) if err.is_transient() => {
            debug!("retrying {} {} after: {err}", request.method, request.url);
            executor.execute(request).await
        }
        result => result,
    }
}

/// Sends `request` and checks the status. `Ok(None)` means the API answered
/// with an empty body.
pub async fn send(
    executor: &dyn HttpExecutor,
    request: &HttpRequest,
) -> Result<Option<Body>, AppError> {
    let response = execute_with_retry(executor, request).await?;
    match response.status {
        200 if response.content_length == Some(0) => Ok(None),
        200 => Ok(Some(response.body)),
        status => {
            let err = status_error(status, response.body).await;
            error!("request {} failed with status {status}: {err}", request.url);
            Err(err)
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

async fn status_error(status: u16, body: Body) -> AppError {
    let message = match status {
        422 => {
            let text = read_error_body(body).await;
            serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .and_then(|body| body.error.or(body.msg))
                .unwrap_or(text)
        }
        400 => read_error_body(body).await,
        _ => format!("failed to make http request: {status}"),
    };
    AppError::Upstream {
        status,
        message: message.trim().to_string(),
    }
}

async fn read_error_body(body: Body) -> String {
    let mut buf = Vec::new();
    if let Err(err) = body.take(MAX_ERROR_BODY_BYTES).read_to_end(&mut buf).await {
        return format!("failed to read error response: {err}");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
