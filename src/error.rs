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

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::client::TransportError;

#[derive(Debug, Error)]
pub enum AppError {
    /// The query could not be turned into a request; nothing was sent.
    #[error("{0}")]
    Translation(String),
    #[error("failed to make http request: {0}")]
    Transport(#[from] TransportError),
    #[error("{message}")]
    Upstream { status: u16, message: String },
    #[error("{0}")]
    Decode(String),
    #[error("{0}")]
    Internal(String),
}

/// Coarse classification attached to a failed query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStatus {
    BadRequest,
    BadGateway,
    Internal,
}

impl DataStatus {
    pub fn status_code(self) -> StatusCode {
        match self {
            DataStatus::BadRequest => StatusCode::BAD_REQUEST,
            DataStatus::BadGateway => StatusCode::BAD_GATEWAY,
            DataStatus::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl AppError {
    pub fn status(&self) -> DataStatus {
        match self {
            Self::Translation(_) => DataStatus::BadRequest,
            Self::Upstream { status, .. } if matches!(status, 400 | 422) => DataStatus::BadRequest,
            Self::Upstream { .. } | Self::Transport(_) => DataStatus::BadGateway,
            Self::Decode(_) | Self::Internal(_) => DataStatus::Internal,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Translation(_) => "bad_data",
            Self::Upstream { .. } | Self::Transport(_) => "upstream_error",
            Self::Decode(_) => "decode_error",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status().status_code();
        let body = ErrorResponse {
            status: "error",
            error_type: self.error_type(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    status: &'a str,
    #[serde(rename = "errorType")]
    error_type: &'a str,
    error: String,
}
