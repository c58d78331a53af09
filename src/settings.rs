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

use std::{fmt, str::FromStr};

pub const DEFAULT_API_PREFIX: &str = "/select/logsql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "" | "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            other => Err(format!("unsupported http method {other:?}, expected GET or POST")),
        }
    }
}

/// Per-datasource settings shared by every query.
#[derive(Debug, Clone)]
pub struct DatasourceSettings {
    pub url: String,
    pub http_method: HttpMethod,
    /// Raw query string merged into every request, e.g. `AccountID=1&ProjectID=2`.
    pub custom_query_params: String,
    pub min_interval: String,
    pub api_prefix: String,
}

impl DatasourceSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http_method: HttpMethod::Get,
            custom_query_params: String::new(),
            min_interval: String::new(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
        }
    }
}
