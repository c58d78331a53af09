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

use std::{net::SocketAddr, sync::Arc, time::Duration};

use app::{AppState, router};
use clap::Parser;
use log::{LevelFilter, info, warn};
use victorialogs_datasource::{
    AppError, Datasource,
    client::{ExecutorConfig, ReqwestExecutor},
    decode::{DEFAULT_MAX_LINE_BYTES, DecoderConfig},
    settings::{DEFAULT_API_PREFIX, DatasourceSettings, HttpMethod},
};

mod app;

#[derive(Debug, Parser)]
#[command(author, version, about, disable_help_subcommand = true)]
struct Args {
    /// VictoriaLogs base URL, e.g. http://localhost:9428
    #[arg(long = "url", env = "LOGS_URL")]
    url: String,
    /// HTTP bind address for the adapter server
    #[arg(long = "bind", env = "BIND_ADDR", default_value = "0.0.0.0:3200")]
    bind: SocketAddr,
    /// HTTP method used for upstream requests (GET or POST)
    #[arg(long = "http-method", env = "HTTP_METHOD", default_value = "GET")]
    http_method: HttpMethod,
    /// Raw query string added to every upstream request, e.g. AccountID=1&ProjectID=2
    #[arg(long = "custom-query-params", env = "CUSTOM_QUERY_PARAMS", default_value = "")]
    custom_query_params: String,
    /// Extra upstream header as "Name: value"; may be repeated
    #[arg(long = "header", env = "CUSTOM_HEADERS", value_delimiter = ',')]
    headers: Vec<String>,
    /// Lower bound for the computed step, e.g. 30s
    #[arg(long = "min-interval", env = "MIN_INTERVAL", default_value = "")]
    min_interval: String,
    /// Timeout in seconds for non-tail upstream requests
    #[arg(long = "query-timeout", env = "QUERY_TIMEOUT_SECS", default_value_t = 60)]
    query_timeout: u64,
    /// Log lines longer than this are skipped
    #[arg(long = "max-line-bytes", env = "MAX_LINE_BYTES", default_value_t = DEFAULT_MAX_LINE_BYTES)]
    max_line_bytes: usize,
    /// Path prefix of the LogsQL API on the upstream
    #[arg(long = "api-prefix", env = "API_PREFIX", default_value = DEFAULT_API_PREFIX)]
    api_prefix: String,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();
    let args = Args::parse();
    info!(
        "starting victorialogs-datasource (url={}, method={}, bind={})",
        args.url, args.http_method, args.bind
    );

    let headers = args
        .headers
        .iter()
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| parse_header(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let query_executor = ReqwestExecutor::new(&ExecutorConfig {
        headers: headers.clone(),
        timeout: Some(Duration::from_secs(args.query_timeout)),
    })?;
    let tail_executor = ReqwestExecutor::new(&ExecutorConfig {
        headers,
        timeout: None,
    })?;

    let settings = DatasourceSettings {
        url: args.url,
        http_method: args.http_method,
        custom_query_params: args.custom_query_params,
        min_interval: args.min_interval,
        api_prefix: args.api_prefix,
    };
    let datasource = Datasource::new(settings, Arc::new(query_executor), Arc::new(tail_executor))
        .with_decoder(DecoderConfig {
            max_line_bytes: args.max_line_bytes,
            ..DecoderConfig::default()
        });
    let state = AppState::new(datasource);
    let app = router(state.clone());

    info!("binding TCP listener on {}", args.bind);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind listener: {err}")))?;
    info!("victorialogs-datasource listening on {}", args.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;
    state.datasource().dispose();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Splits a `Name: value` header argument.
fn parse_header(raw: &str) -> Result<(String, String), AppError> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| AppError::Internal(format!("invalid header {raw:?}, expected Name: value")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Internal(format!("invalid header {raw:?}, name is empty")));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn init_logging() {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::Builder::from_default_env().init();
    } else {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Warn)
            .filter_module("victorialogs_datasource", LevelFilter::Info)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_arguments() {
        assert_eq!(
            parse_header("Authorization: Bearer a:b").unwrap(),
            ("Authorization".to_string(), "Bearer a:b".to_string())
        );
        assert!(parse_header("missing-separator").is_err());
        assert!(parse_header(": value").is_err());
    }
}
