//! brokerctl
//!
//! Operator CLI for the brokerage API access layer:
//! 1. Loads configuration and the recorded browser session
//! 2. Wires the credential store, acquirer, rate gate, and executor together
//! 3. Runs one command and prints its result as JSON on stdout
//!
//! Logs go to stderr as JSON so stdout stays machine-readable.

mod cli;
mod config;
mod error;
mod metrics;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use broker_api::{ApiError, RateGate, RequestExecutor, RequestOptions};
use broker_auth::{CredentialAcquirer, CredentialStore};
use clap::Parser;
use common::redact_headers;
use serde_json::{Value, json};
use session::{BrowserSession, RecordedSession};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command, RequestArgs};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    // Install before any metrics are emitted
    let prometheus = if cli.print_metrics {
        Some(metrics::install_recorder().context("failed to install metrics recorder")?)
    } else {
        None
    };

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        config = %config_path.display(),
        cache = %config.cache.path.display(),
        api_host = %config.api.host,
        "configuration loaded"
    );

    let store = Arc::new(CredentialStore::new(
        config.cache.path.clone(),
        config.cache_policy(),
    ));

    let code = match cli.command {
        Command::CacheInfo => {
            print_json(&serde_json::to_value(store.info().await)?);
            ExitCode::SUCCESS
        }
        Command::ClearCache => {
            store.clear().await;
            print_json(&json!({ "cleared": true }));
            ExitCode::SUCCESS
        }
        Command::Headers => {
            let executor = build_executor(&config, store, cli.session.as_deref()).await?;
            let outcome = executor.auth_headers().await;
            executor.gate().clear();
            match outcome {
                Ok(headers) => {
                    print_json(&serde_json::to_value(redact_headers(&headers))?);
                    ExitCode::SUCCESS
                }
                Err(e) => report(&e),
            }
        }
        Command::Request(args) => {
            let executor = build_executor(&config, store, cli.session.as_deref()).await?;
            let outcome = send(&executor, args).await;
            executor.gate().clear();
            match outcome {
                Ok(value) => {
                    print_json(&value);
                    ExitCode::SUCCESS
                }
                Err(e) => report(&e),
            }
        }
    };

    if let Some(handle) = prometheus {
        eprintln!("{}", handle.render());
    }
    Ok(code)
}

async fn build_executor(
    config: &Config,
    store: Arc<CredentialStore>,
    session_path: Option<&Path>,
) -> Result<RequestExecutor> {
    let session: Arc<dyn BrowserSession> = match session_path {
        Some(path) => Arc::new(
            RecordedSession::load(path)
                .await
                .with_context(|| format!("failed to load session snapshot {}", path.display()))?,
        ),
        None => Arc::new(RecordedSession::new("empty")),
    };

    let client = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("failed to build HTTP client")?;

    Ok(RequestExecutor::new(
        client,
        Arc::new(RateGate::new(
            config.rate_limit.max_requests_per_second,
            config.admission_timeout(),
        )),
        store,
        Arc::new(CredentialAcquirer::new(session, config.acquisition_policy())),
        config.retry_policy(),
    ))
}

async fn send(executor: &RequestExecutor, args: RequestArgs) -> Result<Value, ApiError> {
    let options = RequestOptions {
        extra_headers: args.extra_headers(),
        max_retries: args.retries,
        rate_limited: args.rate_limited,
    };
    executor
        .request(&args.method, &args.url, args.body.as_ref(), &options)
        .await
}

fn report(err: &ApiError) -> ExitCode {
    print_json(&json!({
        "error": {
            "kind": err.kind.label(),
            "message": err.message,
            "status_code": err.status_code,
            "code": err.code(),
            "domain_errors": err.domain_errors,
            "attempts": err.attempts,
        }
    }));
    ExitCode::FAILURE
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{value}"),
    }
}
