//! Argument parsing for `brokerctl`

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::Value;

use crate::error::Error;

/// Operator CLI for the brokerage API access layer.
#[derive(Parser, Debug)]
#[command(name = "brokerctl", version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML config file (falls back to BROKERCTL_CONFIG, then brokerctl.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Recorded browser session snapshot to capture credentials from
    #[arg(long, global = true)]
    pub session: Option<PathBuf>,

    /// Render Prometheus metrics to stderr after the command finishes
    #[arg(long, global = true)]
    pub print_metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Print (redacted) credential headers, capturing if needed
    Headers,
    /// Describe the durable credential cache
    CacheInfo,
    /// Delete cached credentials
    ClearCache,
    /// Send one API request and print the JSON response
    Request(RequestArgs),
}

#[derive(Args, Debug, PartialEq)]
pub struct RequestArgs {
    /// HTTP method (GET, POST, PUT, DELETE)
    pub method: String,

    /// Absolute API URL
    pub url: String,

    /// JSON request body
    #[arg(long, value_parser = parse_body)]
    pub body: Option<Value>,

    /// Extra header as NAME:VALUE; repeatable, overrides credential headers
    #[arg(long = "header", value_name = "NAME:VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Retry budget for this call instead of the configured one
    #[arg(long)]
    pub retries: Option<u32>,

    /// Skip the rate gate
    #[arg(long = "no-rate-limit", action = ArgAction::SetFalse)]
    pub rate_limited: bool,
}

impl RequestArgs {
    /// Extra headers keyed by name; a later `--header` with the same name wins.
    pub fn extra_headers(&self) -> BTreeMap<String, String> {
        self.headers.iter().cloned().collect()
    }
}

fn parse_body(raw: &str) -> Result<Value, Error> {
    serde_json::from_str(raw).map_err(|e| Error::InvalidBody(e.to_string()))
}

fn parse_header(raw: &str) -> Result<(String, String), Error> {
    raw.split_once(':')
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| Error::InvalidHeader(raw.to_string()))
}
