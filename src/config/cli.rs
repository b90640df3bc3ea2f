use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the rcache binary.
#[derive(Debug, Parser)]
#[command(name = "rcache", version, about = "Reactive request cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a scripted scenario against an in-memory fetcher and log every
    /// cache transition.
    Demo(DemoArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DemoArgs {
    #[command(flatten)]
    pub overrides: DemoOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DemoOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override how long an unwatched entry stays cached.
    #[arg(long = "cache-timeout-ms", value_name = "MILLIS")]
    pub cache_timeout_ms: Option<u64>,

    /// Override the simulated latency of the demo fetcher.
    #[arg(long = "fetch-latency-ms", value_name = "MILLIS")]
    pub fetch_latency_ms: Option<u64>,
}
