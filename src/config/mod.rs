//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{CliArgs, Command, DemoArgs, DemoOverrides};

use crate::cache::DEFAULT_CACHE_TIMEOUT_MS;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "rcache";
const ENV_PREFIX: &str = "RCACHE";
const DEFAULT_FETCH_LATENCY_MS: u64 = 50;
const MAX_FETCH_LATENCY_MS: u64 = 60_000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
    pub demo: DemoSettings,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Zero evicts on the next timer tick.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DemoSettings {
    pub fetch_latency: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Demo(args)) => raw.apply_demo_overrides(&args.overrides),
        None => raw.apply_demo_overrides(&DemoOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
    demo: RawDemoSettings,
}

impl RawSettings {
    fn apply_demo_overrides(&mut self, overrides: &DemoOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(timeout) = overrides.cache_timeout_ms {
            self.cache.timeout_ms = Some(timeout);
        }
        if let Some(latency) = overrides.fetch_latency_ms {
            self.demo.fetch_latency_ms = Some(latency);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            logging,
            demo,
        } = raw;

        let cache = build_cache_settings(cache);
        let logging = build_logging_settings(logging)?;
        let demo = build_demo_settings(demo)?;

        Ok(Self {
            cache,
            logging,
            demo,
        })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> CacheSettings {
    let timeout_ms = cache.timeout_ms.unwrap_or(DEFAULT_CACHE_TIMEOUT_MS);
    CacheSettings {
        timeout: Duration::from_millis(timeout_ms),
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_demo_settings(demo: RawDemoSettings) -> Result<DemoSettings, LoadError> {
    let latency_ms = demo.fetch_latency_ms.unwrap_or(DEFAULT_FETCH_LATENCY_MS);
    if latency_ms > MAX_FETCH_LATENCY_MS {
        return Err(LoadError::invalid(
            "demo.fetch_latency_ms",
            format!("must not exceed {MAX_FETCH_LATENCY_MS}"),
        ));
    }

    Ok(DemoSettings {
        fetch_latency: Duration::from_millis(latency_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDemoSettings {
    fetch_latency_ms: Option<u64>,
}

#[cfg(test)]
mod tests;
