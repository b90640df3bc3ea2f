use std::io::Write as _;

use serial_test::serial;

use super::*;
use crate::cache::CacheConfig;

#[test]
fn defaults_apply_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.cache.timeout, Duration::from_millis(200));
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(
        settings.demo.fetch_latency,
        Duration::from_millis(DEFAULT_FETCH_LATENCY_MS)
    );
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.timeout_ms = Some(1_000);
    raw.logging.level = Some("info".to_string());

    let overrides = DemoOverrides {
        cache_timeout_ms: Some(25),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_demo_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.timeout, Duration::from_millis(25));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn zero_timeout_is_accepted() {
    let mut raw = RawSettings::default();
    raw.cache.timeout_ms = Some(0);

    let settings = Settings::from_raw(raw).expect("valid settings");
    let config = CacheConfig::from(&settings.cache);

    assert_eq!(config.cache_timeout, Duration::ZERO);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = DemoOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_demo_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn unparsable_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn excessive_fetch_latency_is_rejected() {
    let mut raw = RawSettings::default();
    raw.demo.fetch_latency_ms = Some(MAX_FETCH_LATENCY_MS + 1);

    let err = Settings::from_raw(raw).expect_err("latency too high");
    assert!(err.to_string().contains("demo.fetch_latency_ms"));
}

#[test]
fn default_command_is_absent() {
    let args = CliArgs::parse_from(["rcache"]);
    assert!(args.command.is_none());
    assert!(args.config_file.is_none());
}

#[test]
fn parse_demo_arguments() {
    let args = CliArgs::parse_from([
        "rcache",
        "demo",
        "--log-level",
        "trace",
        "--log-json",
        "yes",
        "--cache-timeout-ms",
        "500",
    ]);

    match args.command.expect("demo command") {
        Command::Demo(demo) => {
            assert_eq!(demo.overrides.log_level.as_deref(), Some("trace"));
            assert_eq!(demo.overrides.log_json, Some(true));
            assert_eq!(demo.overrides.cache_timeout_ms, Some(500));
            assert_eq!(demo.overrides.fetch_latency_ms, None);
        }
    }
}

#[test]
#[serial]
fn config_file_and_environment_are_layered() {
    let dir = std::env::temp_dir().join(format!("rcache-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("layered.toml");
    let mut file = std::fs::File::create(&path).expect("config file");
    writeln!(file, "[cache]\ntimeout_ms = 750\n\n[logging]\nlevel = \"warn\"")
        .expect("write config");

    // SAFETY: serialised with every other test that touches the environment.
    unsafe { std::env::set_var("RCACHE__LOGGING__LEVEL", "error") };
    let args = CliArgs::parse_from([
        "rcache",
        "--config-file",
        path.to_str().expect("utf-8 path"),
    ]);
    let loaded = load(&args);
    unsafe { std::env::remove_var("RCACHE__LOGGING__LEVEL") };
    std::fs::remove_dir_all(&dir).ok();

    let settings = loaded.expect("valid settings");
    assert_eq!(settings.cache.timeout, Duration::from_millis(750));
    assert_eq!(settings.logging.level, LevelFilter::ERROR);
}

#[test]
#[serial]
fn missing_explicit_config_file_is_an_error() {
    let args = CliArgs::parse_from(["rcache", "--config-file", "/nonexistent/rcache.toml"]);
    assert!(matches!(load(&args), Err(LoadError::Build(_))));
}
