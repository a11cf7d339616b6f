use std::time::Duration;

use ctx_dispatch::Error;
use ctx_dispatch::config::{Config, DispatcherConfig, QueueMode};

const VARS: [&str; 4] = [
    "DISPATCH_MODE",
    "DISPATCH_SHARDS",
    "DISPATCH_QUEUE_CAPACITY",
    "DISPATCH_ENQUEUE_TIMEOUT_MS",
];

fn clear_env() {
    unsafe {
        for var in VARS {
            std::env::remove_var(var);
        }
    }
}

// Environment variables are process-wide, so every env scenario lives in
// this one test.
#[test]
fn config_from_env() {
    clear_env();
    let config = Config::from_env().unwrap();
    assert_eq!(config.dispatcher, DispatcherConfig::default());
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::set_var("DISPATCH_MODE", "sharded");
        std::env::set_var("DISPATCH_SHARDS", "16");
        std::env::set_var("DISPATCH_QUEUE_CAPACITY", "32");
        std::env::set_var("DISPATCH_ENQUEUE_TIMEOUT_MS", "250");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.dispatcher.mode, QueueMode::Sharded);
    assert_eq!(config.dispatcher.shards, 16);
    assert_eq!(config.dispatcher.queue_capacity, 32);
    assert_eq!(
        config.dispatcher.enqueue_timeout(),
        Some(Duration::from_millis(250))
    );

    unsafe {
        std::env::set_var("DISPATCH_SHARDS", "lots");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("DISPATCH_SHARDS", "0");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("DISPATCH_SHARDS", "4");
        std::env::set_var("DISPATCH_MODE", "round-robin");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    clear_env();
}

#[test]
fn config_from_toml() {
    let config = Config::from_toml_str(
        r#"
        log_level = "debug"

        [dispatcher]
        mode = "per-key"
        queue_capacity = 8
        "#,
    )
    .unwrap();
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.dispatcher.mode, QueueMode::PerKey);
    assert_eq!(config.dispatcher.queue_capacity, 8);
    assert_eq!(config.dispatcher.shards, DispatcherConfig::default().shards);
    assert_eq!(config.dispatcher.enqueue_timeout(), None);
    assert_eq!(config.otel_endpoint, None);
}

#[test]
fn config_from_toml_rejects_unknown_mode() {
    let result = Config::from_toml_str("[dispatcher]\nmode = \"fifo\"\n");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn config_from_toml_rejects_zero_shards() {
    let result = Config::from_toml_str("[dispatcher]\nmode = \"sharded\"\nshards = 0\n");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn queue_mode_parses_loosely() {
    assert_eq!("Per_Key".parse::<QueueMode>().unwrap(), QueueMode::PerKey);
    assert_eq!(" sharded ".parse::<QueueMode>().unwrap(), QueueMode::Sharded);
    assert!("lanes".parse::<QueueMode>().is_err());
}

#[test]
fn load_file_reports_missing_path() {
    let result = Config::load_file(std::path::Path::new("/nonexistent/ctx-dispatch.toml"));
    assert!(matches!(result, Err(Error::Config(_))));
}
