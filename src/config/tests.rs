use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::{Settings, load_config};
use crate::persistence::RecoveryPolicy;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 61613);
    assert_eq!(settings.server.read_timeout_ms, None);
    assert_eq!(settings.broker.data_dir, PathBuf::from("data"));
    assert_eq!(settings.broker.fsync_interval_ms, 0);
    assert_eq!(settings.broker.rewrite_interval_secs, 300);
    assert_eq!(settings.broker.ack_timeout_secs, 120);
    assert_eq!(settings.broker.recovery, RecoveryPolicy::Truncate);
    assert_eq!(settings.log.level, "info");
}

#[test]
fn test_store_config_conversion() {
    let mut settings = Settings::default();
    settings.broker.fsync_interval_ms = 20;
    settings.broker.compaction_max_file_bytes = Some(4096);

    let store = settings.broker.store_config();
    assert_eq!(store.fsync_interval, Duration::from_millis(20));
    assert_eq!(store.ack_timeout, Duration::from_secs(120));
    assert_eq!(store.compaction.rewrite_interval, Duration::from_secs(300));
    assert_eq!(store.compaction.max_file_bytes, Some(4096));
    assert!((store.compaction.active_ratio - 0.1).abs() < f64::EPSILON);
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // load_config reads config/default.toml relative to the working directory.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [broker]
        data_dir = "/var/lib/popmq"
        fsync_interval_ms = 20
        recovery = "fail"

        [log]
        level = "debug"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");
    let cfg = cfg.expect("load_config failed");

    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.broker.data_dir, PathBuf::from("/var/lib/popmq"));
    assert_eq!(cfg.broker.fsync_interval_ms, 20);
    assert_eq!(cfg.broker.recovery, RecoveryPolicy::Fail);
    assert_eq!(cfg.broker.ack_timeout_secs, 120);
    assert_eq!(cfg.log.level, "debug");
}

#[test]
#[serial]
fn load_config_from_environment() {
    temp_env::with_vars(
        [
            ("POPMQ_SERVER__PORT", Some("7000")),
            ("POPMQ_BROKER__ACK_TIMEOUT_SECS", Some("5")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.port, 7000);
            assert_eq!(cfg.broker.ack_timeout_secs, 5);
            assert_eq!(cfg.server.host, "127.0.0.1");
        },
    );
}

#[test]
fn test_server_address_and_timeout() {
    let mut settings = Settings::default();
    assert_eq!(settings.server.addr(), "127.0.0.1:61613");
    assert_eq!(settings.server.read_timeout(), None);

    settings.server.read_timeout_ms = Some(0);
    assert_eq!(settings.server.read_timeout(), None);

    settings.server.read_timeout_ms = Some(250);
    assert_eq!(
        settings.server.read_timeout(),
        Some(Duration::from_millis(250))
    );
}
