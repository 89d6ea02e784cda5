use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::persistence::{CompactionPolicy, RecoveryPolicy, StoreConfig};

/// Top-level configuration settings for the application.
///
/// Includes settings for the network server, the message broker and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the address the STOMP listener binds to and the optional idle
/// read timeout applied to each connection.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub read_timeout_ms: Option<u64>,
}

/// Configuration settings for the broker and its queue stores.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub data_dir: PathBuf,
    pub fsync_interval_ms: u64,
    pub rewrite_interval_secs: u64,
    pub ack_timeout_secs: u64,
    pub compaction_ratio: f64,
    pub compaction_max_file_bytes: Option<u64>,
    pub recovery: RecoveryPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Settings where every field is optional. Missing values are filled from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub data_dir: Option<PathBuf>,
    pub fsync_interval_ms: Option<u64>,
    pub rewrite_interval_secs: Option<u64>,
    pub ack_timeout_secs: Option<u64>,
    pub compaction_ratio: Option<f64>,
    pub compaction_max_file_bytes: Option<u64>,
    pub recovery: Option<RecoveryPolicy>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 61613,
                read_timeout_ms: None,
            },
            broker: BrokerSettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            fsync_interval_ms: 0,
            rewrite_interval_secs: 300,
            ack_timeout_secs: 120,
            compaction_ratio: 0.1,
            compaction_max_file_bytes: None,
            recovery: RecoveryPolicy::Truncate,
        }
    }
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl BrokerSettings {
    /// Store parameters handed to every queue destination the broker opens.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            dir: self.data_dir.clone(),
            fsync_interval: Duration::from_millis(self.fsync_interval_ms),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            compaction: CompactionPolicy {
                active_ratio: self.compaction_ratio,
                rewrite_interval: Duration::from_secs(self.rewrite_interval_secs),
                max_file_bytes: self.compaction_max_file_bytes,
            },
            recovery: self.recovery,
        }
    }
}

impl PartialSettings {
    /// Fill every unset value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server;
        let broker = self.broker;
        let log = self.log;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                read_timeout_ms: server
                    .as_ref()
                    .and_then(|s| s.read_timeout_ms)
                    .or(default.server.read_timeout_ms),
            },
            broker: BrokerSettings {
                data_dir: broker
                    .as_ref()
                    .and_then(|b| b.data_dir.clone())
                    .unwrap_or(default.broker.data_dir),
                fsync_interval_ms: broker
                    .as_ref()
                    .and_then(|b| b.fsync_interval_ms)
                    .unwrap_or(default.broker.fsync_interval_ms),
                rewrite_interval_secs: broker
                    .as_ref()
                    .and_then(|b| b.rewrite_interval_secs)
                    .unwrap_or(default.broker.rewrite_interval_secs),
                ack_timeout_secs: broker
                    .as_ref()
                    .and_then(|b| b.ack_timeout_secs)
                    .unwrap_or(default.broker.ack_timeout_secs),
                compaction_ratio: broker
                    .as_ref()
                    .and_then(|b| b.compaction_ratio)
                    .unwrap_or(default.broker.compaction_ratio),
                compaction_max_file_bytes: broker
                    .as_ref()
                    .and_then(|b| b.compaction_max_file_bytes)
                    .or(default.broker.compaction_max_file_bytes),
                recovery: broker
                    .as_ref()
                    .and_then(|b| b.recovery)
                    .unwrap_or(default.broker.recovery),
            },
            log: LogSettings {
                level: log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }
}
