//! Node configuration.
//!
//! Every knob has a default; [`Config::from_env`] overlays the
//! environment keys the deployment surface documents.  Unparseable
//! values fall back to the default with a `warn` rather than failing
//! startup.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Runtime configuration for one node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for all persisted state.
    pub data_path: PathBuf,

    /// Node-to-node port (used by the network collaborator).
    pub port: u16,

    /// Peer discovery scan interval.
    pub ping_interval: Duration,

    /// Connect/read timeout for peer calls.
    pub network_timeout: Duration,

    /// A node unseen for this long is dropped from the roster.
    pub node_timeout: Duration,

    /// Sleep between persistence checkpoints.
    pub persist_interval: Duration,

    /// Active memtable size threshold.
    pub mem_table_max_bytes: usize,

    /// Max rotated memtables awaiting flush.
    pub max_immutable_mem_tables: usize,

    /// Checkpoint even with zero reachable peers.
    pub allow_offline_persist: bool,

    /// Level-0 SSTable count that triggers compaction.
    pub l0_compaction_trigger: usize,

    /// Per-level size ratio for leveled compaction.
    pub level_size_ratio: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
            port: 1985,
            ping_interval: Duration::from_millis(5_000),
            network_timeout: Duration::from_millis(2_500),
            node_timeout: Duration::from_millis(15_000),
            persist_interval: Duration::from_millis(60_000),
            mem_table_max_bytes: 4 * 1024 * 1024,
            max_immutable_mem_tables: 4,
            allow_offline_persist: false,
            l0_compaction_trigger: 10,
            level_size_ratio: 10,
        }
    }
}

impl Config {
    /// Defaults overlaid with the documented environment keys.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_path: env::var("data_path")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_path),
            port: parse_or("port", defaults.port),
            ping_interval: millis_or("ping_interval_ms", defaults.ping_interval),
            network_timeout: millis_or("network_timeout_ms", defaults.network_timeout),
            node_timeout: millis_or("node_timeout_ms", defaults.node_timeout),
            persist_interval: millis_or("persist_interval_ms", defaults.persist_interval),
            mem_table_max_bytes: parse_or("mem_table_max_bytes", defaults.mem_table_max_bytes),
            max_immutable_mem_tables: parse_or(
                "max_immutable_mem_tables",
                defaults.max_immutable_mem_tables,
            ),
            allow_offline_persist: parse_or(
                "allow_offline_persist",
                defaults.allow_offline_persist,
            ),
            l0_compaction_trigger: parse_or(
                "l0_compaction_trigger",
                defaults.l0_compaction_trigger,
            ),
            level_size_ratio: parse_or("level_size_ratio", defaults.level_size_ratio),
        }
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, %raw, "unparseable configuration value; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn millis_or(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!(key, %raw, "unparseable configuration value; using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 1985);
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.network_timeout, Duration::from_millis(2_500));
        assert_eq!(config.node_timeout, Duration::from_secs(15));
        assert_eq!(config.persist_interval, Duration::from_secs(60));
        assert_eq!(config.l0_compaction_trigger, 10);
        assert!(!config.allow_offline_persist);
    }
}
