//! Configuration for devlinkd

use clap::Parser;
use devlink_net::ConnectionManagerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// devlinkd - devlink peer connection daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "devlinkd")]
#[command(about = "Peer-to-peer connection manager and channel multiplexer")]
pub struct Config {
    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/devlinkd", env = "DEVLINK_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Seconds to wait for a signaling answer
    #[arg(long, default_value = "30")]
    pub answer_timeout_secs: u64,

    /// Milliseconds to wait for a beacon response after a network change
    #[arg(long, default_value = "3000")]
    pub beacon_timeout_ms: u64,

    /// Interval between status dumps, 0 disables them
    #[arg(long, default_value = "60")]
    pub monitor_interval_secs: u64,

    /// Bytes echoed through the loopback self-test channel
    #[arg(long, default_value = "65536")]
    pub selftest_bytes: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.answer_timeout_secs == 0 {
            anyhow::bail!("Answer timeout must be at least one second");
        }
        if self.beacon_timeout_ms == 0 {
            anyhow::bail!("Beacon timeout cannot be zero");
        }
        if self.selftest_bytes == 0 {
            anyhow::bail!("Self-test needs at least one byte");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {:?} (expected json or pretty)", self.log_format);
        }
        Ok(())
    }

    /// Manager settings derived from the command line
    pub fn manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::default()
            .with_answer_timeout(Duration::from_secs(self.answer_timeout_secs))
            .with_beacon_timeout(Duration::from_millis(self.beacon_timeout_ms))
    }

    /// Default log filter when `RUST_LOG` is unset
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "devlinkd=debug,devlink_net=debug"
        } else {
            "devlinkd=info,devlink_net=info"
        }
    }
}

/// Persisted node state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Account keypair seed
    pub account_seed: [u8; 32],
    /// Device keypair seed
    pub device_seed: [u8; 32],
}
