//! CLI configuration for `rss-server`.
//!
//! Usage:
//!   rss-server [--bind 0.0.0.0:19190] [--low-memory-percentage 95] [--max-inflight-uploads 512]

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

// ---

use rss_domain::{DEFAULT_CLUSTER, DEFAULT_DATA_CENTER};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Parser)]
#[command(name = "rss-server", about = "Remote shuffle service upload server")]
pub struct Config {
    // ---
    /// TCP address to accept upload and commit connections on.
    #[arg(long, default_value = "0.0.0.0:19190")]
    pub bind: SocketAddr,

    /// Identity reported to clients.  A random UUID when omitted.
    #[arg(long)]
    pub server_id: Option<String>,

    #[arg(long, default_value = DEFAULT_DATA_CENTER)]
    pub data_center: String,

    #[arg(long, default_value = DEFAULT_CLUSTER)]
    pub cluster: String,

    /// Heap occupancy (percent of the memory ceiling) above which a major
    /// reclamation checkpoint raises the low-memory signal.
    #[arg(long, default_value_t = 95)]
    pub low_memory_percentage: u64,

    /// Memory ceiling in bytes that occupancy is measured against.
    /// `0` uses total system memory.
    #[arg(long, default_value_t = 0)]
    pub memory_ceiling_bytes: u64,

    /// Interval between reclamation checkpoints.
    #[arg(long, default_value_t = 1000)]
    pub sample_interval_ms: u64,

    /// Every Nth checkpoint is a major one.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub major_every: u32,

    /// How long new uploads are refused after a low-memory signal.
    #[arg(long, default_value_t = 5000)]
    pub pressure_hold_ms: u64,

    /// Cap on attempts between start-upload and finish-upload.  `0` disables
    /// the cap.
    #[arg(long, default_value_t = 0)]
    pub max_inflight_uploads: usize,

    /// Applications idle this long are torn down.
    #[arg(long, default_value_t = 3600)]
    pub app_retention_secs: u64,

    /// How often idle applications are looked for.
    #[arg(long, default_value_t = 60)]
    pub cleanup_interval_secs: u64,

    /// Bound on writing a reply to a client.
    #[arg(long, default_value_t = 30_000)]
    pub network_timeout_ms: u64,
}

// ---

impl Config {
    // ---
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn pressure_hold(&self) -> Duration {
        Duration::from_millis(self.pressure_hold_ms)
    }

    pub fn app_retention(&self) -> Duration {
        Duration::from_secs(self.app_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::parse_from(["rss-server"]);
        assert_eq!(cfg.low_memory_percentage, 95);
        assert_eq!(cfg.memory_ceiling_bytes, 0);
        assert_eq!(cfg.max_inflight_uploads, 0);
        assert_eq!(cfg.major_every, 10);
        assert_eq!(cfg.data_center, "dc1");
        assert_eq!(cfg.network_timeout(), Duration::from_secs(30));
        assert!(cfg.server_id.is_none());
    }

    #[test]
    fn zero_major_cadence_is_rejected() {
        assert!(Config::try_parse_from(["rss-server", "--major-every", "0"]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = Config::parse_from([
            "rss-server",
            "--bind",
            "127.0.0.1:0",
            "--low-memory-percentage",
            "80",
            "--pressure-hold-ms",
            "250",
        ]);
        assert_eq!(cfg.bind.port(), 0);
        assert_eq!(cfg.low_memory_percentage, 80);
        assert_eq!(cfg.pressure_hold(), Duration::from_millis(250));
    }
}
