/**
 * Configuration constants and tunables for the sync engine
 */
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Quiet window for the change coalescer in milliseconds
pub const DEFAULT_COALESCE_WINDOW_MS: u64 = 250;

/// Interval between republishes in polling mode
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;

/// TTL for aggregated Helm release listings
pub const DEFAULT_HELM_CACHE_TTL_SECONDS: u64 = 30;

/// Interval of the result cache sweep
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 300;

/// How long a request waits for a fresh mirror to finish its initial list
pub const DEFAULT_MIRROR_READY_TIMEOUT_SECONDS: u64 = 10;

/// How long an unused mirror keeps watching before it is stopped
pub const DEFAULT_MIRROR_IDLE_GRACE_SECONDS: u64 = 300;

/// Outbound frame queue per subscriber
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// Consecutive watch errors tolerated before a mirror gives up
pub const MAX_WATCH_RESTARTS: u32 = 50;

/// Maximum backoff time in seconds between watch retries
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Initial backoff time in seconds
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Runtime tunables shared by every engine component
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub coalesce_window: Duration,
    pub poll_interval: Duration,
    pub helm_cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub mirror_ready_timeout: Duration,
    pub mirror_idle_grace: Duration,
    pub subscriber_capacity: usize,
    /// Hard cap on a single subscription; `None` keeps streams open until
    /// the client goes away
    pub max_stream_lifetime: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(DEFAULT_COALESCE_WINDOW_MS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS),
            helm_cache_ttl: Duration::from_secs(DEFAULT_HELM_CACHE_TTL_SECONDS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
            mirror_ready_timeout: Duration::from_secs(DEFAULT_MIRROR_READY_TIMEOUT_SECONDS),
            mirror_idle_grace: Duration::from_secs(DEFAULT_MIRROR_IDLE_GRACE_SECONDS),
            subscriber_capacity: SUBSCRIBER_CHANNEL_CAPACITY,
            max_stream_lifetime: None,
        }
    }
}

/// Command line / environment configuration of the server binary
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "KUBEPULSE_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Directory holding one kubeconfig per tenant configuration (`<id>.yaml`)
    #[arg(long, env = "KUBEPULSE_CONFIG_DIR", default_value = "./configs")]
    pub config_dir: PathBuf,

    /// Coalescing window for change notifications
    #[arg(long, env = "KUBEPULSE_COALESCE_WINDOW_MS", default_value_t = DEFAULT_COALESCE_WINDOW_MS)]
    pub coalesce_window_ms: u64,

    /// Republish interval for polled sources
    #[arg(long, env = "KUBEPULSE_POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL_SECONDS)]
    pub poll_interval_secs: u64,

    /// TTL for cached Helm release listings
    #[arg(long, env = "KUBEPULSE_HELM_CACHE_TTL_SECS", default_value_t = DEFAULT_HELM_CACHE_TTL_SECONDS)]
    pub helm_cache_ttl_secs: u64,

    /// Interval of the result cache sweep
    #[arg(long, env = "KUBEPULSE_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECONDS)]
    pub sweep_interval_secs: u64,

    /// Wait for a new mirror's initial list before answering
    #[arg(long, env = "KUBEPULSE_MIRROR_READY_TIMEOUT_SECS", default_value_t = DEFAULT_MIRROR_READY_TIMEOUT_SECONDS)]
    pub mirror_ready_timeout_secs: u64,

    /// Stop mirrors nobody used for this long
    #[arg(long, env = "KUBEPULSE_MIRROR_IDLE_GRACE_SECS", default_value_t = DEFAULT_MIRROR_IDLE_GRACE_SECONDS)]
    pub mirror_idle_grace_secs: u64,

    /// Outbound queue capacity per subscriber
    #[arg(long, env = "KUBEPULSE_SUBSCRIBER_CAPACITY", default_value_t = SUBSCRIBER_CHANNEL_CAPACITY)]
    pub subscriber_capacity: usize,

    /// Close streams after this many seconds (unset = unlimited)
    #[arg(long, env = "KUBEPULSE_MAX_STREAM_LIFETIME_SECS")]
    pub max_stream_lifetime_secs: Option<u64>,
}

impl ServeArgs {
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            coalesce_window: Duration::from_millis(self.coalesce_window_ms.max(1)),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            helm_cache_ttl: Duration::from_secs(self.helm_cache_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            mirror_ready_timeout: Duration::from_secs(self.mirror_ready_timeout_secs),
            mirror_idle_grace: Duration::from_secs(self.mirror_idle_grace_secs),
            subscriber_capacity: self.subscriber_capacity.max(1),
            max_stream_lifetime: self.max_stream_lifetime_secs.map(Duration::from_secs),
        }
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_COALESCE_WINDOW_MS > 0, "DEFAULT_COALESCE_WINDOW_MS must be greater than 0");
    assert!(DEFAULT_POLL_INTERVAL_SECONDS > 0, "DEFAULT_POLL_INTERVAL_SECONDS must be greater than 0");
    assert!(DEFAULT_SWEEP_INTERVAL_SECONDS > 0, "DEFAULT_SWEEP_INTERVAL_SECONDS must be greater than 0");
    assert!(SUBSCRIBER_CHANNEL_CAPACITY > 0, "SUBSCRIBER_CHANNEL_CAPACITY must be greater than 0");
    assert!(MAX_WATCH_RESTARTS > 0, "MAX_WATCH_RESTARTS must be greater than 0");
    assert!(MAX_BACKOFF_SECONDS > 0, "MAX_BACKOFF_SECONDS must be greater than 0");
    assert!(INITIAL_BACKOFF_SECONDS > 0, "INITIAL_BACKOFF_SECONDS must be greater than 0");
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_map_to_sync_config() {
        let args = ServeArgs::parse_from([
            "kubepulse",
            "--coalesce-window-ms",
            "100",
            "--max-stream-lifetime-secs",
            "3600",
            "--mirror-idle-grace-secs",
            "30",
        ]);
        let config = args.sync_config();
        assert_eq!(config.coalesce_window, Duration::from_millis(100));
        assert_eq!(config.max_stream_lifetime, Some(Duration::from_secs(3600)));
        assert_eq!(config.mirror_idle_grace, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS));
    }

    #[test]
    fn test_default_window() {
        assert_eq!(SyncConfig::default().coalesce_window, Duration::from_millis(250));
        assert!(SyncConfig::default().max_stream_lifetime.is_none());
    }
}
