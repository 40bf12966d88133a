//! Crawler Configuration
//!
//! Tunable parameters shared by the crawl, client and filter commands.
//! Values are loaded from an optional TOML file, then overridden by CLI flags.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Main configuration for the crawler and client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    // === Timing ===

    /// Minimum time between two checks of the same node (milliseconds)
    pub revalidate_interval_ms: u64,

    /// Crawl duration once the input set has been revalidated (milliseconds, 0 = no limit)
    pub timeout_ms: u64,

    /// Client mode: interval between node set saves (milliseconds)
    pub save_interval_ms: u64,

    /// Interval between status log lines (seconds)
    pub status_interval_secs: u64,

    // === Transport ===

    /// TCP connect plus RLPx handshake timeout (seconds)
    pub dial_timeout_secs: u64,

    /// Time allowed for the remote Hello (seconds)
    pub hello_timeout_secs: u64,

    /// Time allowed for the Status exchange (seconds)
    pub status_timeout_secs: u64,

    /// Per-read deadline while serving a peer (seconds)
    /// Expiry is not fatal, the read is simply retried
    pub read_timeout_secs: u64,

    /// Client name advertised in our Hello
    pub client_name: String,

    // === Network ===

    /// Number of concurrent node workers
    pub parallel: usize,

    /// Network id peers must advertise in Status (client mode)
    pub network_id: Option<u64>,

    /// UDP address the discovery service binds to
    pub discovery_addr: SocketAddr,

    /// Bootnodes (enode://, enr: or 0x records), merged with --bootnodes
    pub bootnodes: Vec<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            // Timing
            revalidate_interval_ms: 600_000, // 10 minutes
            timeout_ms: 1_800_000,           // 30 minutes
            save_interval_ms: 30_000,
            status_interval_secs: 8,

            // Transport
            dial_timeout_secs: 20,
            hello_timeout_secs: 10,
            status_timeout_secs: 20,
            read_timeout_secs: 10,
            client_name: format!("devp2p-crawler/v{}", env!("CARGO_PKG_VERSION")),

            // Network
            parallel: 16,
            network_id: None,
            discovery_addr: SocketAddr::from(([0, 0, 0, 0], 30303)),
            bootnodes: vec![],
        }
    }
}

impl CrawlerConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file at `path`, or defaults when it does not exist
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            warn!("⚠️  Config file {:?} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    // Builder-style methods for CLI overrides

    pub fn with_parallel(mut self, parallel: Option<usize>) -> Self {
        if let Some(parallel) = parallel {
            self.parallel = parallel;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(timeout) = timeout {
            self.timeout_ms = millis(timeout);
        }
        self
    }

    pub fn with_revalidate_interval(mut self, interval: Option<Duration>) -> Self {
        if let Some(interval) = interval {
            self.revalidate_interval_ms = millis(interval);
        }
        self
    }

    pub fn with_save_interval(mut self, interval: Option<Duration>) -> Self {
        if let Some(interval) = interval {
            self.save_interval_ms = millis(interval);
        }
        self
    }

    pub fn with_network_id(mut self, network_id: Option<u64>) -> Self {
        if network_id.is_some() {
            self.network_id = network_id;
        }
        self
    }

    pub fn with_discovery_addr(mut self, addr: Option<SocketAddr>) -> Self {
        if let Some(addr) = addr {
            self.discovery_addr = addr;
        }
        self
    }

    pub fn with_bootnodes(mut self, list: Option<&str>) -> Self {
        if let Some(list) = list {
            self.bootnodes.push(list.to_string());
        }
        self
    }

    /// All configured bootnodes as one comma-separated list
    pub fn bootnode_list(&self) -> String {
        self.bootnodes.join(",")
    }

    pub fn revalidate_interval(&self) -> Duration {
        Duration::from_millis(self.revalidate_interval_ms)
    }

    /// Crawl timeout, `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.parallel == 0 {
            anyhow::bail!("parallel must be greater than 0");
        }

        if self.status_interval_secs == 0 {
            anyhow::bail!("status_interval_secs must be greater than 0");
        }

        if self.save_interval_ms == 0 {
            anyhow::bail!("save_interval_ms must be greater than 0");
        }

        if self.network_id == Some(0) {
            anyhow::bail!("network_id must be greater than 0");
        }

        if self.read_timeout_secs == 0 || self.dial_timeout_secs == 0 {
            anyhow::bail!(
                "dial_timeout_secs ({}) and read_timeout_secs ({}) must be greater than 0",
                self.dial_timeout_secs,
                self.read_timeout_secs
            );
        }

        Ok(())
    }

    /// Client mode additionally needs a target network
    pub fn validate_client(&self) -> anyhow::Result<()> {
        self.validate()?;
        match self.network_id {
            Some(id) if id > 0 => Ok(()),
            _ => anyhow::bail!("network_id is required in client mode"),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Parse durations like `30m`, `10s`, `1h`, `250ms` or a bare `0`
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration '{}'", s))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("unknown unit '{}' in duration '{}'", unit, s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CrawlerConfig::default();
        assert_eq!(config.revalidate_interval(), Duration::from_secs(600));
        assert_eq!(config.parallel, 16);
        assert_eq!(config.timeout(), Some(Duration::from_secs(1800)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CrawlerConfig::default();
        config.parallel = 0;
        assert!(config.validate().is_err());

        let config = CrawlerConfig::default();
        assert!(config.validate_client().is_err());
        assert!(config.with_network_id(Some(1)).validate_client().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = CrawlerConfig::default()
            .with_parallel(Some(4))
            .with_timeout(Some(Duration::ZERO))
            .with_revalidate_interval(None)
            .with_bootnodes(Some("enode://a,enode://b"));

        assert_eq!(config.parallel, 4);
        assert_eq!(config.timeout(), None);
        assert_eq!(config.revalidate_interval(), Duration::from_secs(600));
        assert_eq!(config.bootnode_list(), "enode://a,enode://b");
    }

    #[test]
    fn test_sub_second_overrides_kept() {
        let half = parse_duration("500ms").unwrap();
        let config = CrawlerConfig::default()
            .with_timeout(Some(half))
            .with_revalidate_interval(Some(half))
            .with_save_interval(Some(half));

        assert_eq!(config.timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.revalidate_interval(), Duration::from_millis(500));
        assert_eq!(config.save_interval(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawler.toml");
        std::fs::write(&path, "network_id = 137\ntimeout_ms = 0\nbootnodes = [\"enode://a\"]\n").unwrap();

        let loaded = CrawlerConfig::load(&path).unwrap();
        assert_eq!(loaded.network_id, Some(137));
        assert_eq!(loaded.timeout(), None);
        assert_eq!(loaded.bootnode_list(), "enode://a");
        assert_eq!(loaded.discovery_addr, CrawlerConfig::default().discovery_addr);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CrawlerConfig::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.parallel, CrawlerConfig::default().parallel);
        assert_eq!(config.timeout(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CrawlerConfig = toml::from_str("parallel = 2").unwrap();
        assert_eq!(config.parallel, 2);
        assert_eq!(config.read_timeout_secs, 10);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30m"), Ok(Duration::from_secs(1800)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
