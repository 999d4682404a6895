//! Device handler configuration management

use anyhow::{Context, Result, anyhow};
use protocol::{ChecksumMode, StaticCatalog};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(default)]
    pub handler: HandlerSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerSettings {
    pub log_level: String,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices to relay, as "0xVID:0xPID" patterns ("*" matches anything)
    ///
    /// An empty list relays every non-hub device.
    #[serde(default)]
    pub filters: Vec<UsbFilter>,
    /// Discovery poll period in milliseconds
    #[serde(default = "UsbSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Ignore hub-class devices during discovery
    #[serde(default = "UsbSettings::default_skip_hubs")]
    pub skip_hubs: bool,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            poll_interval_ms: Self::default_poll_interval(),
            skip_hubs: Self::default_skip_hubs(),
        }
    }
}

impl UsbSettings {
    fn default_poll_interval() -> u64 {
        200
    }

    fn default_skip_hubs() -> bool {
        true
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// One allow-list entry; `None` matches any id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl UsbFilter {
    pub const ANY: UsbFilter = UsbFilter {
        vendor_id: None,
        product_id: None,
    };

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|id| id == vendor_id)
            && self.product_id.is_none_or(|id| id == product_id)
    }
}

fn parse_usb_id(part: &str) -> Option<Option<u16>> {
    if part == "*" {
        return Some(None);
    }
    let digits = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X"))?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(digits, 16).ok().map(Some)
}

impl FromStr for UsbFilter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::ANY);
        }
        let parsed = s
            .split_once(':')
            .and_then(|(vid, pid)| Some((parse_usb_id(vid)?, parse_usb_id(pid)?)));
        match parsed {
            Some((vendor_id, product_id)) => Ok(Self {
                vendor_id,
                product_id,
            }),
            None => Err(format!(
                "usb filter '{}' is not 0xVID:0xPID (either side may be '*')",
                s
            )),
        }
    }
}

impl TryFrom<String> for UsbFilter {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UsbFilter> for String {
    fn from(filter: UsbFilter) -> Self {
        filter.to_string()
    }
}

impl fmt::Display for UsbFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |id: Option<u16>| match id {
            Some(id) => format!("0x{:04x}", id),
            None => "*".to_string(),
        };
        write!(f, "{}:{}", part(self.vendor_id), part(self.product_id))
    }
}

/// Relay timing, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Upper bound for every bulk transfer
    #[serde(default = "TimingSettings::default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
    /// How long to wait for a SubscriptionResponse after the Ping
    #[serde(default = "TimingSettings::default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Period between HeartbeatRequests to the device
    #[serde(default = "TimingSettings::default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Outstanding HeartbeatRequest age that counts as a dead device
    #[serde(default = "TimingSettings::default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    /// Sender idle pause between cycles with nothing to send
    #[serde(default = "TimingSettings::default_idle_wait")]
    pub idle_wait_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: Self::default_transfer_timeout(),
            handshake_timeout_ms: Self::default_handshake_timeout(),
            heartbeat_interval_ms: Self::default_heartbeat_interval(),
            heartbeat_timeout_ms: Self::default_heartbeat_timeout(),
            idle_wait_ms: Self::default_idle_wait(),
        }
    }
}

impl TimingSettings {
    fn default_transfer_timeout() -> u64 {
        1000
    }

    fn default_handshake_timeout() -> u64 {
        2000
    }

    fn default_heartbeat_interval() -> u64 {
        1000
    }

    fn default_heartbeat_timeout() -> u64 {
        3000
    }

    fn default_idle_wait() -> u64 {
        10
    }

    /// Durations handed to each relay
    pub fn relay_timing(&self) -> RelayTiming {
        RelayTiming {
            transfer_timeout: Duration::from_millis(self.transfer_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            idle_wait: Duration::from_millis(self.idle_wait_ms),
        }
    }
}

/// [`TimingSettings`] converted to durations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTiming {
    pub transfer_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub idle_wait: Duration,
}

impl Default for RelayTiming {
    fn default() -> Self {
        TimingSettings::default().relay_timing()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Checksum fold: "xor" or "legacy-fold"
    #[serde(default)]
    pub checksum: ChecksumMode,
    /// Optional TOML device catalog replacing the builtin one
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
}

impl HandlerConfig {
    /// Load configuration from `path`, or from the first standard location
    /// that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path,
            None => Self::search_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?,
        };
        Self::load_file(&config_path)
    }

    /// Load the first of `candidates` that exists, falling back to defaults
    ///
    /// Also returns the error that caused a fallback, for the caller to report.
    pub fn load_or_default(candidates: &[PathBuf]) -> (Self, Option<anyhow::Error>) {
        let found = candidates.iter().find(|p| p.exists());
        match found.map(|path| Self::load_file(path)) {
            Some(Ok(config)) => (config, None),
            Some(Err(e)) => (Self::default(), Some(e)),
            None => (
                Self::default(),
                Some(anyhow!("No configuration file found")),
            ),
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let config: HandlerConfig =
            toml::from_str(&content).with_context(|| format!("Cannot parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Write this configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Cannot write {}", path.display()))
    }

    /// Per-user configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("lowcar")
            .join("dev-handler.toml")
    }

    /// Standard locations, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc/lowcar/dev-handler.toml"),
        ]
    }

    /// Device catalog: the configured file, or the builtin table
    pub fn load_catalog(&self) -> Result<StaticCatalog> {
        match &self.protocol.catalog_path {
            Some(path) => StaticCatalog::load(path)
                .with_context(|| format!("Failed to load device catalog: {}", path.display())),
            None => Ok(StaticCatalog::builtin()),
        }
    }

    /// Check values serde cannot: log level, non-zero periods and the
    /// heartbeat timeout against its interval
    pub fn validate(&self) -> Result<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.handler.log_level.as_str()) {
            return Err(anyhow!(
                "handler.log_level '{}' is not one of {}",
                self.handler.log_level,
                LEVELS.join(", ")
            ));
        }

        if self.usb.poll_interval_ms == 0 {
            return Err(anyhow!("usb.poll_interval_ms must be greater than zero"));
        }

        let timing = &self.timing;
        for (name, value) in [
            ("transfer_timeout_ms", timing.transfer_timeout_ms),
            ("handshake_timeout_ms", timing.handshake_timeout_ms),
            ("heartbeat_interval_ms", timing.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", timing.heartbeat_timeout_ms),
            ("idle_wait_ms", timing.idle_wait_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("timing.{} must be greater than zero", name));
            }
        }

        if timing.heartbeat_timeout_ms <= timing.heartbeat_interval_ms {
            return Err(anyhow!(
                "timing.heartbeat_timeout_ms ({}) must exceed timing.heartbeat_interval_ms ({})",
                timing.heartbeat_timeout_ms,
                timing.heartbeat_interval_ms
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HandlerConfig::default();
        assert_eq!(config.handler.log_level, "info");
        assert!(config.usb.skip_hubs);
        assert_eq!(config.protocol.checksum, ChecksumMode::Xor);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_usb_filter_patterns() {
        let exact: UsbFilter = "0x2341:0x8036".parse().unwrap();
        assert!(exact.matches(0x2341, 0x8036));
        assert!(!exact.matches(0x2341, 0x0043));

        let vendor: UsbFilter = "0X1A86:*".parse().unwrap();
        assert_eq!(vendor.product_id, None);
        assert!(vendor.matches(0x1a86, 0x7523));

        assert_eq!("*".parse::<UsbFilter>(), Ok(UsbFilter::ANY));
        assert_eq!("*:*".parse::<UsbFilter>(), Ok(UsbFilter::ANY));
        assert_eq!(vendor.to_string(), "0x1a86:*");
    }

    #[test]
    fn test_usb_filter_rejects() {
        for bad in ["2341:8036", "0x2341", "0x1:0x2:0x3", "0xGHIJ:0x8036", "0x12345:*", "0x:*", "0x+1:*"] {
            assert!(bad.parse::<UsbFilter>().is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_fallback_reports_reason() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.toml");
        let (config, reason) = HandlerConfig::load_or_default(&[absent.clone()]);
        assert_eq!(config.handler.log_level, "info");
        assert!(reason.unwrap().to_string().contains("No configuration file found"));

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "[timing]\nheartbeat_timeout_ms = 10\n").unwrap();
        let (config, reason) = HandlerConfig::load_or_default(&[absent.clone(), broken]);
        assert_eq!(config.timing.heartbeat_timeout_ms, 3000);
        assert!(format!("{:#}", reason.unwrap()).contains("heartbeat_timeout_ms"));

        let good = dir.path().join("good.toml");
        fs::write(&good, "[handler]\nlog_level = \"debug\"\n").unwrap();
        let (config, reason) = HandlerConfig::load_or_default(&[absent, good]);
        assert_eq!(config.handler.log_level, "debug");
        assert!(reason.is_none());
    }

    #[test]
    fn test_validate_timing() {
        let mut config = HandlerConfig::default();
        config.timing.transfer_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = HandlerConfig::default();
        config.timing.heartbeat_timeout_ms = config.timing.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: HandlerConfig = toml::from_str(
            r#"
            [protocol]
            checksum = "legacy-fold"

            [timing]
            heartbeat_interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.protocol.checksum, ChecksumMode::LegacyFold);
        assert_eq!(config.timing.heartbeat_interval_ms, 250);
        assert_eq!(config.timing.heartbeat_timeout_ms, 3000);
        assert_eq!(config.usb.poll_interval_ms, 200);
        assert_eq!(config.handler.log_level, "info");
    }

    #[test]
    fn test_relay_timing() {
        let timing = TimingSettings::default().relay_timing();
        assert_eq!(timing.transfer_timeout, Duration::from_secs(1));
        assert_eq!(timing.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(timing, RelayTiming::default());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = HandlerConfig::default();
        config.handler.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.handler.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }
}
