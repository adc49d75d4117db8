//! Configuration management for rtbh.

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aggregator::{parse_line, ParsedLine};
use crate::error::RtbhError;

/// Default environment variable holding the router password.
pub const PASSWORD_ENV: &str = "RTBH_ROUTER_PASSWORD";

/// Secure string type that zeroizes memory on drop
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target router
    pub router: RouterConfig,

    /// Blocklist sources, processed as one union
    pub sources: Vec<SourceConfig>,

    /// Trusted networks that must never be null-routed
    pub exclusions: Vec<String>,

    /// Optional file with one trusted network per line (`#` comments allowed)
    pub exclusions_file: Option<PathBuf>,

    /// Static entries that are always blocked
    pub local_entries: Vec<String>,

    /// Directory scanned for permanent local list files
    pub local_dir: PathBuf,

    /// Suffix identifying local list files inside `local_dir`
    pub local_suffix: String,

    /// Route command template
    pub render: RenderConfig,

    /// Where artifacts, state and locks live
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            sources: default_sources(),
            exclusions: default_exclusions(),
            exclusions_file: None,
            local_entries: Vec::new(),
            local_dir: PathBuf::from("/etc/rtbh/local"),
            local_suffix: ".myset".to_string(),
            render: RenderConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate everything needed to build the route set.
    ///
    /// Router credentials are checked separately by [`RouterConfig::validate`]
    /// because a dry run never needs them.
    pub fn validate(&self) -> Result<(), RtbhError> {
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(RtbhError::Config("Source with empty name".to_string()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(RtbhError::Config(format!(
                    "Duplicate source name '{}'",
                    source.name
                )));
            }
            match (&source.url, &source.path) {
                (Some(_), Some(_)) | (None, None) => {
                    return Err(RtbhError::Config(format!(
                        "Source '{}' must set exactly one of 'url' or 'path'",
                        source.name
                    )));
                }
                (Some(url), None) if source.enabled && !url.starts_with("https://") => {
                    return Err(RtbhError::Config(format!(
                        "Source '{}' URL must use HTTPS: {}",
                        source.name, url
                    )));
                }
                _ => {}
            }
        }

        for entry in &self.exclusions {
            parse_entry(entry)?;
        }
        for entry in &self.local_entries {
            parse_entry(entry)?;
        }

        if self.local_suffix.is_empty() {
            return Err(RtbhError::Config("local_suffix must not be empty".to_string()));
        }

        self.render.validate()?;
        self.router.timeouts.validate()?;

        Ok(())
    }

    /// Sources that are switched on, in config order.
    pub fn enabled_sources(&self) -> Vec<&SourceConfig> {
        self.sources.iter().filter(|s| s.enabled).collect()
    }

    /// Parsed static local entries.
    pub fn local_entry_blocks(&self) -> Result<Vec<IpNet>, RtbhError> {
        self.local_entries.iter().map(|e| parse_entry(e)).collect()
    }
}

/// Parse a single configured network (bare address or CIDR).
pub fn parse_entry(entry: &str) -> Result<IpNet, RtbhError> {
    match parse_line(entry) {
        ParsedLine::Network(net) => Ok(net),
        ParsedLine::Skip | ParsedLine::Invalid => Err(RtbhError::Config(format!(
            "Invalid network in config: '{}'",
            entry
        ))),
    }
}

/// One blocklist source: either a remote URL or a local file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SourceConfig {
    pub fn remote(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: Some(url.to_string()),
            path: None,
            enabled: true,
        }
    }

    pub fn file(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            url: None,
            path: Some(path.into()),
            enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Device families with known CLI dialects.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceProfile {
    /// Classic IOS: no configuration replace, failures cannot be reverted
    CiscoIos,
    /// IOS-XE: supports `configure replace` from a saved snapshot
    #[default]
    CiscoIosXe,
}

impl DeviceProfile {
    pub fn supports_rollback(self) -> bool {
        matches!(self, DeviceProfile::CiscoIosXe)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Password can be set directly or via RTBH_ROUTER_PASSWORD
    pub password: SecureString,
    /// Environment variable name to read the password from (optional)
    pub password_env: Option<String>,
    /// Private key for key-based auth; takes precedence over the password
    pub key_file: Option<PathBuf>,
    pub profile: DeviceProfile,
    /// Staging location of the artifact on the device
    pub staging_path: String,
    /// Where the pre-apply snapshot is stored on the device
    pub snapshot_path: String,
    /// Re-read the staged artifact before applying it
    pub verify_upload: bool,
    /// Value passed to ssh `StrictHostKeyChecking`
    pub host_key_checking: String,
    pub timeouts: Timeouts,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            password: SecureString::default(),
            password_env: None,
            key_file: None,
            profile: DeviceProfile::default(),
            staging_path: "flash:rtbh_commands.txt".to_string(),
            snapshot_path: "flash:rtbh_rollback.cfg".to_string(),
            verify_upload: true,
            host_key_checking: "accept-new".to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

impl RouterConfig {
    /// Get the effective password, checking env vars first
    pub fn get_password(&self) -> SecureString {
        if let Some(ref env_name) = self.password_env {
            if let Ok(val) = env::var(env_name) {
                return SecureString::new(val);
            }
        }
        if let Ok(val) = env::var(PASSWORD_ENV) {
            return SecureString::new(val);
        }
        self.password.clone()
    }

    /// Checks needed before the device is contacted.
    pub fn validate(&self) -> Result<(), RtbhError> {
        if self.host.trim().is_empty() {
            return Err(RtbhError::Config("router.host is not set".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(RtbhError::Config("router.username is not set".to_string()));
        }
        if self.key_file.is_none() && self.get_password().is_empty() {
            return Err(RtbhError::Config(format!(
                "No router credentials: set router.key_file, router.password or {}",
                PASSWORD_ENV
            )));
        }
        for (field, value) in [
            ("staging_path", &self.staging_path),
            ("snapshot_path", &self.snapshot_path),
        ] {
            if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(RtbhError::Config(format!(
                    "router.{} must be a single non-empty token",
                    field
                )));
            }
        }
        Ok(())
    }

    /// `user@host` for ssh/scp.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Per-operation time limits, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect_secs: u64,
    pub transfer_secs: u64,
    pub verify_secs: u64,
    pub apply_secs: u64,
    /// Longest silence tolerated while waiting on an interactive prompt
    pub prompt_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: 30,
            transfer_secs: 120,
            verify_secs: 60,
            apply_secs: 300,
            prompt_secs: 30,
        }
    }
}

impl Timeouts {
    fn validate(&self) -> Result<(), RtbhError> {
        let all = [
            self.connect_secs,
            self.transfer_secs,
            self.verify_secs,
            self.apply_secs,
            self.prompt_secs,
        ];
        if all.contains(&0) {
            return Err(RtbhError::Config("router timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }

    pub fn verify(&self) -> Duration {
        Duration::from_secs(self.verify_secs)
    }

    pub fn apply(&self) -> Duration {
        Duration::from_secs(self.apply_secs)
    }

    pub fn prompt(&self) -> Duration {
        Duration::from_secs(self.prompt_secs)
    }
}

/// How the prefix length is written in IPv4 route commands.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MaskFormat {
    /// `255.255.255.0`
    #[default]
    Netmask,
    /// `0.0.0.255`
    Wildcard,
    /// `10.0.0.0/24`
    Cidr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Leading words of an IPv4 route command
    pub prefix: String,
    /// Trailing words before the tag (discard interface)
    pub suffix: String,
    /// Black-hole tag identifying routes owned by rtbh
    pub tag: u32,
    /// Leading words of an IPv6 route command
    pub ipv6_prefix: String,
    pub mask: MaskFormat,
    /// Override for the first line that wipes previously installed routes
    pub clear_command: Option<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            prefix: "ip route".to_string(),
            suffix: "Null0 tag".to_string(),
            tag: 66,
            ipv6_prefix: "ipv6 route".to_string(),
            mask: MaskFormat::default(),
            clear_command: None,
        }
    }
}

impl RenderConfig {
    /// Text that ends every tagged route line, e.g. `Null0 tag 66`.
    pub fn route_suffix(&self) -> String {
        format!("{} {}", self.suffix.trim(), self.tag)
    }

    fn validate(&self) -> Result<(), RtbhError> {
        for (field, value) in [
            ("prefix", &self.prefix),
            ("suffix", &self.suffix),
            ("ipv6_prefix", &self.ipv6_prefix),
        ] {
            if value.trim().is_empty() {
                return Err(RtbhError::Config(format!("render.{} must not be empty", field)));
            }
            if value.contains('\n') || value.contains('\r') {
                return Err(RtbhError::Config(format!(
                    "render.{} must be a single line",
                    field
                )));
            }
        }
        if let Some(ref clear) = self.clear_command {
            if clear.trim().is_empty() || clear.contains('\n') || clear.contains('\r') {
                return Err(RtbhError::Config(
                    "render.clear_command must be a single non-empty line".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Rendered command file
    pub artifact: PathBuf,
    /// Record of the last confirmed deployment
    pub state_file: PathBuf,
    /// Directory holding per-device lock files
    pub lock_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            artifact: PathBuf::from("/var/lib/rtbh/rtbh_commands.txt"),
            state_file: PathBuf::from("/var/lib/rtbh/state.json"),
            lock_dir: PathBuf::from("/run/rtbh"),
        }
    }
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::remote(
            "feodo_recommended",
            "https://feodotracker.abuse.ch/downloads/ipblocklist_recommended.txt",
        ),
        SourceConfig::remote(
            "spamhaus_drop",
            "https://iplists.firehol.org/files/spamhaus_drop.netset",
        ),
        SourceConfig {
            enabled: false,
            ..SourceConfig::remote(
                "firehol_level1",
                "https://iplists.firehol.org/files/firehol_level1.netset",
            )
        },
    ]
}

fn default_exclusions() -> Vec<String> {
    vec![
        "10.0.0.0/8".to_string(),     // RFC1918
        "172.16.0.0/12".to_string(),  // RFC1918
        "192.168.0.0/16".to_string(), // RFC1918
        "127.0.0.0/8".to_string(),    // Loopback
    ]
}
