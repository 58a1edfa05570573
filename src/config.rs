use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);
pub const DEFAULT_MULTICAST_PORT: u16 = 6766;
pub const DEFAULT_COMMAND_PORT: u16 = 6776;
/// Large import logs arrive as single frames; anything smaller truncates them.
pub const MIN_RECEIVE_BUFFER_BYTES: usize = 64 * 1024;
pub const DEFAULT_RECEIVE_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub discovery: DiscoveryConfig,
    pub channel: ChannelConfig,
    pub staging_strategy: StagingStrategy,
    pub blender_path: Option<PathBuf>,
    /// Overrides the bundled conversion script.
    pub blender_script: Option<PathBuf>,
    pub convert_timeout: Duration,
    pub journal_file: PathBuf,
    pub journal_max_size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub bind_address: Ipv4Addr,
    pub multicast_ttl: u32,
    pub ping_interval: Duration,
    pub node_timeout: Duration,
    pub discovery_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub command_endpoint: SocketAddr,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub receive_buffer_bytes: usize,
    pub decode_retries: u32,
}

/// How a fresh import reaches its destination folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingStrategy {
    Direct,
    /// Import under a scratch folder and move into place; for editors that rename on collision.
    TempStaging,
}

impl FromStr for StagingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(StagingStrategy::Direct),
            "temp-staging" | "temp_staging" | "staging" => Ok(StagingStrategy::TempStaging),
            _ => Err(anyhow::anyhow!("Invalid staging strategy: {}", s)),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_port: DEFAULT_MULTICAST_PORT,
            bind_address: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 0,
            ping_interval: Duration::from_secs(1),
            node_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_COMMAND_PORT)),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(600),
            receive_buffer_bytes: DEFAULT_RECEIVE_BUFFER_BYTES,
            decode_retries: 1,
        }
    }
}

fn expand_tilde(path_str: &str) -> Result<PathBuf, anyhow::Error> {
    Ok(PathBuf::from(shellexpand::tilde(path_str).into_owned()))
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let discovery_defaults = DiscoveryConfig::default();
        let discovery = DiscoveryConfig {
            multicast_group: parse_or(&lookup, "MULTICAST_GROUP", discovery_defaults.multicast_group)?,
            multicast_port: parse_or(&lookup, "MULTICAST_PORT", discovery_defaults.multicast_port)?,
            bind_address: parse_or(&lookup, "MULTICAST_BIND_ADDRESS", discovery_defaults.bind_address)?,
            multicast_ttl: parse_or(&lookup, "MULTICAST_TTL", discovery_defaults.multicast_ttl)?,
            ping_interval: Duration::from_millis(parse_or(&lookup, "PING_INTERVAL_MS", 1000u64)?),
            node_timeout: Duration::from_millis(parse_or(&lookup, "NODE_TIMEOUT_MS", 5000u64)?),
            discovery_timeout: Duration::from_millis(parse_or(&lookup, "DISCOVERY_TIMEOUT_MS", 10_000u64)?),
        };
        if !discovery.multicast_group.is_multicast() {
            anyhow::bail!("MULTICAST_GROUP is not a multicast address: {}", discovery.multicast_group);
        }

        let command_ip: Ipv4Addr = parse_or(&lookup, "COMMAND_BIND_ADDRESS", Ipv4Addr::LOCALHOST)?;
        let command_port: u16 = parse_or(&lookup, "COMMAND_PORT", DEFAULT_COMMAND_PORT)?;

        let mut receive_buffer_bytes: usize =
            parse_or(&lookup, "RECEIVE_BUFFER_BYTES", DEFAULT_RECEIVE_BUFFER_BYTES)?;
        if receive_buffer_bytes < MIN_RECEIVE_BUFFER_BYTES {
            warn!(
                requested = receive_buffer_bytes,
                minimum = MIN_RECEIVE_BUFFER_BYTES,
                "RECEIVE_BUFFER_BYTES too small for large import logs, raising to minimum"
            );
            receive_buffer_bytes = MIN_RECEIVE_BUFFER_BYTES;
        }

        let channel = ChannelConfig {
            command_endpoint: SocketAddr::from((command_ip, command_port)),
            connect_timeout: Duration::from_millis(parse_or(&lookup, "CONNECT_TIMEOUT_MS", 5000u64)?),
            command_timeout: Duration::from_millis(parse_or(&lookup, "COMMAND_TIMEOUT_MS", 600_000u64)?),
            receive_buffer_bytes,
            decode_retries: parse_or(&lookup, "DECODE_RETRIES", 1u32)?,
        };

        let staging_strategy = parse_or(&lookup, "STAGING_STRATEGY", StagingStrategy::Direct)?;

        let blender_path = lookup("BLENDER_PATH")
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde(&s))
            .transpose()?;
        let blender_script = lookup("BLENDER_SCRIPT")
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde(&s))
            .transpose()?;
        let convert_timeout = Duration::from_secs(parse_or(&lookup, "CONVERT_TIMEOUT_SECS", 300u64)?);

        let journal_file = expand_tilde(
            &lookup("JOURNAL_FILE").unwrap_or_else(|| "~/.ue-remote-import/commands.log".to_string()),
        )
        .context("Invalid JOURNAL_FILE")?;
        let journal_max_size_bytes = parse_or(&lookup, "JOURNAL_MAX_SIZE_MB", 10u64)? * 1024 * 1024;

        Ok(Config {
            log_level,
            discovery,
            channel,
            staging_strategy,
            blender_path,
            blender_script,
            convert_timeout,
            journal_file,
            journal_max_size_bytes,
        })
    }
}
