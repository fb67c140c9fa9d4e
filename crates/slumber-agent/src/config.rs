use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Component, Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

use crate::support::{env_string, env_u64};

pub const DEFAULT_DATA_ROOT: &str = "/terraria";
pub const DEFAULT_SERVER_ROOT: &str = "/tshock";
const SERVER_BINARY_NAME: &str = "TShock.Server";
const TSHOCK_CONFIG_FILE: &str = "config.json";

const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
const DEFAULT_STOP_GRACE_SEC: u64 = 10;

/// What counts as a genuine wake trigger on the game port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakePolicy {
    /// Any accepted connection wakes the server.
    AnyConnection,
    /// Only a connection that opens with a Terraria client hello wakes the server.
    Handshake,
}

impl WakePolicy {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "any" | "any-connection" | "any_connection" => Ok(Self::AnyConnection),
            "handshake" | "hello" => Ok(Self::Handshake),
            other => anyhow::bail!("invalid SLUMBER_WAKE_POLICY: {other} (expected any|handshake)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NtfyConfig {
    pub topic: Option<String>,
    pub auth: Option<String>,
}

/// Ports and limits taken from TShock's own `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TshockSettings {
    pub server_port: u16,
    pub rest_api_port: u16,
    pub max_slots: u32,
}

impl Default for TshockSettings {
    fn default() -> Self {
        Self {
            server_port: 7777,
            rest_api_port: 7878,
            max_slots: 8,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct TshockConfigFile {
    #[serde(rename = "Settings", default)]
    settings: TshockSettings,
}

pub fn parse_tshock_config(raw: &str) -> anyhow::Result<TshockSettings> {
    let file: TshockConfigFile = serde_json::from_str(raw).context("parse tshock config.json")?;
    let s = file.settings;
    if s.server_port == 0 || s.rest_api_port == 0 {
        anyhow::bail!("tshock config.json must set non-zero ServerPort and RestApiPort");
    }
    if s.server_port == s.rest_api_port {
        anyhow::bail!(
            "ServerPort and RestApiPort must differ (both {})",
            s.server_port
        );
    }
    Ok(s)
}

/// Accepts humantime strings (`10m`, `1h 30m`) and bare integers as milliseconds.
pub fn parse_idle_timeout(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    let d = if raw.chars().all(|c| c.is_ascii_digit()) {
        Duration::from_millis(raw.parse::<u64>().context("parse IDLE_TIMEOUT")?)
    } else {
        humantime::parse_duration(raw).with_context(|| format!("invalid IDLE_TIMEOUT: {raw}"))?
    };
    if d.is_zero() {
        anyhow::bail!("IDLE_TIMEOUT must be greater than zero");
    }
    Ok(d)
}

fn validate_world_file(world: &str) -> anyhow::Result<()> {
    let p = Path::new(world);
    if p.is_absolute() {
        anyhow::bail!("WORLD_FILE must be relative to the data root: {world}");
    }
    if p.components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        anyhow::bail!("WORLD_FILE must not leave the data root: {world}");
    }
    Ok(())
}

/// Supervisor configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub idle_timeout: Duration,
    pub world_file: String,
    pub data_root: PathBuf,
    pub server_root: PathBuf,
    pub server_binary: PathBuf,
    pub bind_ip: IpAddr,
    pub game_port: u16,
    pub rest_port: u16,
    pub max_players: u32,
    /// Real server status endpoint polled while awake.
    pub status_url: String,
    pub wake_policy: WakePolicy,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub ntfy: NtfyConfig,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::load(|name| std::env::var(name).ok())
    }

    pub fn load(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let idle_timeout = env_string(&lookup, "IDLE_TIMEOUT")
            .ok_or_else(|| anyhow::anyhow!("IDLE_TIMEOUT is required"))
            .and_then(|v| parse_idle_timeout(&v))?;

        let world_file = env_string(&lookup, "WORLD_FILE")
            .ok_or_else(|| anyhow::anyhow!("WORLD_FILE is required"))?;
        validate_world_file(&world_file)?;

        let data_root = env_string(&lookup, "SLUMBER_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
        let server_root = env_string(&lookup, "SLUMBER_SERVER_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_ROOT));
        let server_binary = env_string(&lookup, "SLUMBER_SERVER_BINARY")
            .map(PathBuf::from)
            .unwrap_or_else(|| server_root.join(SERVER_BINARY_NAME));

        let bind_ip = match env_string(&lookup, "SLUMBER_BIND_ADDR") {
            Some(v) => v
                .parse::<IpAddr>()
                .map_err(|_| anyhow::anyhow!("invalid SLUMBER_BIND_ADDR: {v}"))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let wake_policy = match env_string(&lookup, "SLUMBER_WAKE_POLICY") {
            Some(v) => WakePolicy::parse(&v)?,
            None => WakePolicy::AnyConnection,
        };

        let poll_interval = Duration::from_millis(
            env_u64(&lookup, "SLUMBER_POLL_INTERVAL_MS")
                .map(|v| v.clamp(250, 60_000))
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        );
        let stop_grace = Duration::from_secs(
            env_u64(&lookup, "SLUMBER_STOP_GRACE_SEC")
                .map(|v| v.clamp(1, 300))
                .unwrap_or(DEFAULT_STOP_GRACE_SEC),
        );

        let config_path = data_root.join(TSHOCK_CONFIG_FILE);
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("read tshock config {}", config_path.display()))?;
        let tshock = parse_tshock_config(&raw)
            .with_context(|| format!("load tshock config {}", config_path.display()))?;

        let ntfy = NtfyConfig {
            topic: env_string(&lookup, "NTFY_TOPIC"),
            auth: env_string(&lookup, "NTFY_AUTH"),
        };

        Ok(Self {
            idle_timeout,
            world_file,
            data_root,
            server_root,
            server_binary,
            bind_ip,
            game_port: tshock.server_port,
            rest_port: tshock.rest_api_port,
            max_players: tshock.max_slots,
            status_url: format!("http://127.0.0.1:{}/status", tshock.rest_api_port),
            wake_policy,
            poll_interval,
            stop_grace,
            ntfy,
        })
    }

    pub fn world_path(&self) -> PathBuf {
        self.data_root.join(&self.world_file)
    }

    /// Loopback settings with OS-assigned ports; callers override what they need.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            idle_timeout: Duration::from_millis(300),
            world_file: "test.wld".to_string(),
            data_root: std::env::temp_dir(),
            server_root: std::env::temp_dir(),
            server_binary: PathBuf::from("/bin/sh"),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            game_port: 0,
            rest_port: 0,
            max_players: 8,
            status_url: "http://127.0.0.1:9/status".to_string(),
            wake_policy: WakePolicy::AnyConnection,
            poll_interval: Duration::from_millis(50),
            stop_grace: Duration::from_secs(2),
            ntfy: NtfyConfig::default(),
        }
    }
}
