//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use config::builder::{ConfigBuilder, DefaultState};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration from environment.
///
/// `path` names an optional config file (without extension); when omitted,
/// `config.toml` in the working directory is used if present.
pub fn init(path: Option<&str>) -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let file = match path {
        Some(p) => config::File::with_name(p).required(true),
        None => config::File::with_name("config").required(false),
    };

    let cfg = defaults(config::Config::builder())?
        .add_source(file)
        // Environment variables (NEXUS__SERVER__PORT, NEXUS__BUFFER__ENABLED, etc.)
        .add_source(
            config::Environment::with_prefix("NEXUS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    app_config.validate()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Parse a configuration from a TOML document layered over the defaults.
pub fn from_toml(toml: &str) -> Result<AppConfig, config::ConfigError> {
    let cfg = defaults(config::Config::builder())?
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?;
    let app_config: AppConfig = cfg.try_deserialize()?;
    app_config.validate()?;
    Ok(app_config)
}

fn defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
    builder
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 7000)?
        .set_default("server.announced_ip", "")?
        .set_default("webrtc.port_min", 50000)?
        .set_default("webrtc.port_max", 60000)?
        .set_default("router.live_cycle_secs", 6)?
        .set_default("router.sweep_interval_secs", 3)?
        .set_default("router.max_write_errors", 100)?
        .set_default("router.subscriber_queue", 512)?
        .set_default("router.cleaned_queue", 256)?
        .set_default("router.subscriber_grace_secs", 0)?
        .set_default("buffer.enabled", true)?
        .set_default("buffer.max_buffer_time_ms", 1000)?
        .set_default("buffer.pli_cycle_secs", 1)?
        .set_default("buffer.report_cycle_secs", 5)?
        .set_default("buffer.queue", 1024)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub webrtc: WebRtcConfig,
    pub router: RouterConfig,
    pub buffer: BufferConfig,
}

impl AppConfig {
    /// Reject settings that would make the relay misbehave at runtime.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.webrtc.port_min > self.webrtc.port_max {
            return Err(config::ConfigError::Message(format!(
                "webrtc.port_min ({}) is above webrtc.port_max ({})",
                self.webrtc.port_min, self.webrtc.port_max
            )));
        }
        if self.router.live_cycle_secs == 0 || self.router.sweep_interval_secs == 0 {
            return Err(config::ConfigError::Message(
                "router.live_cycle_secs and router.sweep_interval_secs must be non-zero".into(),
            ));
        }
        if self.router.subscriber_queue == 0
            || self.router.cleaned_queue == 0
            || self.buffer.queue == 0
        {
            return Err(config::ConfigError::Message(
                "queue capacities must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the HTTP signaling listener.
    pub host: String,
    pub port: u16,
    /// Address advertised in ICE host candidates. Empty means the bound address.
    pub announced_ip: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebRtcConfig {
    #[serde(default = "IceServerConfig::defaults")]
    pub ice_servers: Vec<IceServerConfig>,
    /// Ephemeral UDP port range used for ICE candidates.
    pub port_min: u16,
    pub port_max: u16,
}

/// ICE server configuration (STUN/TURN).
#[derive(Debug, Clone, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    /// Default STUN servers (free, public).
    pub fn defaults() -> Vec<Self> {
        vec![Self {
            urls: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            username: String::new(),
            credential: String::new(),
        }]
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// How long a router survives without publisher packets.
    pub live_cycle_secs: u64,
    pub sweep_interval_secs: u64,
    /// Consecutive failed writes tolerated before a subscriber is evicted.
    pub max_write_errors: u32,
    pub subscriber_queue: usize,
    pub cleaned_queue: usize,
    /// 0 keeps publisher-only routers alive indefinitely.
    pub subscriber_grace_secs: u64,
}

impl RouterConfig {
    pub fn live_cycle(&self) -> Duration {
        Duration::from_secs(self.live_cycle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn subscriber_grace(&self) -> Option<Duration> {
        (self.subscriber_grace_secs > 0).then(|| Duration::from_secs(self.subscriber_grace_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    /// Route publisher packets through the retention/NACK stage.
    pub enabled: bool,
    /// Retention window in milliseconds of media time.
    pub max_buffer_time_ms: u32,
    /// Periodic key frame requests for video; 0 disables.
    pub pli_cycle_secs: u64,
    /// Loss/bitrate reporting interval; 0 disables.
    pub report_cycle_secs: u64,
    pub queue: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_file() {
        let cfg = from_toml("").unwrap();
        assert_eq!(cfg.server.port, 7000);
        assert_eq!(cfg.router.live_cycle(), Duration::from_secs(6));
        assert_eq!(cfg.router.max_write_errors, 100);
        assert!(cfg.router.subscriber_grace().is_none());
        assert!(cfg.buffer.enabled);
        assert_eq!(cfg.buffer.max_buffer_time_ms, 1000);
        assert_eq!(cfg.webrtc.ice_servers.len(), 1);
    }

    #[test]
    fn file_values_override_defaults() {
        let cfg = from_toml(
            r#"
            [webrtc]
            port_min = 40000
            port_max = 40100
            [[webrtc.ice_servers]]
            urls = ["turn:turn.example.com:3478"]
            username = "relay"
            credential = "secret"

            [buffer]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.webrtc.port_min, 40000);
        assert_eq!(cfg.webrtc.ice_servers[0].username, "relay");
        assert!(!cfg.buffer.enabled);
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let err = from_toml("[webrtc]\nport_min = 6000\nport_max = 5000\n").unwrap_err();
        assert!(err.to_string().contains("port_min"));
    }
}
