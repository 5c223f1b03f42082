//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use sixin_core::{SixinError, SixinResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub crypto: CryptoSection,
    #[serde(default)]
    pub webrtc: WebRtcSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_stun_port")]
    pub stun_port: u16,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Deadline for one event handler, in seconds.
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout: u64,
    #[serde(default = "default_fanout_workers")]
    pub fanout_workers: usize,
    #[serde(default = "default_stun_workers")]
    pub stun_workers: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            stun_port: default_stun_port(),
            idle_timeout: default_idle_timeout(),
            handler_timeout: default_handler_timeout(),
            fanout_workers: default_fanout_workers(),
            stun_workers: default_stun_workers(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded token signing secret.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl: default_token_ttl(),
        }
    }
}

/// `[crypto]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CryptoSection {
    /// Hex-encoded master key for sealing stored message bodies.
    #[serde(default)]
    pub at_rest_key: Option<String>,
}

/// `[webrtc]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct WebRtcSection {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default = "default_gather_timeout")]
    pub gather_timeout: u64,
}

impl Default for WebRtcSection {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            gather_timeout: default_gather_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_stun_port() -> u16 {
    3478
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_handler_timeout() -> u64 {
    10
}
fn default_fanout_workers() -> usize {
    10
}
fn default_stun_workers() -> usize {
    64
}
fn default_max_frame_size() -> usize {
    1 << 20
}
fn default_token_ttl() -> u64 {
    7 * 24 * 3600
}
fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_gather_timeout() -> u64 {
    5
}

/// CLI values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub stun_port: Option<u16>,
    pub idle_timeout: Option<u64>,
}

/// Resolved server configuration (secrets decoded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub stun_port: u16,
    pub idle_timeout: Duration,
    pub handler_timeout: Duration,
    pub fanout_workers: usize,
    pub stun_workers: usize,
    pub max_frame_size: usize,
    pub token_secret: Vec<u8>,
    /// True when no secret was configured and one was generated for this run.
    pub token_secret_ephemeral: bool,
    pub token_ttl: u64,
    pub at_rest_key: Option<Vec<u8>>,
    pub ice_servers: Vec<String>,
    pub gather_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let server = ServerSection::default();
        let webrtc = WebRtcSection::default();
        Self {
            host: server.host,
            port: server.port,
            stun_port: server.stun_port,
            idle_timeout: Duration::from_secs(server.idle_timeout),
            handler_timeout: Duration::from_secs(server.handler_timeout),
            fanout_workers: server.fanout_workers,
            stun_workers: server.stun_workers,
            max_frame_size: server.max_frame_size,
            token_secret: sixin_core::generate_secret(),
            token_secret_ephemeral: true,
            token_ttl: default_token_ttl(),
            at_rest_key: None,
            ice_servers: webrtc.ice_servers,
            gather_timeout: Duration::from_secs(webrtc.gather_timeout),
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> SixinResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    fn resolve(file: ConfigFile, cli: &CliOverrides) -> SixinResult<Self> {
        let token_secret = match file.auth.secret.as_deref() {
            Some(hex_secret) => decode_hex("auth.secret", hex_secret)?,
            None => {
                warn!("no auth.secret configured, tokens will not survive a restart");
                sixin_core::generate_secret()
            }
        };
        let at_rest_key = file
            .crypto
            .at_rest_key
            .as_deref()
            .map(|k| decode_hex("crypto.at_rest_key", k))
            .transpose()?;

        let idle_timeout = cli.idle_timeout.unwrap_or(file.server.idle_timeout);
        if idle_timeout == 0 {
            return Err(SixinError::Other("server.idle_timeout must be non-zero".into()));
        }
        // An offer must finish gathering before its handler deadline fires.
        if file.webrtc.gather_timeout >= file.server.handler_timeout {
            return Err(SixinError::Other(format!(
                "webrtc.gather_timeout ({}s) must be below server.handler_timeout ({}s)",
                file.webrtc.gather_timeout, file.server.handler_timeout
            )));
        }

        Ok(Self {
            host: file.server.host,
            port: cli.port.unwrap_or(file.server.port),
            stun_port: cli.stun_port.unwrap_or(file.server.stun_port),
            idle_timeout: Duration::from_secs(idle_timeout),
            handler_timeout: Duration::from_secs(file.server.handler_timeout),
            fanout_workers: file.server.fanout_workers.max(1),
            stun_workers: file.server.stun_workers.max(1),
            max_frame_size: file.server.max_frame_size,
            token_secret_ephemeral: file.auth.secret.is_none(),
            token_secret,
            token_ttl: file.auth.token_ttl,
            at_rest_key,
            ice_servers: file.webrtc.ice_servers,
            gather_timeout: Duration::from_secs(file.webrtc.gather_timeout),
        })
    }
}

fn parse(content: &str) -> SixinResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| SixinError::Other(format!("config parse error: {e}")))
}

fn decode_hex(field: &str, value: &str) -> SixinResult<Vec<u8>> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| SixinError::Other(format!("{field}: invalid hex: {e}")))?;
    if bytes.is_empty() {
        return Err(SixinError::Other(format!("{field}: must not be empty")));
    }
    Ok(bytes)
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.stun_port, 3478);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.fanout_workers, 10);
        assert_eq!(cfg.token_secret.len(), 32);
        assert!(cfg.at_rest_key.is_none());
    }

    #[test]
    fn file_then_cli_overrides() {
        let file = parse(
            r#"
            [server]
            port = 9000
            idle_timeout = 60

            [auth]
            secret = "00112233"

            [crypto]
            at_rest_key = "aabbcc"

            [webrtc]
            ice_servers = []
            "#,
        )
        .unwrap();
        let cli = CliOverrides {
            port: Some(9100),
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(file, &cli).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(60));
        assert_eq!(cfg.token_secret, vec![0x00, 0x11, 0x22, 0x33]);
        assert!(!cfg.token_secret_ephemeral);
        assert_eq!(cfg.at_rest_key, Some(vec![0xaa, 0xbb, 0xcc]));
        assert!(cfg.ice_servers.is_empty());
    }

    #[test]
    fn bad_hex_is_an_error() {
        let file = parse("[auth]\nsecret = \"zz\"\n").unwrap();
        assert!(ServerConfig::resolve(file, &CliOverrides::default()).is_err());
    }

    #[test]
    fn zero_idle_timeout_is_rejected() {
        let file = parse("[server]\nidle_timeout = 0\n").unwrap();
        assert!(ServerConfig::resolve(file, &CliOverrides::default()).is_err());

        let cli = CliOverrides {
            idle_timeout: Some(0),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), &cli).is_err());
    }

    #[test]
    fn gathering_must_fit_inside_the_handler_deadline() {
        let file = parse("[server]\nhandler_timeout = 10\n[webrtc]\ngather_timeout = 10\n").unwrap();
        let err = ServerConfig::resolve(file, &CliOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("gather_timeout"));

        let cfg = ServerConfig::resolve(ConfigFile::default(), &CliOverrides::default()).unwrap();
        assert!(cfg.gather_timeout < cfg.handler_timeout);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/sixin/config.toml")),
            &CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
    }
}
