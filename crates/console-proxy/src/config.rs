//! Server configuration: TOML file + CLI overrides.

use console_core::{ConsoleError, ConsoleResult, EncryptorSecret};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub encryption: EncryptionSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            static_dir: default_static_dir(),
            max_sessions: default_max_sessions(),
            session_ttl: default_session_ttl(),
            idle_timeout: 0,
        }
    }
}

/// `[encryption]` section. Both values are base64url; either may be left
/// empty and supplied later through the key-rotation endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncryptionSection {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub iv: String,
}

/// `[upstream]` section: how the hypervisor tunnel endpoint is reached.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    #[serde(default)]
    pub verify_certificates: bool,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            port: default_upstream_port(),
            verify_certificates: false,
            ca_file: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9090
}
fn default_static_dir() -> String {
    "static".to_string()
}
fn default_max_sessions() -> usize {
    1000
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_upstream_port() -> u16 {
    443
}
fn default_connect_timeout() -> u64 {
    10
}

/// Values supplied on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub static_dir: Option<String>,
    pub key: Option<String>,
    pub iv: Option<String>,
}

/// How the upstream server certificate is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsTrust {
    /// Accept any certificate. The hypervisor management network is trusted.
    InsecureSkipVerify,
    /// Verify against the CA certificates in this PEM file.
    CaFile(PathBuf),
}

/// Resolved upstream settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub port: u16,
    pub trust: TlsTrust,
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            port: default_upstream_port(),
            trust: TlsTrust::InsecureSkipVerify,
            connect_timeout: Duration::from_secs(default_connect_timeout()),
        }
    }
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub static_dir: PathBuf,
    pub max_sessions: usize,
    pub session_ttl: Duration,
    pub idle_timeout: Option<Duration>,
    pub secret: EncryptorSecret,
    pub upstream: UpstreamConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> ConsoleResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Parse the TOML text of a config file.
    pub fn parse_file(content: &str) -> ConsoleResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| ConsoleError::Config(format!("config parse error: {e}")))
    }

    /// Merge a parsed file with CLI overrides and check the result.
    pub fn resolve(file: ConfigFile, overrides: &ConfigOverrides) -> ConsoleResult<Self> {
        let hostname = overrides.hostname.clone().unwrap_or(file.server.hostname);
        let port = overrides.port.unwrap_or(file.server.port);
        let static_dir = overrides
            .static_dir
            .clone()
            .unwrap_or(file.server.static_dir);
        let secret = EncryptorSecret::new(
            overrides.key.clone().unwrap_or(file.encryption.key),
            overrides.iv.clone().unwrap_or(file.encryption.iv),
        );

        if file.server.max_sessions == 0 {
            return Err(ConsoleError::Config("max_sessions must be at least 1".into()));
        }
        if secret.is_set() {
            secret
                .check()
                .map_err(|e| ConsoleError::Config(format!("encryption secret: {e}")))?;
        }

        let trust = match (
            file.upstream.verify_certificates,
            file.upstream.ca_file.filter(|s| !s.is_empty()),
        ) {
            (false, _) => TlsTrust::InsecureSkipVerify,
            (true, Some(ca)) => TlsTrust::CaFile(expand_tilde_str(&ca)),
            (true, None) => {
                return Err(ConsoleError::Config(
                    "upstream.verify_certificates requires upstream.ca_file".into(),
                ))
            }
        };

        Ok(Self {
            hostname,
            port,
            static_dir: expand_tilde_str(&static_dir),
            max_sessions: file.server.max_sessions,
            session_ttl: Duration::from_secs(file.server.session_ttl),
            idle_timeout: match file.server.idle_timeout {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            secret,
            upstream: UpstreamConfig {
                port: file.upstream.port,
                trust,
                connect_timeout: Duration::from_secs(file.upstream.connect_timeout),
            },
        })
    }

    /// `hostname:port` listen address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
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
        let cfg = ServerConfig::resolve(ConfigFile::default(), &ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:9090");
        assert_eq!(cfg.static_dir, PathBuf::from("static"));
        assert_eq!(cfg.max_sessions, 1000);
        assert_eq!(cfg.idle_timeout, None);
        assert!(!cfg.secret.is_set());
        assert_eq!(cfg.upstream.port, 443);
        assert_eq!(cfg.upstream.trust, TlsTrust::InsecureSkipVerify);
    }

    #[test]
    fn file_values_and_overrides() {
        let file = ServerConfig::parse_file(
            r#"
            [server]
            port = 8080
            hostname = "127.0.0.1"
            idle_timeout = 30

            [encryption]
            key = "kV9Ld-X4rKlTQF4ZJwyn9A"
            iv = "PCb_WQYrUgbahQeqDEkuUw"

            [upstream]
            port = 8443
            connect_timeout = 3
            "#,
        )
        .unwrap();

        let overrides = ConfigOverrides {
            port: Some(9999),
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(file, &overrides).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:9999");
        assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(30)));
        assert!(cfg.secret.is_set());
        assert_eq!(cfg.upstream.port, 8443);
        assert_eq!(cfg.upstream.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn rejects_bad_secret() {
        let overrides = ConfigOverrides {
            key: Some("c2hvcnQ".into()),
            iv: Some("PCb_WQYrUgbahQeqDEkuUw".into()),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::resolve(ConfigFile::default(), &overrides),
            Err(ConsoleError::Config(_))
        ));
    }

    #[test]
    fn verification_needs_ca_file() {
        let file = ServerConfig::parse_file("[upstream]\nverify_certificates = true\n").unwrap();
        assert!(ServerConfig::resolve(file, &ConfigOverrides::default()).is_err());

        let file = ServerConfig::parse_file(
            "[upstream]\nverify_certificates = true\nca_file = \"/etc/ssl/xen.pem\"\n",
        )
        .unwrap();
        let cfg = ServerConfig::resolve(file, &ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.upstream.trust, TlsTrust::CaFile(PathBuf::from("/etc/ssl/xen.pem")));
    }

    #[test]
    fn malformed_toml_is_config_error() {
        assert!(matches!(
            ServerConfig::parse_file("[server\nport = "),
            Err(ConsoleError::Config(_))
        ));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/console-proxy.toml")),
            &ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.port, 9090);
    }

    #[test]
    fn tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/static"), home.join("static"));
        }
        assert_eq!(expand_tilde_str("/srv/static"), PathBuf::from("/srv/static"));
    }
}
