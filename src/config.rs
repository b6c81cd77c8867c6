// Application configuration
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HTTP_PORT: u16 = 8888;
pub const DEFAULT_SOCKS_PORT: u16 = 1888;

/// Persisted settings, edited by hand or by a front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Upstream proxy
    pub upstream_host: String,
    pub upstream_http_port: u16,
    pub upstream_socks_port: u16,

    // Credentials
    pub username: String,
    pub password: String,

    // Informational only
    pub carrier_ip: String,

    // Local listeners
    pub local_http_port: u16,
    pub local_socks_port: u16,

    // Timeouts (seconds)
    pub connect_timeout: u64,
    /// 0 keeps tunnels open until one side closes.
    pub relay_timeout: u64,

    // Tests
    pub proxy_test_url: String,

    // Logging
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            upstream_host: String::new(),
            upstream_http_port: 8080,
            upstream_socks_port: 1080,
            username: String::new(),
            password: String::new(),
            carrier_ip: String::new(),
            local_http_port: DEFAULT_HTTP_PORT,
            local_socks_port: DEFAULT_SOCKS_PORT,
            connect_timeout: 10,
            relay_timeout: 0,
            proxy_test_url: String::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!("Configuration not found, using default values");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)?;
        let settings: Settings = toml::from_str(&content)?;

        tracing::info!("Configuration loaded from {:?}", config_path);
        Ok(settings)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;

        tracing::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to find configuration directory"))?;

        Ok(config_dir.join("carrier-relay").join("config.toml"))
    }

    /// Env overrides: RELAY_UPSTREAM_HOST, RELAY_USERNAME, RELAY_PASSWORD,
    /// RELAY_HTTP_PORT, RELAY_SOCKS_PORT.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("RELAY_UPSTREAM_HOST") {
            self.upstream_host = host;
        }
        if let Some(user) = lookup("RELAY_USERNAME") {
            self.username = user;
        }
        if let Some(pass) = lookup("RELAY_PASSWORD") {
            self.password = pass;
        }
        if let Some(port) = lookup("RELAY_HTTP_PORT") {
            self.local_http_port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("RELAY_HTTP_PORT '{}' invalid: {}", port, e))?;
        }
        if let Some(port) = lookup("RELAY_SOCKS_PORT") {
            self.local_socks_port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("RELAY_SOCKS_PORT '{}' invalid: {}", port, e))?;
        }
        Ok(())
    }

    pub fn proxy_config(&self) -> Result<ProxyConfig> {
        if self.upstream_host.trim().is_empty() {
            anyhow::bail!("upstream_host is empty");
        }

        Ok(ProxyConfig {
            host: self.upstream_host.trim().to_string(),
            http_port: self.upstream_http_port,
            socks_port: self.upstream_socks_port,
            username: self.username.clone(),
            password: self.password.clone(),
            carrier_ip: self.carrier_ip.clone(),
            active: true,
        })
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            http_port: self.local_http_port,
            socks_port: self.local_socks_port,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            relay_timeout: match self.relay_timeout {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

/// Upstream proxy parameters for one relay run. Never mutated once handed to
/// the controller.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub http_port: u16,
    pub socks_port: u16,
    pub username: String,
    pub password: String,
    pub carrier_ip: String,
    pub active: bool,
}

impl ProxyConfig {
    pub fn new(
        host: impl Into<String>,
        http_port: u16,
        socks_port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        ProxyConfig {
            host: host.into(),
            http_port,
            socks_port,
            username: username.into(),
            password: password.into(),
            carrier_ip: String::new(),
            active: true,
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("http_port", &self.http_port)
            .field("socks_port", &self.socks_port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("carrier_ip", &self.carrier_ip)
            .field("active", &self.active)
            .finish()
    }
}

/// Local listener and timeout options, fixed for the controller's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    pub http_port: u16,
    pub socks_port: u16,
    pub connect_timeout: Duration,
    pub relay_timeout: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Settings::default().relay_options()
    }
}
