//! Gateway configuration, read from TOML with environment overrides.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use ethersim_bus::BusConfig;
use ethersim_core::types::serde_millis;

pub const CONFIG_ENV: &str = "ETHERSIM_CONFIG";
pub const LISTEN_ENV: &str = "ETHERSIM_LISTEN";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Wall-clock interval between scheduler ticks.
    #[serde(with = "serde_millis", rename = "tick_ms")]
    pub tick: Duration,
    #[serde(with = "serde_millis", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
    /// Origin prefixes allowed by CORS.
    pub allowed_origins: Vec<String>,
    pub bus: BusConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            tick: Duration::from_millis(50),
            request_timeout: Duration::from_secs(120),
            allowed_origins: vec!["http://localhost".to_string()],
            bus: BusConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, or falls back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Config path from the first CLI argument or `ETHERSIM_CONFIG`, then
    /// `ETHERSIM_LISTEN` on top.
    pub fn from_env() -> Result<Self> {
        let path = std::env::args().nth(1).or_else(|| std::env::var(CONFIG_ENV).ok());
        let mut config = Self::load(path.as_deref().map(Path::new))?;
        config.override_listen(std::env::var(LISTEN_ENV).ok().as_deref())?;
        Ok(config)
    }

    pub fn override_listen(&mut self, value: Option<&str>) -> Result<()> {
        if let Some(value) = value {
            self.listen = value
                .parse()
                .with_context(|| format!("{} is not a socket address: {}", LISTEN_ENV, value))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick.is_zero() {
            bail!("tick_ms must be positive");
        }
        if self.request_timeout.is_zero() {
            bail!("request_timeout_ms must be positive");
        }
        self.bus.validate()?;
        Ok(())
    }
}
