//! Client and server configuration.
//!
//! Values come from defaults, then an optional JSON file, then `COURIER_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CourierError, Result};
use crate::paths;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            idle_timeout_secs: 45,
            write_timeout_secs: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 || self.idle_timeout_secs == 0 || self.write_timeout_secs == 0 {
            return Err(CourierError::Config("timeouts must be non-zero".into()));
        }
        if self.idle_timeout_secs <= self.heartbeat_interval_secs {
            return Err(CourierError::Config(
                "idle_timeout_secs must be greater than heartbeat_interval_secs".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server_addr: String,
    /// Name checked against the server certificate.
    pub server_name: String,
    /// PEM file with the CA (or pinned self-signed certificate) to trust.
    pub ca_cert: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7443".into(),
            server_name: "localhost".into(),
            ca_cert: None,
            data_dir: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = read_json_or_default(path)?;
        config.apply_env(|k| std::env::var(k).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("COURIER_SERVER_ADDR") {
            self.server_addr = v;
        }
        if let Some(v) = var("COURIER_SERVER_NAME") {
            self.server_name = v;
        }
        if let Some(v) = var("COURIER_CA_CERT") {
            self.ca_cert = Some(PathBuf::from(v));
        }
        if let Some(v) = var("COURIER_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_addr.trim().is_empty() {
            return Err(CourierError::Config("server_addr must be set".into()));
        }
        if self.server_name.trim().is_empty() {
            return Err(CourierError::Config("server_name must be set".into()));
        }
        self.timeouts.validate()
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub data_dir: Option<PathBuf>,
    /// Blocks granted to a new account.
    pub initial_blocks: u64,
    /// Blocks charged per delivered message.
    pub msg_cost: u64,
    pub timeouts: TimeoutConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7443".into(),
            tls_cert: PathBuf::from("server.crt"),
            tls_key: PathBuf::from("server.key"),
            data_dir: None,
            initial_blocks: 100,
            msg_cost: 1,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = read_json_or_default(path)?;
        config.apply_env(|k| std::env::var(k).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("COURIER_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = var("COURIER_TLS_CERT") {
            self.tls_cert = PathBuf::from(v);
        }
        if let Some(v) = var("COURIER_TLS_KEY") {
            self.tls_key = PathBuf::from(v);
        }
        if let Some(v) = var("COURIER_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(CourierError::Config("listen_addr must be set".into()));
        }
        self.timeouts.validate()
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::data_dir(),
        }
    }
}

fn read_json_or_default<T: Default + serde::de::DeserializeOwned>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| CourierError::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| CourierError::Config(format!("invalid config {}: {e}", path.display())))
}
