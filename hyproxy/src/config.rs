//! Proxy configuration.
//!
//! Loaded from a JSON file merged with `HYPROXY_`-prefixed environment
//! variables via Figment. Handler configuration blobs stay opaque until the
//! matching factory parses them.

use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;

use crate::error::{HyproxyError, Result};

fn default_log_level() -> String {
    "info".to_string()
}

fn default_idle_timeout_s() -> u64 {
    crate::constants::IDLE_TIMEOUT.as_secs()
}

/// Top-level proxy configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ProxyConfig {
    /// Public UDP listen address, e.g. "0.0.0.0:5520"
    pub listen: String,
    /// Log level filter (default = info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Session idle timeout in seconds (default = 30)
    #[serde(default = "default_idle_timeout_s")]
    pub idle_timeout_s: u64,
    /// The handler chain, in execution order
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

/// One handler in the chain: a registered type name plus its opaque config.
#[derive(Clone, Debug, Deserialize)]
pub struct HandlerConfig {
    #[serde(rename = "type")]
    pub handler_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

pub trait ConfigInit<T: DeserializeOwned> {
    /// Initializes the configuration object from the given Figment
    fn init(figment: Figment) -> Result<T> {
        Ok(figment.extract()?)
    }
}

pub trait FromPath<T: DeserializeOwned + ConfigInit<T>> {
    /// Creates a configuration object from the given path and the
    /// `HYPROXY_` environment prefix.
    fn from_path(path: &Path) -> Result<T> {
        if !path.exists() {
            return Err(HyproxyError::config_error(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let figment = Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed("HYPROXY_").split("__"));

        T::init(figment)
    }
}

impl ConfigInit<ProxyConfig> for ProxyConfig {}
impl FromPath<ProxyConfig> for ProxyConfig {}
