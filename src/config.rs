//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

impl Default for FloodgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Interval between expired-window sweeps in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Policy applied to authentication endpoints
    #[serde(default = "default_auth_policy")]
    pub auth: PolicyConfig,

    /// Policy applied to general API traffic
    #[serde(default = "default_api_policy")]
    pub api: PolicyConfig,

    /// Policy applied to expensive operations
    #[serde(default = "default_expensive_policy")]
    pub expensive: PolicyConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            auth: default_auth_policy(),
            api: default_api_policy(),
            expensive: default_expensive_policy(),
        }
    }
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_auth_policy() -> PolicyConfig {
    PolicyConfig {
        window_ms: 900_000,
        max: 10,
        message: "Too many authentication attempts, please try again later.".to_string(),
    }
}

fn default_api_policy() -> PolicyConfig {
    PolicyConfig {
        window_ms: 60_000,
        max: 100,
        message: "Too many requests, please try again later.".to_string(),
    }
}

fn default_expensive_policy() -> PolicyConfig {
    PolicyConfig {
        window_ms: 60_000,
        max: 10,
        message: "Rate limit exceeded for this operation, please slow down.".to_string(),
    }
}

/// A single limiter policy: window length, request ceiling, rejection message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Window duration in milliseconds
    pub window_ms: u64,

    /// Maximum allowed request count per window
    pub max: u64,

    /// Message returned in the 429 response body
    pub message: String,
}

impl FloodgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: FloodgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::FloodgateError::Config(e.to_string()))?;
        Ok(config)
    }
}
