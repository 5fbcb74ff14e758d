//! Controller configuration.
//!
//! Layering, lowest to highest precedence:
//! 1. Built-in defaults (each component's `Default`)
//! 2. JSON file (`--config`)
//! 3. Environment (`FABRIC_*`)
//! 4. Command-line flags, applied by the binary

use crate::flow::FlowConfig;
use crate::poller::PollerConfig;
use crate::telemetry::TelemetryConfig;
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const ENV_LISTEN_ADDR: &str = "FABRIC_LISTEN_ADDR";
pub const ENV_TELEMETRY_DIR: &str = "FABRIC_TELEMETRY_DIR";
pub const ENV_SQLITE_PATH: &str = "FABRIC_SQLITE_PATH";
pub const ENV_POLL_INTERVAL_MS: &str = "FABRIC_POLL_INTERVAL_MS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub listen_addr: String,
    pub handshake_timeout_secs: u64,
    pub echo_interval_secs: u64,
    pub outbound_queue_depth: usize,
    pub flow: FlowConfig,
    pub poller: PollerConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        ControllerConfig {
            listen_addr: transport.listen_addr,
            handshake_timeout_secs: transport.handshake_timeout_secs,
            echo_interval_secs: transport.echo_interval_secs,
            outbound_queue_depth: transport.outbound_queue_depth,
            flow: FlowConfig::default(),
            poller: PollerConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Defaults overlaid with the JSON file at `path`, if given.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
                serde_json::from_str(&contents)
                    .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))
            }
            None => Ok(Self::default()),
        }
    }

    /// Applies `FABRIC_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), String> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies `FABRIC_*` variables from `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
            self.listen_addr = addr;
        }
        if let Some(dir) = lookup(ENV_TELEMETRY_DIR) {
            self.telemetry.output_dir = dir;
        }
        if let Some(path) = lookup(ENV_SQLITE_PATH) {
            self.telemetry.sqlite_path = Some(path);
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poller.poll_interval_ms = value
                .trim()
                .parse()
                .map_err(|e| format!("Invalid {} '{}': {}", ENV_POLL_INTERVAL_MS, value, e))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.poller.poll_interval_ms == 0 {
            return Err("poller.poll_interval_ms must be greater than 0".to_string());
        }
        let rate = self.telemetry.packet_in_sample_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(format!(
                "telemetry.packet_in_sample_rate must be within 0.0-1.0, got {}",
                rate
            ));
        }
        if self.outbound_queue_depth == 0 {
            return Err("outbound_queue_depth must be greater than 0".to_string());
        }
        if self.telemetry.queue_capacity == 0 {
            return Err("telemetry.queue_capacity must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            listen_addr: self.listen_addr.clone(),
            handshake_timeout_secs: self.handshake_timeout_secs,
            echo_interval_secs: self.echo_interval_secs,
            outbound_queue_depth: self.outbound_queue_depth,
        }
    }
}
