use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{robots::RobotInfo, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub clock: ClockConfig,
    pub display: DisplayConfig,
    pub lighting: LightingConfig,
    pub robots: Vec<RobotInfo>,
}

impl AppConfig {
    /// Parses a configuration document. Missing sections fall back to their
    /// defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads and parses the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Match timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub match_duration_ms: u64,
    /// Choreography window between a start/resume request and the countdown
    /// actually running.
    pub lead_time_ms: u64,
    pub monitor_tick_ms: u64,
    /// Extra time added to the values shown on the remote display for
    /// pause, resume and end notifications.
    pub display_pad_ms: u64,
    /// Also allow `add_time` while the countdown is starting or running.
    pub add_time_while_counting: bool,
}

impl ClockConfig {
    pub fn match_duration(&self) -> Duration {
        Duration::from_millis(self.match_duration_ms)
    }

    pub fn lead_time(&self) -> Duration {
        Duration::from_millis(self.lead_time_ms)
    }

    pub fn monitor_tick(&self) -> Duration {
        Duration::from_millis(self.monitor_tick_ms.max(1))
    }

    pub fn display_pad(&self) -> Duration {
        Duration::from_millis(self.display_pad_ms)
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            match_duration_ms: 180_000,
            lead_time_ms: 8_000,
            monitor_tick_ms: 100,
            display_pad_ms: 0,
            add_time_while_counting: false,
        }
    }
}

/// Where the remote countdown display lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub address: String,
    pub bind: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            address: "192.168.8.7:50001".to_string(),
            bind: "0.0.0.0:0".to_string(),
        }
    }
}

/// Lighting rig output and effect engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingConfig {
    pub universe: u16,
    pub min_interval_ms: u64,
    pub cancel_timeout_ms: u64,
    pub idle_delay_ms: u64,
    /// Art-Net node to send frames to. Frames are only traced when unset.
    pub artnet_target: Option<String>,
}

impl LightingConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            universe: 1,
            min_interval_ms: 20,
            cancel_timeout_ms: 1_000,
            idle_delay_ms: 5_000,
            artnet_target: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config =
            AppConfig::from_json_str(r#"{ "clock": { "lead_time_ms": 3000 } }"#).unwrap();

        assert_eq!(config.clock.lead_time(), Duration::from_secs(3));
        assert_eq!(config.clock.match_duration(), Duration::from_secs(180));
        assert_eq!(config.lighting.min_interval(), Duration::from_millis(20));
        assert_eq!(config.display.address, "192.168.8.7:50001");
        assert!(config.robots.is_empty());
    }

    #[test]
    fn rejects_malformed_json() {
        let err = AppConfig::from_json_str("{ clock: ").unwrap_err();
        assert!(matches!(err, crate::ArenaError::Config(_)));
    }

    #[test]
    fn monitor_tick_never_zero() {
        let clock = ClockConfig {
            monitor_tick_ms: 0,
            ..ClockConfig::default()
        };
        assert_eq!(clock.monitor_tick(), Duration::from_millis(1));
    }
}
