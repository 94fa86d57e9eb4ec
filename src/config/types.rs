//! Configuration types

use crate::dataplane::{NaptConfig, NatTimeouts};
use crate::telemetry::LogConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default ICMP query timeout in seconds
pub const DEFAULT_ICMP_TIMEOUT_SECS: u64 = 60;

/// Default established TCP idle timeout in seconds
pub const DEFAULT_TCP_ESTABLISHED_SECS: u64 = 7440;

/// Default transitory TCP idle timeout in seconds
pub const DEFAULT_TCP_TRANSITORY_SECS: u64 = 300;

/// Default grace period for connection-less TCP mappings in milliseconds
pub const DEFAULT_TCP_EMPTY_GRACE_MS: u64 = 500;

/// Default reaper tick in milliseconds
pub const DEFAULT_REAPER_TICK_MS: u64 = 1000;

pub const DEFAULT_INTERNAL_INTERFACE: &str = "eth1";

pub const DEFAULT_RANGE: (u16, u16) = (1024, 65535);

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub nat: NatSection,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NatSection {
    pub internal_interface: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    pub ports: Option<RangeConfig>,
    pub icmp_ids: Option<RangeConfig>,
}

/// Timeouts in seconds, except the empty-mapping grace in milliseconds
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutConfig {
    pub icmp: Option<u64>,
    pub tcp_established: Option<u64>,
    pub tcp_transitory: Option<u64>,
    pub tcp_empty_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RangeConfig {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReaperConfig {
    pub tick_ms: Option<u64>,
}

// ============================================================================
// Resolved settings (all defaults filled in)
// ============================================================================

/// Fully resolved settings, as written by `config generate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatSettings {
    pub generated_at: String,
    pub internal_interface: String,
    pub ports: (u16, u16),
    pub icmp_ids: (u16, u16),
    pub reaper_tick_ms: u64,
    pub timeouts: TimeoutsLock,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutsLock {
    pub icmp_secs: u64,
    pub tcp_established_secs: u64,
    pub tcp_transitory_secs: u64,
    pub tcp_empty_grace_ms: u64,
}

impl NatSettings {
    pub fn from_config(config: &Config) -> Self {
        let nat = &config.nat;
        let timeouts = &nat.timeouts;

        NatSettings {
            generated_at: chrono::Utc::now().to_rfc3339(),
            internal_interface: nat
                .internal_interface
                .clone()
                .unwrap_or_else(|| DEFAULT_INTERNAL_INTERFACE.to_string()),
            ports: nat.ports.map(|r| (r.min, r.max)).unwrap_or(DEFAULT_RANGE),
            icmp_ids: nat.icmp_ids.map(|r| (r.min, r.max)).unwrap_or(DEFAULT_RANGE),
            reaper_tick_ms: config.reaper.tick_ms.unwrap_or(DEFAULT_REAPER_TICK_MS),
            timeouts: TimeoutsLock {
                icmp_secs: timeouts.icmp.unwrap_or(DEFAULT_ICMP_TIMEOUT_SECS),
                tcp_established_secs: timeouts
                    .tcp_established
                    .unwrap_or(DEFAULT_TCP_ESTABLISHED_SECS),
                tcp_transitory_secs: timeouts
                    .tcp_transitory
                    .unwrap_or(DEFAULT_TCP_TRANSITORY_SECS),
                tcp_empty_grace_ms: timeouts
                    .tcp_empty_grace_ms
                    .unwrap_or(DEFAULT_TCP_EMPTY_GRACE_MS),
            },
            logging: config.logging.clone(),
        }
    }

    /// Table construction parameters
    pub fn napt_config(&self) -> NaptConfig {
        NaptConfig {
            timeouts: NatTimeouts {
                icmp: Duration::from_secs(self.timeouts.icmp_secs),
                tcp_established: Duration::from_secs(self.timeouts.tcp_established_secs),
                tcp_transitory: Duration::from_secs(self.timeouts.tcp_transitory_secs),
                tcp_empty_grace: Duration::from_millis(self.timeouts.tcp_empty_grace_ms),
            },
            port_range: self.ports,
            icmp_id_range: self.icmp_ids,
            internal_interface: self.internal_interface.clone(),
        }
    }

    pub fn reaper_tick(&self) -> Duration {
        Duration::from_millis(self.reaper_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_table_defaults() {
        let settings = NatSettings::from_config(&Config::default());
        assert_eq!(settings.napt_config(), NaptConfig::default());
        assert_eq!(settings.reaper_tick(), Duration::from_secs(1));
    }

    #[test]
    fn test_overrides() {
        let config: Config = toml::from_str(
            r#"
            [nat]
            internal_interface = "lan0"

            [nat.timeouts]
            icmp = 30
            tcp_empty_grace_ms = 2000

            [nat.ports]
            min = 20000
            max = 20999

            [reaper]
            tick_ms = 250
            "#,
        )
        .unwrap();

        let settings = NatSettings::from_config(&config);
        let napt = settings.napt_config();
        assert_eq!(napt.internal_interface, "lan0");
        assert_eq!(napt.timeouts.icmp, Duration::from_secs(30));
        assert_eq!(napt.timeouts.tcp_empty_grace, Duration::from_secs(2));
        assert_eq!(
            napt.timeouts.tcp_transitory,
            Duration::from_secs(DEFAULT_TCP_TRANSITORY_SECS)
        );
        assert_eq!(napt.port_range, (20000, 20999));
        assert_eq!(napt.icmp_id_range, DEFAULT_RANGE);
        assert_eq!(settings.reaper_tick(), Duration::from_millis(250));
    }

    #[test]
    fn test_settings_roundtrip_through_toml() {
        let settings = NatSettings::from_config(&Config::default());
        let text = toml::to_string_pretty(&settings).unwrap();
        let parsed: NatSettings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }
}
