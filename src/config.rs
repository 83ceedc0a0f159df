//! Configuration loading and validation.
//!
//! The daemon reads `config.yaml` from its state directory once at startup;
//! there is no hot-reload.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::countries;

/// Fallback refresh period when `refreshInterval` is absent or unparsable.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Declarative filtering policy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// CIDR networks always returned from the chain unfiltered.
    pub allow_network_list: Vec<String>,

    /// Country codes whose traffic is allowed (RETURN).
    pub country_allow_list: Vec<String>,

    /// Country codes whose traffic is dropped.
    pub country_deny_list: Vec<String>,

    /// How often country data is refreshed, e.g. "12h".
    pub refresh_interval: String,

    /// Append a terminal DROP rule to the chain.
    pub append_drop: bool,
}

impl Config {
    /// Load `config.yaml` from the state directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("config.yaml");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&content).context("failed to parse config file")?;
        Ok(config)
    }

    /// Reject configurations the daemon cannot enforce.
    pub fn validate(&self) -> Result<()> {
        countries::validate_codes(&self.country_allow_list)
            .context("countryAllowList validation failed")?;
        countries::validate_codes(&self.country_deny_list)
            .context("countryDenyList validation failed")?;

        for cidr in &self.allow_network_list {
            cidr.parse::<ipnet::Ipv4Net>().map_err(|_| {
                anyhow::anyhow!("allowNetworkList entry {:?} is not an IPv4 CIDR", cidr)
            })?;
        }
        Ok(())
    }

    /// Parsed refresh period, falling back to 12 h on invalid input.
    pub fn refresh_period(&self) -> Duration {
        match parse_interval(&self.refresh_interval) {
            Some(d) => d,
            None => {
                if !self.refresh_interval.is_empty() {
                    warn!(
                        interval = %self.refresh_interval,
                        "invalid refreshInterval, using 12h"
                    );
                }
                DEFAULT_REFRESH_INTERVAL
            }
        }
    }

    /// Every country the fetcher must track: deny list first, then allow.
    pub fn country_codes(&self) -> Vec<String> {
        let mut codes = self.country_deny_list.clone();
        codes.extend(self.country_allow_list.iter().cloned());
        codes
    }
}

/// Parse `<number><s|m|h|d>` into a duration.
fn parse_interval(interval: &str) -> Option<Duration> {
    if !interval.is_ascii() || interval.len() < 2 {
        return None;
    }
    let (num, suffix) = interval.split_at(interval.len() - 1);
    let value: u64 = num.parse().ok()?;
    let seconds = match suffix {
        "s" => value,
        "m" => value.checked_mul(60)?,
        "h" => value.checked_mul(3600)?,
        "d" => value.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let yaml = r#"
allowNetworkList: ["10.0.0.0/8", "192.168.0.0/16"]
countryAllowList: [US, DE]
countryDenyList: [RU]
refreshInterval: "6h"
appendDrop: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.allow_network_list.len(), 2);
        assert_eq!(config.country_allow_list, vec!["US", "DE"]);
        assert_eq!(config.country_deny_list, vec!["RU"]);
        assert!(config.append_drop);
        assert_eq!(config.refresh_period(), Duration::from_secs(6 * 3600));
    }

    #[test]
    fn missing_fields_default() {
        let config: Config = serde_yaml::from_str("countryAllowList: [US]").unwrap();
        assert!(config.allow_network_list.is_empty());
        assert!(config.country_deny_list.is_empty());
        assert!(!config.append_drop);
        assert_eq!(config.refresh_period(), DEFAULT_REFRESH_INTERVAL);
    }

    #[test]
    fn invalid_interval_falls_back() {
        let config = Config {
            refresh_interval: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.refresh_period(), DEFAULT_REFRESH_INTERVAL);
    }

    #[test]
    fn parse_interval_units() {
        assert_eq!(parse_interval("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_interval("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_interval("12h"), Some(Duration::from_secs(43_200)));
        assert_eq!(parse_interval("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_interval("12x"), None);
        assert_eq!(parse_interval("h"), None);
        assert_eq!(parse_interval(""), None);
    }

    #[test]
    fn validate_rejects_bad_country() {
        let config = Config {
            country_allow_list: vec!["US".to_string(), "XX".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_cidr() {
        let config = Config {
            allow_network_list: vec!["10.0.0.0/33".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            allow_network_list: vec!["not-a-net".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn country_codes_deny_before_allow() {
        let config = Config {
            country_allow_list: vec!["US".to_string()],
            country_deny_list: vec!["RU".to_string(), "KP".to_string()],
            ..Default::default()
        };
        assert_eq!(config.country_codes(), vec!["RU", "KP", "US"]);
    }
}
