use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Server configuration resolved from the environment. Any malformed value
/// is a fatal configuration error; the process must never partial-start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub http_bind: String,
    pub http_port: u16,
    pub mqtt: Option<MqttConfig>,
    pub kits_file: Option<String>,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub offline_after: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_cap: Duration,
    pub batch_size: usize,
    pub path_loss_exponent: f64,
    pub tx_power_dbm: f64,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}='{raw}': {e}")),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let mqtt = match env::var("MQTT_URL") {
            Ok(url) if !url.is_empty() => Some(MqttConfig {
                url,
                username: env::var("MQTT_USERNAME").ok().filter(|s| !s.is_empty()),
                password: env::var("MQTT_PASSWORD").ok().filter(|s| !s.is_empty()),
                tls: env_parse("MQTT_TLS", false)?,
            }),
            _ => None,
        };

        Ok(Self {
            database_url,
            http_bind: env::var("WD_HTTP_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
            http_port: env_parse("WD_HTTP_PORT", 8400)?,
            mqtt,
            kits_file: env::var("WD_KITS_FILE").ok().filter(|s| !s.is_empty()),
            poll_interval: Duration::from_secs(env_parse("WD_POLL_INTERVAL_SECS", 5u64)?),
            stale_after: Duration::from_secs(env_parse("WD_STALE_AFTER_SECS", 30u64)?),
            offline_after: Duration::from_secs(env_parse("WD_OFFLINE_AFTER_SECS", 120u64)?),
            request_timeout: Duration::from_secs(env_parse("WD_REQUEST_TIMEOUT_SECS", 10u64)?),
            max_retries: env_parse("WD_MAX_RETRIES", 3u32)?,
            backoff_cap: Duration::from_secs(env_parse("WD_BACKOFF_CAP_SECS", 300u64)?),
            batch_size: env_parse("WD_BATCH_SIZE", 1000usize)?,
            path_loss_exponent: env_parse("WD_PATH_LOSS_EXPONENT", 2.5f64)?,
            tx_power_dbm: env_parse("WD_TX_POWER_DBM", 0.0f64)?,
        })
    }
}

/// One entry in the YAML kit seed file. Only `kit_id` or `api_url` is
/// required; a missing id is derived from the URL host.
#[derive(Debug, Clone, Deserialize)]
pub struct KitSeed {
    pub kit_id: Option<String>,
    pub api_url: Option<String>,
    pub name: Option<String>,
    pub location: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl KitSeed {
    /// Stable id for this entry. Falls back to the URL with the scheme
    /// stripped, so two entries for the same kit URL dedupe to one row.
    pub fn resolved_id(&self) -> Option<String> {
        if let Some(id) = &self.kit_id {
            if !id.is_empty() {
                return Some(id.clone());
            }
        }
        self.api_url.as_ref().map(|url| {
            url.trim_start_matches("http://")
                .trim_start_matches("https://")
                .trim_end_matches('/')
                .replace([':', '/'], "-")
        })
    }
}

/// Load the kit seed list. A missing file is a configuration error; an
/// empty file is an empty fleet.
pub fn load_kit_seeds(path: &Path) -> Result<Vec<KitSeed>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading kit list {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let seeds: Vec<KitSeed> = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing kit list {}", path.display()))?;
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_kit_seed_file_parses() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "- kit_id: wardragon-001\n  api_url: http://10.0.0.5:8080\n  name: North gate\n- api_url: http://10.0.0.6:8080\n  enabled: false"
        )
        .unwrap();

        let seeds = load_kit_seeds(f.path()).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].resolved_id().as_deref(), Some("wardragon-001"));
        assert!(seeds[0].enabled);
        assert_eq!(seeds[1].resolved_id().as_deref(), Some("10.0.0.6-8080"));
        assert!(!seeds[1].enabled);
    }

    #[test]
    fn test_kit_seed_empty_file_is_empty_fleet() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(load_kit_seeds(f.path()).unwrap().is_empty());
    }

    #[test]
    fn test_kit_seed_malformed_is_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "kit_id: [unclosed").unwrap();
        assert!(load_kit_seeds(f.path()).is_err());
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        // SAFETY: serialised with other env-touching tests.
        unsafe {
            std::env::set_var("DATABASE_URL", "postgres://localhost/dragnet_test");
            std::env::remove_var("WD_POLL_INTERVAL_SECS");
            std::env::remove_var("MQTT_URL");
        }
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.stale_after, Duration::from_secs(30));
        assert_eq!(cfg.offline_after, Duration::from_secs(120));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.batch_size, 1000);
        assert!(cfg.mqtt.is_none());
        assert!((cfg.path_loss_exponent - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    #[serial]
    fn test_config_rejects_malformed_number() {
        unsafe {
            std::env::set_var("DATABASE_URL", "postgres://localhost/dragnet_test");
            std::env::set_var("WD_POLL_INTERVAL_SECS", "often");
        }
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("WD_POLL_INTERVAL_SECS"));
        unsafe {
            std::env::remove_var("WD_POLL_INTERVAL_SECS");
        }
    }
}
