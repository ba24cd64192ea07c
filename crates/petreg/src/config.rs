//! Configuration loading, environment overrides, and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::dispatcher::YearOrder;
use crate::error::{AcquireError, AcquireResult};
use crate::query::QueryShape;
use crate::regions;
use crate::types::Category;

const DEFAULT_ENTRY_PAGE: &str = "https://www.pet.gov.tw/Web/O302.aspx";
const DEFAULT_SERVICE_ENDPOINT: &str = "https://www.pet.gov.tw/Web/O302.aspx/GetStatistics";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                                  AppleWebKit/537.36 (KHTML, like Gecko) \
                                  Chrome/131.0.0.0 Safari/537.36";

/// Complete configuration for one harvest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub source: SourceConfig,
    pub start_year: i32,
    /// `None` means the current calendar year.
    pub end_year: Option<i32>,
    pub categories: Vec<Category>,
    pub order: YearOrder,
    pub pacing: DelayBounds,
    pub retry: RetrySettings,
    /// Force a session refresh every N dispatched keys. Zero disables.
    pub session_refresh_every: u32,
    pub decoy: DecoySettings,
    pub synthesis: SynthesisSettings,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            start_year: 2000,
            end_year: None,
            categories: Category::ALL.to_vec(),
            order: YearOrder::Descending,
            pacing: DelayBounds::default(),
            retry: RetrySettings::default(),
            session_refresh_every: 5,
            decoy: DecoySettings::default(),
            synthesis: SynthesisSettings::default(),
        }
    }
}

/// The fixed endpoint pair plus the entry page used for session bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub entry_page: String,
    /// Form-encoded POST target.
    pub handler_endpoint: String,
    /// JSON POST target.
    pub service_endpoint: String,
    pub query_shape: QueryShape,
    pub user_agent: String,
    pub timeout_ms: u64,
    /// Same-site pages used for decoy fetches.
    pub decoy_pages: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            entry_page: DEFAULT_ENTRY_PAGE.to_string(),
            handler_endpoint: DEFAULT_ENTRY_PAGE.to_string(),
            service_endpoint: DEFAULT_SERVICE_ENDPOINT.to_string(),
            query_shape: QueryShape::Form,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 30_000,
            decoy_pages: vec![
                "https://www.pet.gov.tw/Web/Index.aspx".to_string(),
                "https://www.pet.gov.tw/Web/O301.aspx".to_string(),
                "https://www.pet.gov.tw/Web/O303.aspx".to_string(),
            ],
        }
    }
}

/// Inclusive bounds for a randomized delay, in milliseconds.
///
/// A bound left out of a config file takes the inter-key pacing default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayBounds {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for DelayBounds {
    fn default() -> Self {
        Self {
            min_ms: 2000,
            max_ms: 5000,
        }
    }
}

impl DelayBounds {
    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoySettings {
    pub enabled: bool,
    /// Decoy fetches issued before each real query.
    pub per_key: usize,
    pub delay: DelayBounds,
}

impl Default for DecoySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            per_key: 1,
            delay: DelayBounds {
                min_ms: 500,
                max_ms: 1500,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisSettings {
    pub enabled: bool,
    pub regions: Vec<String>,
    pub seed: Option<u64>,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            regions: regions::default_region_names(),
            seed: None,
        }
    }
}

impl HarvestConfig {
    /// Load a JSON configuration file. Missing sections fall back to defaults.
    pub fn load(path: &Path) -> AcquireResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AcquireError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: HarvestConfig = serde_json::from_str(&content).map_err(|e| {
            AcquireError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve the config file (if any), load it, then apply env overrides.
    pub fn resolve(explicit: Option<&str>) -> AcquireResult<Self> {
        let config = match resolve_config_path(explicit) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env()
    }

    /// Apply `PETREG_*` environment overrides.
    pub fn apply_env(mut self) -> AcquireResult<Self> {
        if let Some(v) = env_parse::<i32>("PETREG_START_YEAR")? {
            self.start_year = v;
        }
        if let Some(v) = env_parse::<i32>("PETREG_END_YEAR")? {
            self.end_year = Some(v);
        }
        if let Some(v) = env_parse::<u32>("PETREG_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("PETREG_BASE_DELAY_MS")? {
            self.retry.base_delay_ms = v;
        }
        Ok(self)
    }

    /// End year with the current-year default applied.
    pub fn resolved_end_year(&self) -> i32 {
        self.end_year
            .unwrap_or_else(|| chrono::Local::now().year())
    }

    pub fn validate(&self) -> AcquireResult<()> {
        let end_year = self.resolved_end_year();
        if self.start_year > end_year {
            return Err(AcquireError::Config(format!(
                "start year {} is after end year {}",
                self.start_year, end_year
            )));
        }
        if !(1..=9999).contains(&self.start_year) || end_year > 9999 {
            return Err(AcquireError::Config(format!(
                "years must be within 1..=9999 (got {}..={})",
                self.start_year, end_year
            )));
        }
        if self.categories.is_empty() {
            return Err(AcquireError::Config(
                "at least one category is required".to_string(),
            ));
        }
        if self.pacing.min_ms > self.pacing.max_ms {
            return Err(AcquireError::Config(format!(
                "pacing min {}ms exceeds max {}ms",
                self.pacing.min_ms, self.pacing.max_ms
            )));
        }
        if self.decoy.delay.min_ms > self.decoy.delay.max_ms {
            return Err(AcquireError::Config(format!(
                "decoy delay min {}ms exceeds max {}ms",
                self.decoy.delay.min_ms, self.decoy.delay.max_ms
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(AcquireError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> AcquireResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AcquireError::Config(format!("{name}={raw} is not a valid value"))),
        Err(_) => Ok(None),
    }
}

/// Resolve the configuration file path.
///
/// Order: explicit path, `PETREG_CONFIG`, `./petreg.json`, `$HOME/.petreg/config.json`.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Ok(env_path) = std::env::var("PETREG_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    let cwd_config = PathBuf::from("petreg.json");
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()?;
    let home_config = PathBuf::from(home).join(".petreg").join("config.json");
    home_config.exists().then_some(home_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarvestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.categories, vec![Category::Dog, Category::Cat]);
        assert_eq!(config.order, YearOrder::Descending);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.synthesis.enabled);
        assert!(!config.decoy.enabled);
    }

    #[test]
    fn test_validate_rejects_inverted_years() {
        let config = HarvestConfig {
            start_year: 2021,
            end_year: Some(2020),
            ..HarvestConfig::default()
        };
        assert!(matches!(config.validate(), Err(AcquireError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_pacing_and_attempts() {
        let mut config = HarvestConfig::default();
        config.pacing = DelayBounds {
            min_ms: 10,
            max_ms: 5,
        };
        assert!(config.validate().is_err());

        let mut config = HarvestConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = HarvestConfig::default();
        config.categories.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("petreg.json");
        std::fs::write(
            &path,
            r#"{"start_year": 2015, "end_year": 2018, "categories": ["cat"], "retry": {"max_attempts": 5}}"#,
        )
        .unwrap();

        let config = HarvestConfig::load(&path).unwrap();
        assert_eq!(config.start_year, 2015);
        assert_eq!(config.resolved_end_year(), 2018);
        assert_eq!(config.categories, vec![Category::Cat]);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.pacing.min_ms, 2000);
    }

    #[test]
    fn test_partial_delay_bounds_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("petreg.json");
        std::fs::write(
            &path,
            r#"{"pacing": {"min_ms": 100}, "decoy": {"enabled": true, "delay": {"max_ms": 9000}}}"#,
        )
        .unwrap();

        let config = HarvestConfig::load(&path).unwrap();
        assert_eq!(config.pacing.min_ms, 100);
        assert_eq!(config.pacing.max_ms, 5000);
        assert_eq!(config.decoy.delay.min_ms, 2000);
        assert_eq!(config.decoy.delay.max_ms, 9000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            HarvestConfig::load(&path),
            Err(AcquireError::Config(_))
        ));
    }

    #[test]
    fn test_explicit_path_wins() {
        let resolved = resolve_config_path(Some("/tmp/custom.json"));
        assert_eq!(resolved, Some(PathBuf::from("/tmp/custom.json")));
    }
}
