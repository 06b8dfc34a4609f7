use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::warn;
use obj_lib::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const DEFAULT_CACHE_EXPIRY_DAYS: u32 = 90;
pub const DEFAULT_CACHE_MAX_USE_PERCENT: u64 = 80;

/// Cache layer configuration.
///
/// `drives` is an ordered list of local directories; slot order is stable
/// and defines the router's hash positions. `exclude` holds `*`-wildcard
/// patterns matched against `bucket/object`. `expiry` is the default
/// lifetime in days for entries lacking explicit cache directives and
/// `max_use` the disk usage percentage that triggers purging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub drives: Vec<PathBuf>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_expiry")]
    pub expiry: u32,
    #[serde(default = "default_max_use")]
    pub max_use: u64,
}

fn default_expiry() -> u32 {
    DEFAULT_CACHE_EXPIRY_DAYS
}

fn default_max_use() -> u64 {
    DEFAULT_CACHE_MAX_USE_PERCENT
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            drives: Vec::new(),
            exclude: Vec::new(),
            expiry: DEFAULT_CACHE_EXPIRY_DAYS,
            max_use: DEFAULT_CACHE_MAX_USE_PERCENT,
        }
    }
}

impl CacheConfig {
    pub async fn load(path: &Path) -> CacheResult<Self> {
        let config_str = fs::read_to_string(path).await.map_err(|e| {
            warn!("CacheConfig: read {} failed! {}", path.display(), e);
            CacheError::NotFound(format!("cache config not found: {}", path.display()))
        })?;
        let config = serde_json::from_str::<CacheConfig>(&config_str).map_err(|e| {
            warn!("CacheConfig: parse {} failed! {}", path.display(), e);
            CacheError::InvalidParam(format!("cache config invalid: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.drives.is_empty() {
            return Err(CacheError::InvalidParam(
                "cache config needs at least one drive".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for dir in &self.drives {
            if !seen.insert(dir) {
                return Err(CacheError::InvalidParam(format!(
                    "duplicate cache drive: {}",
                    dir.display()
                )));
            }
        }
        if self.max_use == 0 || self.max_use > 100 {
            return Err(CacheError::InvalidParam(format!(
                "max_use must be within 1..=100, got {}",
                self.max_use
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate() {
        let mut config = CacheConfig {
            drives: vec![PathBuf::from("/tmp/cache0"), PathBuf::from("/tmp/cache1")],
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.max_use = 0;
        assert!(config.validate().is_err());
        config.max_use = 101;
        assert!(config.validate().is_err());
        config.max_use = 80;

        config.drives.push(PathBuf::from("/tmp/cache0"));
        assert!(config.validate().is_err());

        config.drives.clear();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let config = CacheConfig {
            drives: vec![temp_dir.path().join("cache0")],
            exclude: vec!["logs/*".to_string()],
            expiry: 30,
            max_use: 70,
        };
        let path = temp_dir.path().join("cache.json");
        tokio::fs::write(&path, serde_json::to_string(&config).unwrap())
            .await
            .unwrap();

        let loaded = CacheConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_applies_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        tokio::fs::write(&path, r#"{"drives": ["/tmp/cache0"]}"#)
            .await
            .unwrap();

        let loaded = CacheConfig::load(&path).await.unwrap();
        assert_eq!(loaded.expiry, DEFAULT_CACHE_EXPIRY_DAYS);
        assert_eq!(loaded.max_use, DEFAULT_CACHE_MAX_USE_PERCENT);
        assert!(loaded.exclude.is_empty());
    }
}
