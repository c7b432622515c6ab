use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Default bucket name. Bumping it is what invalidates caches across deploys.
pub const DEFAULT_CACHE_NAME: &str = "monitor-iot-v1.0.0";

/// URLs seeded into the bucket at install time.
pub const DEFAULT_PRECACHE: &[&str] = &[
  "/",
  "/index.html",
  "https://cdn.jsdelivr.net/npm/chart.js@4.4.0/dist/chart.umd.min.js",
  "https://esm.sh/@supabase/supabase-js@2.45.0",
];

/// URL substrings that mark a response as a static asset worth caching.
pub const DEFAULT_CACHE_PATTERNS: &[&str] = &[".html", ".js", ".css", "icons/"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Bucket name, `<prefix>-v<semver>`
  pub cache_name: String,
  /// Base URL relative seed and fallback URLs resolve against
  pub origin: String,
  pub precache: Vec<String>,
  pub cache_patterns: Vec<String>,
  /// Document served to offline navigations that miss the cache
  pub fallback_document: String,
  pub storage: StorageConfig,
  pub network: NetworkConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite database path (defaults to $XDG_DATA_HOME/monitor-sw/cache.db)
  pub path: Option<PathBuf>,
  /// Keep buckets in memory only
  pub ephemeral: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cache_name: DEFAULT_CACHE_NAME.to_string(),
      origin: "http://localhost:8000/".to_string(),
      precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
      cache_patterns: DEFAULT_CACHE_PATTERNS
        .iter()
        .map(|s| s.to_string())
        .collect(),
      fallback_document: "/index.html".to_string(),
      storage: StorageConfig::default(),
      network: NetworkConfig::default(),
      log: LogConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./monitor-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/monitor-sw/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("monitor-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("monitor-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Check the cache name follows `<prefix>-v<semver>` and the lists are
  /// usable.
  pub fn validate(&self) -> Result<()> {
    // Both the prefix and a prerelease tag may contain "-v".
    let mut prefix = None;
    let mut version_error = None;
    for (at, _) in self.cache_name.match_indices("-v") {
      match semver::Version::parse(&self.cache_name[at + 2..]) {
        Ok(_) => {
          prefix = Some(&self.cache_name[..at]);
          break;
        }
        Err(e) => version_error = Some(e),
      }
    }
    let prefix = match (prefix, version_error) {
      (Some(prefix), _) => prefix,
      (None, Some(e)) => {
        return Err(eyre!(
          "Cache name '{}' does not end in a semantic version: {}",
          self.cache_name,
          e
        ))
      }
      (None, None) => {
        return Err(eyre!(
          "Cache name '{}' must look like <name>-v<semver>",
          self.cache_name
        ))
      }
    };
    if prefix.is_empty() {
      return Err(eyre!("Cache name '{}' has an empty prefix", self.cache_name));
    }

    if self.cache_patterns.iter().any(|p| p.is_empty()) {
      return Err(eyre!("Cache patterns must not be empty strings"));
    }

    self.origin_url()?;
    self.precache_urls()?;
    self.fallback_url()?;
    Ok(())
  }

  /// Seed list resolved against the origin.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    self.precache.iter().map(|u| self.resolve(u)).collect()
  }

  pub fn fallback_url(&self) -> Result<Url> {
    self.resolve(&self.fallback_document)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve an absolute or origin-relative URL.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.network.timeout_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.cache_name, "monitor-iot-v1.0.0");
    assert_eq!(config.precache.len(), 4);
    assert_eq!(config.timeout(), Duration::from_secs(30));
  }

  #[test]
  fn test_precache_urls_resolve_against_origin() {
    let config = Config::default();
    let urls = config.precache_urls().unwrap();
    assert_eq!(urls[0].as_str(), "http://localhost:8000/");
    assert_eq!(urls[1].as_str(), "http://localhost:8000/index.html");
    assert_eq!(
      urls[2].as_str(),
      "https://cdn.jsdelivr.net/npm/chart.js@4.4.0/dist/chart.umd.min.js"
    );
    assert_eq!(
      config.fallback_url().unwrap().as_str(),
      "http://localhost:8000/index.html"
    );
  }

  #[test]
  fn test_cache_name_must_end_in_semver() {
    let mut config = Config::default();

    config.cache_name = "monitor-iot-v2.1.0-beta.1".to_string();
    assert!(config.validate().is_ok());

    config.cache_name = "monitor-iot".to_string();
    assert!(config.validate().is_err());

    config.cache_name = "monitor-iot-vlatest".to_string();
    assert!(config.validate().is_err());

    config.cache_name = "-v1.0.0".to_string();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_cache_name_with_v_in_prerelease_or_prefix() {
    let mut config = Config::default();

    config.cache_name = "monitor-iot-v1.0.0-rc-v2".to_string();
    assert!(config.validate().is_ok());

    config.cache_name = "monitor-vfleet-v3.0.0".to_string();
    assert!(config.validate().is_ok());

    config.cache_name = "monitor-iot-v1.0-v2".to_string();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("does not end in a semantic version"));
  }

  #[test]
  fn test_invalid_origin_is_rejected() {
    let config = Config {
      origin: "not a url".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_empty_pattern_is_rejected() {
    let config = Config {
      cache_patterns: vec![".js".to_string(), String::new()],
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_load_partial_yaml_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "cache_name: monitor-iot-v1.1.0\norigin: https://dashboard.example.com/\nstorage:\n  ephemeral: true"
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.cache_name, "monitor-iot-v1.1.0");
    assert_eq!(config.origin, "https://dashboard.example.com/");
    assert!(config.storage.ephemeral);
    assert_eq!(config.fallback_document, "/index.html");
    assert_eq!(
      config.precache_urls().unwrap()[1].as_str(),
      "https://dashboard.example.com/index.html"
    );
  }

  #[test]
  fn test_load_missing_explicit_path_fails() {
    let err = Config::load(Some(Path::new("/nonexistent/monitor-sw.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_rejects_invalid_cache_name() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cache_name: monitor-iot").unwrap();
    assert!(Config::load(Some(file.path())).is_err());
  }
}
