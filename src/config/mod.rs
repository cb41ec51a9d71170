//! Layered configuration
//!
//! Settings merge four layers under explicit precedence:
//! 1. Built-in defaults
//! 2. Config file (`~/.config/podbuild/config.toml`, or `--config`)
//! 3. Environment (`PODBUILD_SERVER`)
//! 4. CLI flags
//!
//! The result is one explicit [`Settings`] struct threaded through every
//! operation; nothing is process-global, so tests can run scenarios
//! side by side.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Environment variable supplying the server URL when no flag is given.
pub const SERVER_URL_ENV: &str = "PODBUILD_SERVER";

/// Default cluster namespace for artifact pods.
pub const DEFAULT_NAMESPACE: &str = "podbuild";

/// Default overall wait deadline, in minutes.
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 60;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no server URL configured; pass --server-url, set {SERVER_URL_ENV}, or add server_url to the config file")]
    MissingServerUrl,

    #[error("invalid server URL {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },
}

/// On-disk configuration file shape. All keys optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub server_url: Option<String>,
    pub namespace: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub timeout_minutes: Option<u64>,
    pub expose_route: Option<bool>,
    pub allowed_source_roots: Option<Vec<PathBuf>>,
}

impl FileConfig {
    /// Parse a config file from TOML text.
    pub fn parse(path: &PathBuf, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
    }

    fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(path, &text)
    }
}

/// CLI-provided overrides, all optional.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub server_url: Option<String>,
    pub namespace: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub timeout_minutes: Option<u64>,
    pub expose_route: Option<bool>,
}

/// Effective settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub namespace: String,
    pub output_dir: PathBuf,
    pub wait_timeout: Duration,
    pub expose_route: bool,
    pub allowed_source_roots: Vec<PathBuf>,
}

impl Settings {
    /// Merge defaults, config file, environment, and CLI overrides.
    ///
    /// An explicit `--config` path must exist and parse; the default path
    /// is used only when present.
    pub fn resolve(overrides: &Overrides) -> Result<Self, ConfigError> {
        let file = match &overrides.config_path {
            Some(path) => FileConfig::load(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => FileConfig::load(&path)?,
                _ => FileConfig::default(),
            },
        };

        let env_server = std::env::var(SERVER_URL_ENV).ok().filter(|v| !v.is_empty());

        let server_url = overrides
            .server_url
            .clone()
            .or(env_server)
            .or(file.server_url)
            .unwrap_or_default();

        let timeout_minutes = overrides
            .timeout_minutes
            .or(file.timeout_minutes)
            .unwrap_or(DEFAULT_TIMEOUT_MINUTES);

        Ok(Self {
            server_url,
            namespace: overrides
                .namespace
                .clone()
                .or(file.namespace)
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            output_dir: overrides
                .output_dir
                .clone()
                .or(file.output_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            wait_timeout: Duration::from_secs(timeout_minutes * 60),
            expose_route: overrides.expose_route.or(file.expose_route).unwrap_or(false),
            allowed_source_roots: file.allowed_source_roots.unwrap_or_default(),
        })
    }

    /// Check that the settings can reach a build service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.is_empty() {
            return Err(ConfigError::MissingServerUrl);
        }
        reqwest::Url::parse(&self.server_url).map_err(|e| ConfigError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config/podbuild/config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file_or_flags() {
        let settings = Settings::resolve(&Overrides {
            server_url: Some("http://build.example.com".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(settings.namespace, DEFAULT_NAMESPACE);
        assert_eq!(settings.output_dir, PathBuf::from("."));
        assert_eq!(settings.wait_timeout, Duration::from_secs(3600));
        assert!(!settings.expose_route);
        assert!(settings.allowed_source_roots.is_empty());
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "server_url = \"http://file.example.com\"\nnamespace = \"file-ns\"\ntimeout_minutes = 5\n",
        )
        .unwrap();

        let settings = Settings::resolve(&Overrides {
            config_path: Some(path),
            namespace: Some("flag-ns".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(settings.server_url, "http://file.example.com");
        assert_eq!(settings.namespace, "flag-ns");
        assert_eq!(settings.wait_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let err = Settings::resolve(&Overrides {
            config_path: Some(PathBuf::from("/nonexistent/podbuild.toml")),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let path = PathBuf::from("inline.toml");
        let err = FileConfig::parse(&path, "serverurl = \"oops\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_requires_server_url() {
        let settings = Settings {
            server_url: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            output_dir: PathBuf::from("."),
            wait_timeout: Duration::from_secs(60),
            expose_route: false,
            allowed_source_roots: Vec::new(),
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingServerUrl)
        ));

        let settings = Settings {
            server_url: "not a url".to_string(),
            ..settings
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidServerUrl { .. })
        ));
    }
}
