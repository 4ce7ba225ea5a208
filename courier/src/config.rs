//! Process configuration
//!
//! The configuration file is located using the following precedence:
//! 1. `COURIER_CONFIG` environment variable
//! 2. `./courier.config.ron` (current working directory)
//! 3. `/etc/courier/courier.config.ron` (system-wide config)

use std::path::{Path, PathBuf};

use courier_dispatch::{DispatchConfig, DispatchError};
use courier_metrics::{MetricsConfig, MetricsError};
use ron::extensions::Extensions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_ENV: &str = "COURIER_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("COURIER_CONFIG points to non-existent file: {0}")]
    MissingEnvPath(PathBuf),

    #[error("No configuration file found. Tried:\n  - COURIER_CONFIG environment variable\n{0}")]
    NotFound(String),

    #[error("Failed to read config from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Top level `courier.config.ron`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl CourierConfig {
    /// Parse a configuration document without validating it
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if `content` is not a valid document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(ron::Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME | Extensions::UNWRAP_VARIANT_NEWTYPES)
            .from_str(content)?)
    }

    /// Read, parse and validate the file at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns the first invalid section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatch.validate()?;
        self.metrics.validate()?;
        Ok(())
    }
}

/// Locate the configuration file, honouring an explicit path first
///
/// # Errors
///
/// Returns an error if the environment variable names a missing file or no
/// default location holds one.
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    locate(
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        &[
            PathBuf::from("./courier.config.ron"),
            PathBuf::from("/etc/courier/courier.config.ron"),
        ],
    )
}

fn locate(env_path: Option<PathBuf>, defaults: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    if let Some(path) = env_path {
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::MissingEnvPath(path));
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::NotFound(paths_tried))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use courier_dispatch::{StoreConfig, TransportKind};
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"
(
    dispatch: (
        providers: [
            (
                name: "primary",
                transport: HttpApi(endpoint: "https://api.example.com/v1/send", api_key: "secret"),
                rate_limits: (per_second: 10, per_minute: 500),
            ),
            (
                name: "relay",
                transport: Smtp(host: "smtp.example.net", port: 587),
                priority_tier: 2,
            ),
        ],
        rate_limit_store: Memory,
    ),
    metrics: (
        tick_interval_secs: 15,
    ),
)
"#;

    #[test]
    fn test_parse_sample() {
        let config = CourierConfig::parse(SAMPLE).unwrap();
        config.validate().unwrap();

        let providers = &config.dispatch.providers;
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].transport.kind(), TransportKind::HttpApi);
        assert_eq!(providers[1].transport.kind(), TransportKind::Smtp);
        assert_eq!(providers[1].priority_tier, 2);
        assert!(matches!(config.dispatch.rate_limit_store, StoreConfig::Memory));
        assert_eq!(config.metrics.tick_interval_secs, 15);
    }

    #[test]
    fn test_bundled_config_is_valid() {
        let config = CourierConfig::parse(include_str!("../../courier.config.ron")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.dispatch.providers.len(), 3);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = CourierConfig::parse("()").unwrap();
        config.validate().unwrap();
        assert!(config.dispatch.providers.is_empty());
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_invalid_section_rejected() {
        let config = CourierConfig::parse("(metrics: (tick_interval_secs: 0))").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Metrics(_))));

        let config = CourierConfig::parse(
            r#"(dispatch: (providers: [
                (name: "a", transport: Smtp(host: "mx.example.com")),
                (name: "a", transport: Smtp(host: "mx.example.com")),
            ]))"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Dispatch(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = CourierConfig::load(file.path()).unwrap();
        assert_eq!(config.dispatch.providers[0].name, "primary");

        let missing = CourierConfig::load(Path::new("/nonexistent/courier.config.ron"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        assert!(matches!(
            CourierConfig::parse("(dispatch: [)"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_locate_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("env.ron");
        let local = dir.path().join("local.ron");
        let system = dir.path().join("system.ron");
        std::fs::write(&env_file, "()").unwrap();
        std::fs::write(&system, "()").unwrap();

        let defaults = [local.clone(), system.clone()];

        assert_eq!(locate(Some(env_file.clone()), &defaults).unwrap(), env_file);
        assert_eq!(locate(None, &defaults).unwrap(), system);

        std::fs::write(&local, "()").unwrap();
        assert_eq!(locate(None, &defaults).unwrap(), local);

        assert!(matches!(
            locate(Some(dir.path().join("absent.ron")), &defaults),
            Err(ConfigError::MissingEnvPath(_))
        ));
    }

    #[test]
    fn test_nothing_found_lists_paths() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = [dir.path().join("a.ron"), dir.path().join("b.ron")];

        let error = locate(None, &defaults).unwrap_err();
        let message = error.to_string();
        assert!(message.contains(CONFIG_ENV));
        assert!(message.contains("a.ron"));
        assert!(message.contains("b.ron"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = Path::new("/somewhere/else.ron");
        assert_eq!(find_config_file(Some(path)).unwrap(), path);
    }
}
