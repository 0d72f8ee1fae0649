//! `NodeConfig` loading: a TOML file layered with `VALIDATOR__`-prefixed
//! environment variable overrides, via the `config` crate (already a
//! dependency of the teacher workspace this repo is grounded on).

use validator_types::NodeConfig;

/// Failure to locate, parse, or deserialize the node configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The underlying `config` crate rejected the layered sources.
    #[error("failed to load node configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Loads a [`NodeConfig`] from `path` (extension-less; `config` infers the
/// format — TOML, YAML, JSON — from whichever file matching `path.*`
/// exists), with any `VALIDATOR__FIELD` environment variable overriding the
/// matching top-level field (`__` as the nesting separator, so e.g.
/// `VALIDATOR__LOG_FILTER=debug` overrides `log_filter`).
pub fn load_config(path: &str) -> Result<NodeConfig, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("VALIDATOR").separator("__"))
        .build()?;
    Ok(settings.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_minimal_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
            database_path = ":memory:"
            log_filter = "info"
            chains = []
            "#
        )
        .unwrap();

        let config = load_config(path.with_extension("").to_str().unwrap()).unwrap();
        assert_eq!(config.database_path, ":memory:");
        assert_eq!(config.log_filter, "info");
        assert!(config.chains.is_empty());
    }

    #[test]
    fn environment_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
            database_path = ":memory:"
            log_filter = "info"
            chains = []
            "#
        )
        .unwrap();

        std::env::set_var("VALIDATOR__LOG_FILTER", "debug");
        let config = load_config(path.with_extension("").to_str().unwrap()).unwrap();
        std::env::remove_var("VALIDATOR__LOG_FILTER");
        assert_eq!(config.log_filter, "debug");
    }
}
