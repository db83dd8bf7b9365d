//! Configuration loading with hierarchy merging.
//!
//! Sources, lowest priority first:
//!
//! 1. user config: `~/.config/devsandbox/config.toml`
//! 2. project config: `<project>/.devsandbox.toml`
//! 3. explicit `--config` file
//!
//! Missing files are fine; every setting has a default. Whatever exists
//! is merged in order and validated once at the end.

use super::error::ConfigError;
use super::schema::Config;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Loads and merges configuration files.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Explicit config file from the CLI, highest priority.
    pub extra_config: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader without an explicit extra file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and merge all present config sources.
    pub fn load(&self, home_dir: &Path, project_dir: &Path) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        let user_config = home_dir
            .join(".config")
            .join("devsandbox")
            .join("config.toml");
        let project_config = project_dir.join(".devsandbox.toml");

        for path in [Some(user_config), Some(project_config), self.extra_config.clone()]
            .into_iter()
            .flatten()
        {
            if let Some(partial) = Self::load_file(&path)? {
                debug!("Merging config from {:?}", path);
                config.merge(partial);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a single file; `None` when it does not exist.
    fn load_file(path: &Path) -> Result<Option<Config>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::filter::FilterAction;

    fn write_config(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn all_sources_missing_yields_defaults() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();

        let config = ConfigLoader::new()
            .load(home.path(), project.path())
            .unwrap();
        assert!(!config.proxy.enabled);
    }

    #[test]
    fn project_overrides_user() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();

        write_config(
            home.path(),
            ".config/devsandbox/config.toml",
            "[proxy]\nport = 19001\n",
        );
        write_config(project.path(), ".devsandbox.toml", "[proxy]\nport = 19002\n");

        let config = ConfigLoader::new()
            .load(home.path(), project.path())
            .unwrap();
        assert_eq!(config.proxy.port, 19002);
    }

    #[test]
    fn extra_config_wins() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();

        write_config(project.path(), ".devsandbox.toml", "[proxy]\nport = 19002\n");
        write_config(project.path(), "extra.toml", "[proxy]\nport = 19003\n");

        let loader = ConfigLoader {
            extra_config: Some(project.path().join("extra.toml")),
        };
        let config = loader.load(home.path(), project.path()).unwrap();
        assert_eq!(config.proxy.port, 19003);
    }

    #[test]
    fn filter_rules_survive_load() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();

        write_config(
            project.path(),
            ".devsandbox.toml",
            r#"
            [filter]
            default_action = "block"

            [[filter.rules]]
            pattern = "*.crates.io"
            action = "allow"
        "#,
        );

        let config = ConfigLoader::new()
            .load(home.path(), project.path())
            .unwrap();
        assert_eq!(config.filter.default_action, Some(FilterAction::Block));
        assert_eq!(config.filter.rules.len(), 1);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();

        write_config(project.path(), ".devsandbox.toml", "not [ valid toml");

        let result = ConfigLoader::new().load(home.path(), project.path());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn invalid_filter_rule_fails_validation() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();

        write_config(
            project.path(),
            ".devsandbox.toml",
            r#"
            [filter]
            default_action = "block"

            [[filter.rules]]
            pattern = "(unclosed"
            action = "allow"
        "#,
        );

        let result = ConfigLoader::new().load(home.path(), project.path());
        assert!(matches!(result, Err(ConfigError::Filter(_))));
    }
}
