//! Configuration loader with multi-source merging

use crate::{DossierConfig, Paths};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern.
pub struct ConfigLoader {
    case_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Creates a loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            case_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "DSR".to_string(),
        }
    }

    /// Sets the case directory holding `dossier.toml`.
    pub fn with_case_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.case_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the environment variable prefix (default: `DSR`).
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads configuration from all sources with proper precedence.
    pub fn load(self) -> Result<DossierConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = DossierConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/dossier/config.toml)
        let paths = Paths::new();
        if let Ok(user_config_file) = paths.user_config_file() {
            if user_config_file.exists() {
                builder = builder.add_source(
                    config::File::from(user_config_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // 3. Case config (dossier.toml)
        let case_config_file = Paths::project_config_file(&self.case_dir);
        if case_config_file.exists() {
            builder = builder.add_source(
                config::File::from(case_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Local overrides (dossier.local.toml, gitignored)
        let local_config_file = Paths::local_config_file(&self.case_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (DSR_*)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder.build().context("failed to merge config sources")?;
        let config: DossierConfig = merged
            .try_deserialize()
            .context("configuration did not match the expected schema")?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_defaults_from_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new()
            .with_case_dir(dir.path())
            .with_env_prefix("DSR_TEST_NONE")
            .load()
            .unwrap();
        assert_eq!(config.bus.mailbox_capacity, 1000);
    }

    #[test]
    fn case_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("dossier.toml"),
            "[bus]\nmailbox_capacity = 64\n\n[sections]\nmax_reruns = 5\n",
        )
        .unwrap();
        let config = ConfigLoader::new()
            .with_case_dir(dir.path())
            .with_env_prefix("DSR_TEST_NONE")
            .load()
            .unwrap();
        assert_eq!(config.bus.mailbox_capacity, 64);
        assert_eq!(config.sections.max_reruns, 5);
        // Untouched values keep their defaults.
        assert_eq!(config.bus.mailbox_soft_threshold, 800);
    }

    #[test]
    fn local_file_wins_over_case_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dossier.toml"), "[case]\nname = \"tracked\"\n").unwrap();
        std::fs::write(
            dir.path().join("dossier.local.toml"),
            "[case]\nname = \"local\"\n",
        )
        .unwrap();
        let config = ConfigLoader::new()
            .with_case_dir(dir.path())
            .with_env_prefix("DSR_TEST_NONE")
            .load()
            .unwrap();
        assert_eq!(config.case.name, "local");
    }
}
