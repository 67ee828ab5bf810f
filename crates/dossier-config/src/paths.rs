//! Path utilities and XDG directory discovery

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// XDG-compliant paths for Dossier.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("org", "Dossier", "dossier"),
        }
    }

    /// User config directory (~/.config/dossier/).
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::XdgError("Failed to determine user config directory".to_string())
            })
    }

    /// User config file (~/.config/dossier/config.toml).
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    /// Project config file (dossier.toml).
    pub fn project_config_file(case_dir: impl AsRef<Path>) -> PathBuf {
        case_dir.as_ref().join("dossier.toml")
    }

    /// Local override file (dossier.local.toml, gitignored).
    pub fn local_config_file(case_dir: impl AsRef<Path>) -> PathBuf {
        case_dir.as_ref().join("dossier.local.toml")
    }

    /// Per-case state directory (.dossier/), home of the manifest and
    /// fault vault unless configuration points elsewhere.
    pub fn state_dir(case_dir: impl AsRef<Path>) -> PathBuf {
        case_dir.as_ref().join(".dossier")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_files_sit_in_case_dir() {
        let dir = Path::new("/tmp/case-0042");
        assert_eq!(
            Paths::project_config_file(dir),
            PathBuf::from("/tmp/case-0042/dossier.toml")
        );
        assert_eq!(
            Paths::local_config_file(dir),
            PathBuf::from("/tmp/case-0042/dossier.local.toml")
        );
        assert_eq!(Paths::state_dir(dir), PathBuf::from("/tmp/case-0042/.dossier"));
    }
}
