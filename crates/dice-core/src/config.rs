//! Standard paths and run configuration.
//!
//! Directory resolution follows the XDG base-directory convention: an
//! explicit value wins, then the `XDG_*` environment variable, then the
//! `$HOME` default, each joined with the application name (`DICE_APPNAME`,
//! default `dice`). The flag value `-` means "unset, use the next fallback";
//! `.` means the current directory.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Project, Study};

/// Environment variable overriding the application name.
pub const APPNAME_ENV: &str = "DICE_APPNAME";

/// Default application name used in directory paths.
pub const DEFAULT_APPNAME: &str = "dice";

/// Marker file or directory identifying a project root.
pub const PROJECT_MARKER: &str = ".dice";

/// Flag value meaning "unset, use the next fallback".
pub const UNSET: &str = "-";

fn is_set(value: &str) -> bool {
    !value.is_empty() && value != UNSET
}

/// Resolved base directories for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardPaths {
    pub app_name: String,
    pub config_home: PathBuf,
    pub state_home: PathBuf,
    pub data_home: PathBuf,
}

/// Raw path overrides, typically from CLI flags or a config file. Values of
/// `-` (or empty) fall through to the environment and defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOverrides {
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub config_home: String,
    #[serde(default)]
    pub state_home: String,
    #[serde(default)]
    pub data_home: String,
}

impl StandardPaths {
    /// Resolves paths from overrides, environment, and `$HOME` defaults.
    #[must_use]
    pub fn resolve(overrides: &PathOverrides) -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let app_name = if is_set(&overrides.app_name) {
            overrides.app_name.clone()
        } else {
            env::var(APPNAME_ENV)
                .ok()
                .filter(|v| is_set(v))
                .unwrap_or_else(|| DEFAULT_APPNAME.to_string())
        };

        let bind = |value: &str, env_name: &str, default: PathBuf| -> PathBuf {
            if value == "." {
                return PathBuf::from(".");
            }
            if is_set(value) {
                return PathBuf::from(value);
            }
            if let Some(v) = env::var(env_name).ok().filter(|v| is_set(v)) {
                return Path::new(&v).join(&app_name);
            }
            default.join(&app_name)
        };

        Self {
            config_home: bind(
                &overrides.config_home,
                "XDG_CONFIG_HOME",
                Path::new(&home).join(".config"),
            ),
            state_home: bind(
                &overrides.state_home,
                "XDG_STATE_HOME",
                Path::new(&home).join(".local/state"),
            ),
            data_home: bind(
                &overrides.data_home,
                "XDG_DATA_HOME",
                Path::new(&home).join(".local/share"),
            ),
            app_name,
        }
    }

    /// Creates the standard directories.
    pub fn init(&self) -> Result<()> {
        for dir in [&self.config_home, &self.state_home, &self.data_home] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// One run's configuration: resolved paths plus the optional project and
/// study the operator selected.
#[derive(Debug, Clone)]
pub struct Config {
    pub paths: StandardPaths,
    pub project: Option<Project>,
    pub study: Option<Study>,
}

impl Config {
    #[must_use]
    pub fn new(paths: StandardPaths) -> Self {
        Self {
            paths,
            project: None,
            study: None,
        }
    }

    /// Where signatures, modules, and the databases live.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.paths.data_home
    }

    /// `.dice` signature files.
    #[must_use]
    pub fn signatures_dir(&self) -> PathBuf {
        self.paths.data_home.join("signatures")
    }

    /// Plugin executables, one subdirectory per component kind.
    #[must_use]
    pub fn modules_dir(&self) -> PathBuf {
        self.paths.data_home.join("modules")
    }

    /// Where the current run reads source files and writes output:
    /// the study path, else the project path, else the data dir.
    #[must_use]
    pub fn workspace(&self) -> PathBuf {
        if let Some(study) = &self.study {
            return PathBuf::from(&study.path);
        }
        if let Some(project) = &self.project {
            return PathBuf::from(&project.path);
        }
        self.paths.data_home.clone()
    }

    /// Per-run scratch directory for plugin sockets.
    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        self.paths.state_home.join("run")
    }
}

/// Walks up from `start` looking for the [`PROJECT_MARKER`].
#[must_use]
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut current = start;
    loop {
        if current.join(PROJECT_MARKER).exists() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment-dependent assertions stick to overrides the tests control;
    // process-global env vars are left alone.

    #[test]
    fn test_explicit_value_wins() {
        let paths = StandardPaths::resolve(&PathOverrides {
            app_name: "probe".to_string(),
            config_home: "/etc/probe".to_string(),
            state_home: "/var/lib/probe".to_string(),
            data_home: "/srv/probe".to_string(),
        });
        assert_eq!(paths.app_name, "probe");
        assert_eq!(paths.config_home, PathBuf::from("/etc/probe"));
        assert_eq!(paths.state_home, PathBuf::from("/var/lib/probe"));
        assert_eq!(paths.data_home, PathBuf::from("/srv/probe"));
    }

    #[test]
    fn test_dot_means_current_directory() {
        let paths = StandardPaths::resolve(&PathOverrides {
            data_home: ".".to_string(),
            ..PathOverrides::default()
        });
        assert_eq!(paths.data_home, PathBuf::from("."));
    }

    #[test]
    fn test_unset_falls_through() {
        let explicit = StandardPaths::resolve(&PathOverrides {
            data_home: "/srv/dice".to_string(),
            ..PathOverrides::default()
        });
        let fallthrough = StandardPaths::resolve(&PathOverrides {
            data_home: UNSET.to_string(),
            ..PathOverrides::default()
        });
        assert_eq!(explicit.data_home, PathBuf::from("/srv/dice"));
        // `-` resolves the same as leaving the override empty.
        let empty = StandardPaths::resolve(&PathOverrides::default());
        assert_eq!(fallthrough.data_home, empty.data_home);
    }

    #[test]
    fn test_config_directories() {
        let paths = StandardPaths::resolve(&PathOverrides {
            data_home: "/srv/dice".to_string(),
            state_home: "/var/lib/dice".to_string(),
            ..PathOverrides::default()
        });
        let config = Config::new(paths);
        assert_eq!(config.signatures_dir(), PathBuf::from("/srv/dice/signatures"));
        assert_eq!(config.modules_dir(), PathBuf::from("/srv/dice/modules"));
        assert_eq!(config.workspace(), PathBuf::from("/srv/dice"));
        assert_eq!(config.runtime_dir(), PathBuf::from("/var/lib/dice/run"));
    }

    #[test]
    fn test_workspace_prefers_study() {
        let paths = StandardPaths::resolve(&PathOverrides {
            data_home: "/srv/dice".to_string(),
            ..PathOverrides::default()
        });
        let mut config = Config::new(paths);
        config.project = Some(Project {
            id: crate::model::Id(1),
            name: "coin".to_string(),
            path: "/home/op/coin".to_string(),
        });
        assert_eq!(config.workspace(), PathBuf::from("/home/op/coin"));

        config.study = Some(Study {
            id: crate::model::Id(2),
            project_id: crate::model::Id(1),
            name: "sweep-1".to_string(),
            path: "/home/op/coin/sweep-1".to_string(),
        });
        assert_eq!(config.workspace(), PathBuf::from("/home/op/coin/sweep-1"));
    }

    #[test]
    fn test_find_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_root(&nested), None);

        fs::write(dir.path().join(PROJECT_MARKER), "").unwrap();
        assert_eq!(find_project_root(&nested), Some(dir.path().to_path_buf()));
    }
}
