use std::path::{Component, Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathGuardError {
    #[error("path {path:?} escapes configured home {home:?}")]
    PathEscapesHome { home: PathBuf, path: PathBuf },
}

/// The two directories persisted state may live under.
#[derive(Debug, Clone)]
pub struct Homes {
    pub config: PathBuf,
    pub state: PathBuf,
}

impl Homes {
    /// Resolve homes from `STELAE_CONFIG_HOME` / `STELAE_STATE_HOME`,
    /// falling back to the platform config dir and `<config>/.state`.
    pub fn from_env() -> Self {
        let config = match env_path("STELAE_CONFIG_HOME") {
            Some(p) => p,
            None => default_config_home(),
        };
        let state = match env_path("STELAE_STATE_HOME") {
            Some(p) => p,
            None => config.join(".state"),
        };
        Self { config, state }
    }

    pub fn new(config: impl Into<PathBuf>, state: impl Into<PathBuf>) -> Self {
        Self {
            config: config.into(),
            state: state.into(),
        }
    }

    /// Accept `target` iff it resolves under the config home or the state
    /// home; returns the absolute path.
    pub fn resolve_guarded(&self, target: impl AsRef<Path>) -> Result<PathBuf, PathGuardError> {
        let target = target.as_ref();
        match require_home_path(&self.config, target) {
            Ok(resolved) => Ok(resolved),
            Err(_) => require_home_path(&self.state, target),
        }
    }

    /// Guard `target` against both homes, then create its parent directories.
    pub fn mkdir_all_under(&self, target: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let resolved = self.resolve_guarded(target)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(resolved)
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(lexical_clean(Path::new(trimmed)))
}

fn default_config_home() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", "stelae") {
        return dirs.config_dir().to_path_buf();
    }
    let home = std::env::var("HOME").unwrap_or_default();
    Path::new(&home).join(".config").join("stelae")
}

/// Accept `target` iff, expressed relative to `home`, it does not begin with
/// a parent-directory traversal. Both sides are absolutized lexically (no
/// filesystem access) so the guard also covers paths that do not exist yet.
pub fn require_home_path(home: &Path, target: &Path) -> Result<PathBuf, PathGuardError> {
    let abs_home = lexical_absolute(home);
    let abs_target = lexical_absolute(target);
    if abs_target.starts_with(&abs_home) {
        Ok(abs_target)
    } else {
        Err(PathGuardError::PathEscapesHome {
            home: abs_home,
            path: abs_target,
        })
    }
}

fn lexical_absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    lexical_clean(&joined)
}

/// Normalize `.` and `..` segments without touching the filesystem.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when the env var holds a truthy flag value.
pub fn env_enabled(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Integer env var with a fallback on absence or parse failure.
pub fn env_int(key: &str, fallback: i64) -> i64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_paths_inside_home() {
        let home = Path::new("/tmp/stelae-home");
        let got = require_home_path(home, Path::new("/tmp/stelae-home/state/status.json"))
            .expect("inside home");
        assert_eq!(got, PathBuf::from("/tmp/stelae-home/state/status.json"));
    }

    #[test]
    fn rejects_parent_traversal() {
        let home = Path::new("/tmp/stelae-home");
        let err = require_home_path(home, Path::new("/tmp/stelae-home/../etc/passwd"))
            .expect_err("escape");
        assert!(matches!(err, PathGuardError::PathEscapesHome { .. }));
    }

    #[test]
    fn rejects_unrelated_absolute_path() {
        let home = Path::new("/tmp/stelae-home");
        assert!(require_home_path(home, Path::new("/var/tmp/other.json")).is_err());
    }

    #[test]
    fn resolve_guarded_falls_back_to_state_home() {
        let homes = Homes::new("/tmp/stelae-cfg", "/tmp/stelae-state");
        let got = homes
            .resolve_guarded("/tmp/stelae-state/snapshots/catalog.json")
            .expect("state home");
        assert!(got.starts_with("/tmp/stelae-state"));
        assert!(homes.resolve_guarded("/tmp/elsewhere/x.json").is_err());
    }

    #[test]
    fn lexical_clean_normalizes_dots() {
        assert_eq!(
            lexical_clean(Path::new("/a/b/./../c")),
            PathBuf::from("/a/c")
        );
    }
}
