//! Cross-platform directory path resolution
//!
//! - Linux/macOS: XDG Base Directory layout (~/.config, ~/.local/share)
//! - Windows: Known Folder API (AppData\Roaming, AppData\Local)

use std::path::{Path, PathBuf};

const APP_NAME: &str = "kubesync";

#[derive(Clone, Copy)]
enum Base {
    Config,
    Data,
}

impl Base {
    fn override_var(self) -> &'static str {
        match self {
            Base::Config => "KUBESYNC_CONFIG_DIR",
            Base::Data => "KUBESYNC_DATA_DIR",
        }
    }

    #[cfg(not(windows))]
    fn xdg(self) -> (&'static str, &'static [&'static str]) {
        match self {
            Base::Config => ("XDG_CONFIG_HOME", &[".config"]),
            Base::Data => ("XDG_DATA_HOME", &[".local", "share"]),
        }
    }

    /// Resolve the directory: explicit override first, then the platform default.
    fn resolve(self) -> PathBuf {
        if let Ok(dir) = std::env::var(self.override_var()) {
            return PathBuf::from(dir);
        }
        self.platform_default()
    }

    #[cfg(windows)]
    fn platform_default(self) -> PathBuf {
        directories::ProjectDirs::from("", "", APP_NAME)
            .map(|dirs| match self {
                Base::Config => dirs.config_dir().to_path_buf(),
                Base::Data => dirs.data_dir().to_path_buf(),
            })
            .unwrap_or_else(|| PathBuf::from(".").join(APP_NAME))
    }

    #[cfg(not(windows))]
    fn platform_default(self) -> PathBuf {
        let (var, relative) = self.xdg();
        let base = std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
            let home = directories::BaseDirs::new()
                .map(|dirs| dirs.home_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            relative.iter().fold(home, |path, part| path.join(part))
        });
        base.join(APP_NAME)
    }
}

/// Configuration directory. `KUBESYNC_CONFIG_DIR` wins over
/// `$XDG_CONFIG_HOME/kubesync` (Unix) or `%APPDATA%\kubesync\config` (Windows).
pub fn config_dir() -> PathBuf {
    Base::Config.resolve()
}

/// Data directory for state and git mirrors. `KUBESYNC_DATA_DIR` wins over
/// `$XDG_DATA_HOME/kubesync` (Unix) or `%LOCALAPPDATA%\kubesync\data` (Windows).
pub fn data_dir() -> PathBuf {
    Base::Data.resolve()
}

pub fn root_config_path() -> PathBuf {
    config_dir().join("config.yaml")
}

/// Default state directory (applications, status, history)
pub fn default_state_dir() -> PathBuf {
    data_dir().join("state")
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
