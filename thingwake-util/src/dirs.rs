use std::path::PathBuf;

/// Where the thing config and credentials live, `~/.config/thingwake` on Linux
pub fn config_dir() -> PathBuf {
    app_dir(dirs::config_dir(), ".config")
}

/// Where the wake state lives, `~/.local/state/thingwake` on Linux.
///
/// It must be on storage that survives the device being powered down
/// between wakes.
pub fn state_dir() -> PathBuf {
    app_dir(dirs::state_dir(), ".local/state")
}

// Falls back to a directory under home, or the working directory, when the
// platform has no convention
fn app_dir(platform_dir: Option<PathBuf>, under_home: &str) -> PathBuf {
    platform_dir
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(under_home)
        })
        .join(env!("THINGWAKE_PKG_NAME"))
}
