use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{self, ENGINE_BINARY};

pub trait Installer: Send + Sync {
    /// Path of a runnable engine binary, or why there is none.
    fn ensure_binary_present(&self) -> anyhow::Result<PathBuf>;
}

/// Finds an engine already on disk: `<app dir>/bin/` first, then `$PATH`.
pub struct LocalBinary {
    bin_dir: PathBuf,
    search_path: bool,
}

impl LocalBinary {
    #[must_use]
    pub fn new(app_dir: &Path) -> Self {
        Self {
            bin_dir: config::bin_dir(app_dir),
            search_path: true,
        }
    }

    /// Only look in the app's own `bin/` directory.
    #[must_use]
    pub fn bundled_only(mut self) -> Self {
        self.search_path = false;
        self
    }
}

impl Installer for LocalBinary {
    fn ensure_binary_present(&self) -> anyhow::Result<PathBuf> {
        let bundled = self.bin_dir.join(ENGINE_BINARY);
        if is_executable(&bundled) {
            debug!(path = %bundled.display(), "engine_binary_bundled");
            return Ok(bundled);
        }

        if self.search_path {
            if let Some(found) = find_in_path(ENGINE_BINARY) {
                debug!(path = %found.display(), "engine_binary_from_path");
                return Ok(found);
            }
        }

        anyhow::bail!(
            "{} not found in {} or PATH; place the engine binary there",
            ENGINE_BINARY,
            self.bin_dir.display()
        )
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
