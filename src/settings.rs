//! Platform-specific default locations.

use std::path::PathBuf;

use directories::ProjectDirs;

/// File name of the persisted token cache.
const TOKEN_CACHE_FILE: &str = "token_cache.json";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "azauth")
}

/// Default token cache file inside the user's data directory.
pub fn default_cache_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_local_dir().join(TOKEN_CACHE_FILE))
}
