use std::{env, path::PathBuf};

use directories::ProjectDirs;

const ASSET_DIR_ENV: &str = "CREWDECK_ASSET_DIR";

/// Directory holding the SQLite database and other runtime assets.
///
/// `CREWDECK_ASSET_DIR` overrides the platform default so the gateway and
/// worker processes can be pointed at the same store explicitly.
pub fn asset_dir() -> PathBuf {
    if let Ok(dir) = env::var(ASSET_DIR_ENV) {
        return PathBuf::from(dir);
    }
    ProjectDirs::from("ai", "crewdeck", "crewdeck")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".crewdeck"))
}
