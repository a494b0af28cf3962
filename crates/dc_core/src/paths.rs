use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::error::{CourierError, Result};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "courier";

pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| CourierError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn keys_dir(data: &Path) -> PathBuf {
    data.join("keys")
}

/// One store per local user so accounts sharing a machine stay apart.
pub fn client_store_path(data: &Path, username: &str) -> PathBuf {
    data.join(format!("{username}.db"))
}

pub fn server_store_path(data: &Path) -> PathBuf {
    data.join("server.db")
}
