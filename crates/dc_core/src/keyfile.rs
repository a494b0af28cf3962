//! Key file storage: one file per user holding that user's encrypted
//! private key, addressed by username.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{CourierError, Result};

#[async_trait]
pub trait KeyFileStore: Send + Sync {
    async fn load_file(&self, name: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, bytes: &[u8], name: &str) -> Result<()>;
}

fn checked_name(name: &str) -> Result<&str> {
    dc_proto::validate_username(name).map_err(CourierError::KeyFile)?;
    Ok(name)
}

/// Key files as `<dir>/<name>.key`.
pub struct DirKeyFileStore {
    dir: PathBuf,
}

impl DirKeyFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.key", checked_name(name)?)))
    }
}

#[async_trait]
impl KeyFileStore for DirKeyFileStore {
    async fn load_file(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| CourierError::KeyFile(format!("cannot read {}: {e}", path.display())))
    }

    async fn write_file(&self, bytes: &[u8], name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CourierError::KeyFile(format!("cannot create {}: {e}", self.dir.display())))?;

        // Write beside the target and rename so a crash never leaves half a key.
        let tmp = path.with_extension("key.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CourierError::KeyFile(format!("cannot write {}: {e}", tmp.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| CourierError::KeyFile(e.to_string()))?;
        }
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CourierError::KeyFile(format!("cannot replace {}: {e}", path.display())))?;
        tracing::debug!(target: "dc_core", file = %path.display(), "key file written");
        Ok(())
    }
}

/// In-memory key files, for tests and ephemeral clients.
#[derive(Default)]
pub struct MemoryKeyFileStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyFileStore for MemoryKeyFileStore {
    async fn load_file(&self, name: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(checked_name(name)?)
            .cloned()
            .ok_or_else(|| CourierError::KeyFile(format!("no key file for {name}")))
    }

    async fn write_file(&self, bytes: &[u8], name: &str) -> Result<()> {
        self.files.lock().insert(checked_name(name)?.to_string(), bytes.to_vec());
        Ok(())
    }
}
