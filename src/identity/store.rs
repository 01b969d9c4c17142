//! File-backed identity persistence.
//!
//! Each named identity is one small file holding the hex-encoded secret
//! key. Loading normalizes through [`LocalIdentity::from_secret_hex`], so a
//! stored key always reproduces the same wire identity.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{IdentityError, LocalIdentity};

/// Loads and saves identities under a base directory.
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    /// Create a store rooted at `dir`. The directory is created on save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.key"))
    }

    /// Load a named identity.
    ///
    /// Returns [`IdentityError::Missing`] if no such file exists.
    pub fn load(&self, name: &str) -> Result<LocalIdentity, IdentityError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Err(IdentityError::Missing(name.to_string()));
        }
        let contents = fs::read_to_string(&path)?;
        LocalIdentity::from_secret_hex(&contents)
    }

    /// Save a named identity, creating the directory if needed.
    pub fn save(&self, name: &str, identity: &LocalIdentity) -> Result<(), IdentityError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        fs::write(&path, hex::encode(identity.secret_bytes()))?;
        info!(path = %path.display(), "Saved identity");
        Ok(())
    }

    /// Load a named identity, generating and saving a fresh one if missing.
    pub fn load_or_create(&self, name: &str) -> Result<LocalIdentity, IdentityError> {
        match self.load(name) {
            Ok(identity) => Ok(identity),
            Err(IdentityError::Missing(_)) => {
                let identity = LocalIdentity::generate();
                self.save(name, &identity)?;
                Ok(identity)
            }
            Err(e) => Err(e),
        }
    }

    /// Base directory of this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
