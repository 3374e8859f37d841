//! On-disk persistence for the three JSON documents.
//!
//! Each document is written atomically (write to temp, rename) after
//! every mutation; startup loads whatever is present and treats missing
//! files as empty.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{StoreData, StoreError};

pub(super) const ENDPOINTS_FILE: &str = "endpoints.json";
pub(super) const ZONES_FILE: &str = "zones.json";
pub(super) const ROUTES_FILE: &str = "routes.json";

/// Persists the endpoint/zone/route documents under one directory.
pub(super) struct Persistence {
    dir: PathBuf,
}

impl Persistence {
    pub(super) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Load all documents, defaulting any that are absent.
    pub(super) fn load(&self) -> Result<StoreData, StoreError> {
        Ok(StoreData {
            endpoints: self.load_document(ENDPOINTS_FILE)?,
            zones: self.load_document(ZONES_FILE)?,
            routes: self.load_document(ROUTES_FILE)?,
        })
    }

    /// Persist every document that differs between `old` and `new`.
    ///
    /// If a later document fails to write, documents already written are
    /// restored from `old` (best effort) so disk matches the in-memory
    /// state the caller keeps on error.
    pub(super) fn persist(&self, old: &StoreData, new: &StoreData) -> Result<(), StoreError> {
        let mut written: Vec<&str> = Vec::new();

        let result = (|| {
            if old.endpoints != new.endpoints {
                self.save_document(ENDPOINTS_FILE, &new.endpoints)?;
                written.push(ENDPOINTS_FILE);
            }
            if old.zones != new.zones {
                self.save_document(ZONES_FILE, &new.zones)?;
                written.push(ZONES_FILE);
            }
            if old.routes != new.routes {
                self.save_document(ROUTES_FILE, &new.routes)?;
                written.push(ROUTES_FILE);
            }
            Ok(())
        })();

        if result.is_err() {
            for file in &written {
                let revert = match *file {
                    ENDPOINTS_FILE => self.save_document(ENDPOINTS_FILE, &old.endpoints),
                    ZONES_FILE => self.save_document(ZONES_FILE, &old.zones),
                    _ => self.save_document(ROUTES_FILE, &old.routes),
                };
                if let Err(e) = revert {
                    tracing::error!(file, error = %e, "Failed to revert document after write failure");
                }
            }
        }

        result
    }

    fn load_document<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T, StoreError> {
        let path = self.dir.join(file);
        if !path.exists() {
            debug!(path = %path.display(), "No document, starting empty");
            return Ok(T::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| StoreError::Persist {
            file: file.to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| StoreError::Persist {
            file: file.to_string(),
            reason: e.to_string(),
        })
    }

    fn save_document<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StoreError> {
        let path = self.dir.join(file);
        write_json_atomic(&path, value).map_err(|e| StoreError::Persist {
            file: file.to_string(),
            reason: e.to_string(),
        })
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    fs::write(&tmp_path, &content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
