//! Branch record storage - byte-level API for the file-per-branch layout.
//!
//! ```text
//! <root>/<conversation_id>/metadata.json
//! <root>/<conversation_id>/<branch_key>.json
//! <root>/<conversation_id>/workspace/
//! ```
//!
//! Writes go to a sibling temp file first and are renamed into place, so a
//! reader never observes a half-written record.

use anyhow::{Context, Result, bail};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::keys::validate_id;

const METADATA_FILE: &str = "metadata.json";
const RECORD_EXTENSION: &str = "json";
const WORKSPACE_DIR: &str = "workspace";
const TEMP_SUFFIX: &str = ".tmp";

/// Low-level branch record storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct BranchRecordStorage {
    root: PathBuf,
}

impl BranchRecordStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create conversations dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn conversation_dir(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }

    pub fn workspace_dir(&self, id: &str) -> Result<PathBuf> {
        Ok(self.conversation_dir(id)?.join(WORKSPACE_DIR))
    }

    /// Create the conversation directory, plus a workspace when requested.
    pub fn create_conversation_dir(&self, id: &str, with_workspace: bool) -> Result<PathBuf> {
        let dir = self.conversation_dir(id)?;
        fs::create_dir_all(&dir)?;
        if with_workspace {
            fs::create_dir_all(dir.join(WORKSPACE_DIR))?;
        }
        Ok(dir)
    }

    /// A conversation exists once its metadata record has been written.
    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.conversation_dir(id)?.join(METADATA_FILE).is_file())
    }

    pub fn get_metadata_raw(&self, id: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.conversation_dir(id)?.join(METADATA_FILE))
    }

    pub fn put_metadata_raw(&self, id: &str, data: &[u8]) -> Result<()> {
        write_atomic(&self.conversation_dir(id)?.join(METADATA_FILE), data)
    }

    pub fn get_record_raw(&self, id: &str, key: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.record_path(id, key)?)
    }

    pub fn put_record_raw(&self, id: &str, key: &str, data: &[u8]) -> Result<()> {
        write_atomic(&self.record_path(id, key)?, data)
    }

    pub fn record_exists(&self, id: &str, key: &str) -> Result<bool> {
        Ok(self.record_path(id, key)?.is_file())
    }

    /// List the branch keys of every record, sorted lexicographically.
    pub fn list_record_keys(&self, id: &str) -> Result<Vec<String>> {
        let dir = self.conversation_dir(id)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION)
            {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(METADATA_FILE) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// List every conversation id that has a metadata record.
    pub fn list_conversation_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && entry.path().join(METADATA_FILE).is_file()
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove the conversation directory and everything below it.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let dir = self.conversation_dir(id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", dir.display())),
        }
    }

    fn record_path(&self, id: &str, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_digit() || c == '_') {
            bail!("Invalid branch record key '{}'", key);
        }
        Ok(self
            .conversation_dir(id)?
            .join(format!("{key}.{RECORD_EXTENSION}")))
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let Some(parent) = path.parent() else {
        bail!("Record path {} has no parent", path.display());
    };
    fs::create_dir_all(parent)?;

    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    let temp = PathBuf::from(temp);

    fs::write(&temp, data).with_context(|| format!("Failed to write {}", temp.display()))?;
    fs::rename(&temp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (BranchRecordStorage, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let storage = BranchRecordStorage::new(temp_dir.path().join("conversations")).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_metadata_marks_existence() {
        let (storage, _temp_dir) = setup();
        storage.create_conversation_dir("conv-1", false).unwrap();
        assert!(!storage.exists("conv-1").unwrap());

        storage.put_metadata_raw("conv-1", b"{}").unwrap();
        assert!(storage.exists("conv-1").unwrap());
        assert_eq!(
            storage.get_metadata_raw("conv-1").unwrap().unwrap(),
            b"{}".to_vec()
        );
        assert_eq!(storage.list_conversation_ids().unwrap(), vec!["conv-1"]);
    }

    #[test]
    fn test_records_are_listed_without_metadata() {
        let (storage, _temp_dir) = setup();
        storage.create_conversation_dir("conv-1", true).unwrap();
        storage.put_metadata_raw("conv-1", b"{}").unwrap();
        storage.put_record_raw("conv-1", "0_1", b"[]").unwrap();
        storage.put_record_raw("conv-1", "0", b"[]").unwrap();

        assert_eq!(storage.list_record_keys("conv-1").unwrap(), vec!["0", "0_1"]);
        assert!(storage.record_exists("conv-1", "0_1").unwrap());
        assert!(storage.get_record_raw("conv-1", "2").unwrap().is_none());
        assert!(storage.workspace_dir("conv-1").unwrap().is_dir());
    }

    #[test]
    fn test_rejects_unsafe_names() {
        let (storage, _temp_dir) = setup();
        assert!(storage.conversation_dir("../escape").is_err());
        assert!(storage.put_record_raw("conv-1", "../0", b"[]").is_err());
        assert!(storage.put_record_raw("conv-1", "", b"[]").is_err());
    }

    #[test]
    fn test_delete_conversation() {
        let (storage, _temp_dir) = setup();
        storage.create_conversation_dir("conv-1", false).unwrap();
        storage.put_metadata_raw("conv-1", b"{}").unwrap();

        assert!(storage.delete_conversation("conv-1").unwrap());
        assert!(!storage.delete_conversation("conv-1").unwrap());
        assert!(storage.list_conversation_ids().unwrap().is_empty());
    }
}
