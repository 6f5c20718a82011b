//! Directory-backed StateStore.
//!
//! Object-storage layout on a local or shared filesystem: each id is one
//! JSON object `<encoded-id>.json` under the root directory. Writes go to a
//! uniquely named temp file and are renamed into place, so readers see
//! either the old or the new object, never a torn one. Partial writes are
//! serialised with advisory lock files under `<root>/.locks`.
//!
//! Ids whose encoded name would be too long for the filesystem are stored
//! under a digest name instead, with the id embedded in the object so `list`
//! can recover it.

use super::{BackendKind, ConnectionString, IdPattern, StateIds, StateStore};
use crate::lock::{FileLockManager, LockManager, StateLock};
use crate::models::{
    LockConfig, Result, StateRecord, TidemarkError, decode_key, encode_key, is_digest_name, merge,
    storage_name, validate_id,
};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const OBJECT_SUFFIX: &str = ".json";
const LOCK_DIR: &str = ".locks";

/// Id embedded in digest-named objects.
#[derive(Deserialize)]
struct EmbeddedId {
    id: String,
}

/// Store with one JSON object per id.
pub struct FileStateStore {
    root: PathBuf,
    locks: FileLockManager,
}

impl FileStateStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path, config: &LockConfig) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| TidemarkError::backend("open", None, e))?;
        let locks = FileLockManager::new(&root.join(LOCK_DIR), config)?;

        Ok(Self {
            root: root.to_path_buf(),
            locks,
        })
    }

    pub fn from_connection(conn: &ConnectionString, config: &LockConfig) -> Result<Self> {
        Self::open(&conn.path(), config)
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{OBJECT_SUFFIX}", storage_name(id)))
    }

    /// Write one object atomically (write-then-rename).
    fn put(&self, record: &StateRecord) -> Result<()> {
        let name = storage_name(&record.id);
        let bytes = if is_digest_name(&name) {
            record.encode_with_id()?
        } else {
            record.encode()?
        };
        let path = self.root.join(format!("{name}{OBJECT_SUFFIX}"));
        let temp_path = self
            .root
            .join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));

        fs::write(&temp_path, bytes)
            .map_err(|e| TidemarkError::backend("writing state", Some(&record.id), e))?;

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(TidemarkError::backend("writing state", Some(&record.id), e));
        }
        Ok(())
    }

    /// Id stored inside a digest-named object, `None` if unreadable.
    fn embedded_id(&self, path: &Path) -> Option<String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable state object");
                }
                return None;
            }
        };
        match serde_json::from_slice::<EmbeddedId>(&bytes) {
            Ok(embedded) => Some(embedded.id),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping state object without an id");
                None
            }
        }
    }
}

impl StateStore for FileStateStore {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn set(&self, record: StateRecord) -> Result<()> {
        validate_id(&record.id)?;

        if record.complete {
            debug!(id = %record.id, "Writing complete state");
            return self.put(&record);
        }

        let _lock = self.locks.acquire(&record.id)?;
        let existing = self.get(&record.id)?;
        let merged = merge(existing.as_ref(), record);
        debug!(id = %merged.id, fields = merged.payload.len(), "Merged partial state");
        self.put(&merged)
    }

    fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        validate_id(id)?;
        let bytes = match fs::read(self.object_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TidemarkError::backend("reading state", Some(id), e)),
        };

        // a digest name belongs to whichever id is embedded in the object
        if is_digest_name(&storage_name(id))
            && let Ok(embedded) = serde_json::from_slice::<EmbeddedId>(&bytes)
            && embedded.id != id
        {
            return Ok(None);
        }

        StateRecord::decode(id, &bytes).map(Some)
    }

    fn clear(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        match fs::remove_file(self.object_path(id)) {
            Ok(()) => {
                debug!(id = %id, "Cleared state");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TidemarkError::backend("clearing state", Some(id), e)),
        }
    }

    fn list(&self, pattern: Option<&str>) -> Result<StateIds> {
        let pattern = IdPattern::new(pattern)?;
        let encoded_prefix = encode_key(pattern.prefix());

        let entries =
            fs::read_dir(&self.root).map_err(|e| TidemarkError::backend("listing state", None, e))?;

        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TidemarkError::backend("listing state", None, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(OBJECT_SUFFIX) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            if is_digest_name(stem) {
                if let Some(id) = self.embedded_id(&entry.path())
                    && id.starts_with(pattern.prefix())
                {
                    candidates.push(id);
                }
                continue;
            }
            if !stem.starts_with(&encoded_prefix) {
                continue;
            }
            match decode_key(stem) {
                Ok(id) => candidates.push(id),
                Err(e) => warn!(file = %name, error = %e, "Skipping unrecognised state object"),
            }
        }

        Ok(StateIds::new(candidates, pattern))
    }

    fn acquire_lock(&self, id: &str) -> Result<StateLock> {
        validate_id(id)?;
        self.locks.acquire(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_objects_are_plain_json_files() {
        let temp = TempDir::new().unwrap();
        let store = FileStateStore::open(temp.path(), &LockConfig::default()).unwrap();

        store
            .set(StateRecord::from_json("team/job", json!({"cursor": 42}), true).unwrap())
            .unwrap();

        let path = temp.path().join("team%2Fjob.json");
        let doc: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(doc, json!({"payload": {"cursor": 42}, "complete": true}));
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let temp = TempDir::new().unwrap();
        let store = FileStateStore::open(temp.path(), &LockConfig::default()).unwrap();
        store
            .set(StateRecord::from_json("job-a", json!({}), true).unwrap())
            .unwrap();
        fs::write(temp.path().join("README.txt"), "not state").unwrap();
        fs::write(temp.path().join(".job-a.abc.tmp"), "{").unwrap();

        let ids: Vec<_> = store.list(None).unwrap().collect();
        assert_eq!(ids, vec!["job-a"]);
    }

    #[test]
    fn test_long_id_is_stored_under_digest() {
        let temp = TempDir::new().unwrap();
        let store = FileStateStore::open(temp.path(), &LockConfig::default()).unwrap();
        let id = "a/".repeat(300);

        store
            .set(StateRecord::from_json(&id, json!({"a": 1}), false).unwrap())
            .unwrap();
        store
            .set(StateRecord::from_json(&id, json!({"b": 2}), false).unwrap())
            .unwrap();

        let path = temp.path().join(format!("{}.json", storage_name(&id)));
        let doc: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(doc["id"], json!(id));

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(serde_json::Value::Object(record.payload), json!({"a": 1, "b": 2}));
        assert_eq!(store.list(Some("a/*")).unwrap().collect::<Vec<_>>(), vec![id.clone()]);
        assert_eq!(store.list(Some("b*")).unwrap().count(), 0);

        store.clear(&id).unwrap();
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_object_only_affects_its_id() {
        let temp = TempDir::new().unwrap();
        let store = FileStateStore::open(temp.path(), &LockConfig::default()).unwrap();
        store
            .set(StateRecord::from_json("good", json!({"a": 1}), true).unwrap())
            .unwrap();
        fs::write(temp.path().join("bad.json"), b"{not json").unwrap();

        assert!(matches!(
            store.get("bad"),
            Err(TidemarkError::Serialization { .. })
        ));
        assert!(store.get("good").unwrap().is_some());
        assert_eq!(store.list(None).unwrap().count(), 2);
    }
}
