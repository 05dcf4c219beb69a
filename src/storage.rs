//! Durable storage for the last known toggle snapshot.
//!
//! The repository saves every snapshot it adopts and loads the saved one at startup, so a client
//! that starts while the server is unreachable still evaluates with the last known definitions.
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use crate::{toggles::Snapshot, Result};

/// Storage for one serialized [`Snapshot`].
pub trait StorageProvider: Send + Sync {
    /// Load the saved snapshot. Returns `Ok(None)` if nothing was saved yet.
    fn load(&self) -> Result<Option<Snapshot>>;

    /// Replace the saved snapshot.
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Stores the snapshot as a JSON file named after the application, so that multiple clients on
/// the same host don't overwrite each other's backups.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Backup file for `app_name` inside `directory`.
    pub fn new(directory: impl AsRef<Path>, app_name: &str) -> FileStorage {
        FileStorage {
            path: directory
                .as_ref()
                .join(format!("unleash-backup-{}.json", safe_name(app_name))),
        }
    }

    /// Backup file at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> FileStorage {
        FileStorage { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageProvider for FileStorage {
    fn load(&self) -> Result<Option<Snapshot>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let snapshot = serde_json::from_slice(&content)?;
        log::debug!(target: "unleash", path:? = self.path; "loaded backup");
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let content = serde_json::to_vec(snapshot)?;

        // Write to a sibling file first and rename it into place, so readers never see a
        // partially written backup.
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        log::debug!(target: "unleash", path:? = self.path, revision = snapshot.revision(); "saved backup");
        Ok(())
    }
}

/// Keep file names portable: anything but ASCII alphanumerics, `-` and `_` becomes `_`.
fn safe_name(app_name: &str) -> String {
    app_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Keeps the snapshot in memory. Useful for tests and for clients that should never touch disk.
///
/// Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    slot: Arc<RwLock<Option<Vec<u8>>>>,
}

impl InMemoryStorage {
    pub fn new() -> InMemoryStorage {
        InMemoryStorage::default()
    }
}

impl StorageProvider for InMemoryStorage {
    fn load(&self) -> Result<Option<Snapshot>> {
        let slot = self
            .slot
            .read()
            .expect("thread holding storage lock should not panic");
        match slot.as_deref() {
            Some(content) => Ok(Some(serde_json::from_slice(content)?)),
            None => Ok(None),
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let content = serde_json::to_vec(snapshot)?;
        *self
            .slot
            .write()
            .expect("thread holding storage lock should not panic") = Some(content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;
    use crate::toggles::{StrategyConfig, ToggleDefinition};

    fn temp_dir() -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "unleash-storage-test-{}-{nanos}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn snapshot() -> Snapshot {
        Snapshot::new(
            2,
            vec![
                ToggleDefinition::new("featureA", true),
                ToggleDefinition::new("featureB", false).with_strategy(
                    StrategyConfig::new("flexibleRollout")
                        .with_parameter("rollout", "25")
                        .with_parameter("stickiness", "sessionId"),
                ),
            ],
            Some("abc".to_owned()),
            3,
        )
    }

    #[test]
    fn file_storage_round_trip() {
        let storage = FileStorage::new(temp_dir(), "my app/1");
        assert!(storage
            .path()
            .ends_with("unleash-backup-my_app_1.json"));

        assert_eq!(storage.load().unwrap(), None);

        storage.save(&snapshot()).unwrap();
        assert_eq!(storage.load().unwrap(), Some(snapshot()));
    }

    #[test]
    fn file_storage_last_write_wins() {
        let storage = FileStorage::new(temp_dir(), "app");
        storage.save(&snapshot()).unwrap();

        let newer = Snapshot::new(2, vec![ToggleDefinition::new("other", true)], None, 4);
        storage.save(&newer).unwrap();

        assert_eq!(storage.load().unwrap(), Some(newer));
    }

    #[test]
    fn file_storage_rejects_garbage() {
        let dir = temp_dir();
        let storage = FileStorage::new(&dir, "app");
        fs::write(storage.path(), b"{ not json").unwrap();
        assert!(matches!(storage.load(), Err(crate::Error::Parse(_))));

        fs::write(storage.path(), b"  \n").unwrap();
        assert_eq!(storage.load().unwrap(), None);
    }

    #[test]
    fn file_storage_ignores_unknown_fields() {
        let storage = FileStorage::new(temp_dir(), "app");
        fs::write(
            storage.path(),
            br#"{"version":2,"etag":"x","features":[{"name":"a","enabled":true,"newField":1}],"extra":{}}"#,
        )
        .unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.etag(), Some("x"));
        assert!(loaded.get("a").unwrap().enabled);
    }

    #[test]
    fn in_memory_storage_round_trip() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.load().unwrap(), None);

        storage.save(&snapshot()).unwrap();
        assert_eq!(storage.clone().load().unwrap(), Some(snapshot()));
    }
}
