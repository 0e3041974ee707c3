//! Disk-backed pairing store: `instanceUID -> PairingRecord`, JSON,
//! write-through on every mutation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::error::Result;
use crate::types::PairingRecord;

pub struct PairingStore {
    path: PathBuf,
    values: Mutex<HashMap<String, PairingRecord>>,
}

impl PairingStore {
    /// Load the store from `path`. A missing file yields an empty
    /// store (and creates the parent directory); a corrupt file is a
    /// startup error.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let values = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                HashMap::new()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn get(&self, instance_uid_hex: &str) -> Option<PairingRecord> {
        self.values.lock().unwrap().get(instance_uid_hex).cloned()
    }

    pub fn store(&self, instance_uid_hex: &str, record: PairingRecord) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        values.insert(instance_uid_hex.to_string(), record);
        self.save(&values)
    }

    pub fn delete(&self, instance_uid_hex: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        values.remove(instance_uid_hex);
        self.save(&values)
    }

    /// Rewrite the whole file. Writes to a sibling temp file first and
    /// renames it into place so a crash mid-write never leaves a
    /// truncated store behind.
    fn save(&self, values: &HashMap<String, PairingRecord>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(values)?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &bytes)?;

        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&tmp_path)?.permissions();
            perms.set_mode(0o640);
            fs::set_permissions(&tmp_path, perms)?;
        }

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = env::temp_dir();
        p.push(format!("keycard-pairing-store-test-{name}-{}", std::process::id()));
        p
    }

    #[test]
    fn missing_file_yields_empty_store() {
        let path = temp_path("missing");
        let _ = fs::remove_file(&path);

        let store = PairingStore::open(&path).unwrap();
        assert!(store.get("abc").is_none());
    }

    #[test]
    fn store_then_get_round_trips() {
        let path = temp_path("roundtrip");
        let _ = fs::remove_file(&path);

        let store = PairingStore::open(&path).unwrap();
        let record = PairingRecord {
            index: 2,
            key: [5u8; 32],
        };
        store.store("cafebabe", record.clone()).unwrap();

        let reopened = PairingStore::open(&path).unwrap();
        let got = reopened.get("cafebabe").unwrap();
        assert_eq!(got.index, record.index);
        assert_eq!(got.key, record.key);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn delete_evicts_and_persists() {
        let path = temp_path("delete");
        let _ = fs::remove_file(&path);

        let store = PairingStore::open(&path).unwrap();
        store
            .store("iuid", PairingRecord { index: 0, key: [1u8; 32] })
            .unwrap();
        store.delete("iuid").unwrap();
        assert!(store.get("iuid").is_none());

        let reopened = PairingStore::open(&path).unwrap();
        assert!(reopened.get("iuid").is_none());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn corrupt_file_is_a_startup_error() {
        let path = temp_path("corrupt");
        fs::write(&path, b"not json").unwrap();

        assert!(PairingStore::open(&path).is_err());

        fs::remove_file(&path).ok();
    }
}
