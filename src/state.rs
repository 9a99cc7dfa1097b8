use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::SynnergyError;

/// Storage-layer errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("store is read-only pending recovery")]
    ReadOnly,
}

impl From<StateError> for SynnergyError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Corruption(msg) => SynnergyError::Corruption(msg),
            StateError::ReadOnly => SynnergyError::RecoveryRequired,
            StateError::Serialization(e) => SynnergyError::SerializationError(e.to_string()),
            other => SynnergyError::StorageError(other.to_string()),
        }
    }
}

/// Canonical JSON bytes: sorted object keys, no whitespace
///
/// All structured records the core persists go through this encoder so the
/// byte image of a record is a pure function of its value.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StateError> {
    // serde_json's default map is ordered, so round-tripping through Value
    // sorts the keys.
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Versioned key/value state store
///
/// Backed by a single sled tree. Reads always observe the last committed
/// snapshot; writers stage their mutations in a [`StateBatch`] and commit
/// atomically at block finalization. Decoding failures on structured records
/// are treated as corruption and latch the store read-only.
#[derive(Debug)]
pub struct StateStore {
    db: sled::Db,
    tree: sled::Tree,
    read_only: AtomicBool,
}

impl StateStore {
    /// Open (or create) a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateError> {
        let db = sled::open(path)?;
        let tree = db.open_tree("state")?;
        info!("opened state store");
        Ok(StateStore {
            db,
            tree,
            read_only: AtomicBool::new(false),
        })
    }

    /// Open an ephemeral store; used by tests and simulation nodes
    pub fn temporary() -> Result<Self, StateError> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree("state")?;
        Ok(StateStore {
            db,
            tree,
            read_only: AtomicBool::new(false),
        })
    }

    /// Fetch a raw value
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, StateError> {
        Ok(self.tree.contains_key(key)?)
    }

    /// Write a raw value outside any block stage
    ///
    /// Reserved for genesis initialization and collaborator flags; all
    /// block-scoped mutation goes through [`StateBatch`].
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        self.check_writable()?;
        self.tree.insert(key, value)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StateError> {
        self.check_writable()?;
        self.tree.remove(key)?;
        Ok(())
    }

    /// Iterate keys under `prefix` in lexicographic order
    pub fn prefix_iter(
        &self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), StateError>> {
        self.tree.scan_prefix(prefix).map(|entry| {
            entry
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(StateError::from)
        })
    }

    /// Decode a structured record stored as canonical JSON
    ///
    /// An undecodable record is corruption: the store latches read-only and
    /// the caller gets a fatal error.
    pub fn get_record<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StateError> {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    self.mark_read_only();
                    error!(
                        "corrupt record at {}: {}",
                        String::from_utf8_lossy(key),
                        e
                    );
                    Err(StateError::Corruption(format!(
                        "record at {} failed to decode",
                        String::from_utf8_lossy(key)
                    )))
                }
            },
        }
    }

    /// Encode and write a structured record outside any block stage
    pub fn put_record<T: Serialize>(&self, key: &[u8], record: &T) -> Result<(), StateError> {
        let bytes = to_canonical_json(record)?;
        self.set(key, &bytes)
    }

    /// Open a staging scope over this store
    pub fn stage(&self) -> StateBatch<'_> {
        StateBatch {
            store: self,
            writes: BTreeMap::new(),
        }
    }

    /// Atomically apply a staged batch
    pub fn commit(&self, batch: StateBatch<'_>) -> Result<(), StateError> {
        self.check_writable()?;
        let mut sled_batch = sled::Batch::default();
        for (key, value) in &batch.writes {
            match value {
                Some(v) => sled_batch.insert(key.as_slice(), v.as_slice()),
                None => sled_batch.remove(key.as_slice()),
            }
        }
        self.tree.apply_batch(sled_batch)?;
        self.db.flush()?;
        Ok(())
    }

    /// Latch the store read-only; only recovery tooling clears this
    pub fn mark_read_only(&self) {
        if !self.read_only.swap(true, Ordering::SeqCst) {
            warn!("state store latched read-only");
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<(), StateError> {
        if self.is_read_only() {
            return Err(StateError::ReadOnly);
        }
        Ok(())
    }
}

/// Staged writes over a [`StateStore`]
///
/// Reads fall through to the committed snapshot for keys the stage has not
/// touched. Dropping the batch discards everything; [`StateStore::commit`]
/// applies it atomically.
#[derive(Debug)]
pub struct StateBatch<'a> {
    store: &'a StateStore,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> StateBatch<'a> {
    /// Copy of this stage over the same store; used for trial application
    /// of a single transaction that may be dropped without unwinding the
    /// surrounding block stage
    pub fn fork(&self) -> StateBatch<'a> {
        StateBatch {
            store: self.store,
            writes: self.writes.clone(),
        }
    }
}

impl StateBatch<'_> {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        match self.writes.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.store.get(key),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, StateError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    pub fn get_record<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StateError> {
        match self.writes.get(key) {
            Some(Some(bytes)) => Ok(Some(serde_json::from_slice(bytes)?)),
            Some(None) => Ok(None),
            None => self.store.get_record(key),
        }
    }

    pub fn put_record<T: Serialize>(&mut self, key: Vec<u8>, record: &T) -> Result<(), StateError> {
        let bytes = to_canonical_json(record)?;
        self.set(key, bytes);
        Ok(())
    }

    /// Iterate keys under `prefix` merging staged writes over the committed
    /// snapshot, in lexicographic order
    pub fn prefix_iter(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for entry in self.store.prefix_iter(prefix) {
            let (k, v) = entry?;
            merged.insert(k, v);
        }
        for (k, staged) in self.writes.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            match staged {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Changed `(key, post-value)` pairs in key order; deletions carry an
    /// empty value. This is the input to the state-root computation.
    pub fn changed_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.writes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        balance: u64,
        nonce: u64,
    }

    #[test]
    fn test_set_get_delete() {
        let store = StateStore::temporary().unwrap();
        store.set(b"acct:aa", b"1").unwrap();
        assert_eq!(store.get(b"acct:aa").unwrap(), Some(b"1".to_vec()));
        assert!(store.has(b"acct:aa").unwrap());
        store.delete(b"acct:aa").unwrap();
        assert_eq!(store.get(b"acct:aa").unwrap(), None);
    }

    #[test]
    fn test_prefix_iteration_is_lexicographic() {
        let store = StateStore::temporary().unwrap();
        store.set(b"xs:pending:9:bb", b"2").unwrap();
        store.set(b"xs:pending:9:aa", b"1").unwrap();
        store.set(b"xs:pending:10:cc", b"3").unwrap();

        let keys: Vec<Vec<u8>> = store
            .prefix_iter(b"xs:pending:9:")
            .map(|e| e.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"xs:pending:9:aa".to_vec(), b"xs:pending:9:bb".to_vec()]);
    }

    #[test]
    fn test_stage_commit_is_atomic() {
        let store = StateStore::temporary().unwrap();
        store.set(b"k1", b"old").unwrap();

        let mut batch = store.stage();
        batch.set(b"k1".to_vec(), b"new".to_vec());
        batch.set(b"k2".to_vec(), b"fresh".to_vec());

        // readers still see the committed snapshot
        assert_eq!(store.get(b"k1").unwrap(), Some(b"old".to_vec()));
        assert_eq!(store.get(b"k2").unwrap(), None);

        store.commit(batch).unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"new".to_vec()));
        assert_eq!(store.get(b"k2").unwrap(), Some(b"fresh".to_vec()));
    }

    #[test]
    fn test_dropped_stage_leaves_store_unchanged() {
        let store = StateStore::temporary().unwrap();
        store.set(b"k", b"v").unwrap();
        {
            let mut batch = store.stage();
            batch.delete(b"k".to_vec());
            batch.set(b"other".to_vec(), b"x".to_vec());
            // dropped without commit
        }
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get(b"other").unwrap(), None);
    }

    #[test]
    fn test_batch_reads_through_overlay() {
        let store = StateStore::temporary().unwrap();
        store.set(b"a", b"committed").unwrap();

        let mut batch = store.stage();
        assert_eq!(batch.get(b"a").unwrap(), Some(b"committed".to_vec()));
        batch.set(b"a".to_vec(), b"staged".to_vec());
        assert_eq!(batch.get(b"a").unwrap(), Some(b"staged".to_vec()));
        batch.delete(b"a".to_vec());
        assert_eq!(batch.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        #[derive(Serialize)]
        struct Unsorted {
            zulu: u32,
            alpha: u32,
        }
        let bytes = to_canonical_json(&Unsorted { zulu: 1, alpha: 2 }).unwrap();
        assert_eq!(bytes, b"{\"alpha\":2,\"zulu\":1}".to_vec());
    }

    #[test]
    fn test_corrupt_record_latches_read_only() {
        let store = StateStore::temporary().unwrap();
        store.set(b"acct:xx", b"not json").unwrap();

        let err = store.get_record::<Rec>(b"acct:xx").unwrap_err();
        assert!(matches!(err, StateError::Corruption(_)));
        assert!(store.is_read_only());
        assert!(matches!(store.set(b"k", b"v"), Err(StateError::ReadOnly)));
    }

    #[test]
    fn test_record_round_trip() {
        let store = StateStore::temporary().unwrap();
        let rec = Rec { balance: 42, nonce: 7 };
        store.put_record(b"acct:yy", &rec).unwrap();
        assert_eq!(store.get_record::<Rec>(b"acct:yy").unwrap(), Some(rec));
    }
}
