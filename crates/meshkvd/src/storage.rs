//! Persistent namespaced storage using sled
//!
//! Each namespace lives in its own sled tree. Values are postcard-encoded
//! [`StoredEntry`] records carrying the winning timestamp and, for signed
//! writes, the owner signature so the entry can be re-exported during sync.

use meshkv_core::types::{Bytes32, Entry, SignatureScheme, SignedWrite, RESERVED_DB_PREFIX};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Tree holding node metadata
pub const META_TREE: &str = "__meta__";

/// Tree holding the timestamps of deleted entries
pub const TOMBSTONE_TREE: &str = "__tombstones__";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Invalid namespace: {0:?}")]
    InvalidNamespace(String),
    #[error("Corrupt entry {db_name}/{key}")]
    Corrupt { db_name: String, key: String },
}

/// How an entry got into the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOrigin {
    /// Unsigned local write, never exported
    Local,
    /// Write signed by the namespace owner
    Signed {
        public_key: Bytes32,
        signature: Vec<u8>,
        scheme: SignatureScheme,
    },
}

/// On-disk value record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    /// Unix milliseconds
    pub timestamp: i64,
    pub origin: EntryOrigin,
}

impl StoredEntry {
    /// Client-facing view
    pub fn to_entry(&self, db_name: &str, key: &str) -> Entry {
        Entry {
            db_name: db_name.to_string(),
            key: key.to_string(),
            value: String::from_utf8_lossy(&self.value).into_owned(),
            raw_value_bytes: self.value.clone(),
            timestamp: self.timestamp,
            signed: matches!(self.origin, EntryOrigin::Signed { .. }),
        }
    }

    /// Whether peers can verify this entry on their own
    pub fn is_replicable(&self) -> bool {
        matches!(
            self.origin,
            EntryOrigin::Signed {
                scheme: SignatureScheme::Timestamped,
                ..
            }
        )
    }

    /// Rebuild the original signed write, if there is one
    pub fn to_signed_write(&self, db_name: &str, key: &str) -> Option<SignedWrite> {
        match &self.origin {
            EntryOrigin::Local => None,
            EntryOrigin::Signed {
                public_key,
                signature,
                scheme,
            } => Some(SignedWrite {
                db_name: db_name.to_string(),
                key: key.to_string(),
                value: self.value.clone(),
                public_key: *public_key,
                signature: signature.clone(),
                timestamp: self.timestamp,
                scheme: *scheme,
            }),
        }
    }
}

/// Result of a last-writer-wins write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Persisted
    Applied,
    /// An existing entry carries a strictly newer timestamp
    Stale { existing: i64 },
    /// The identical signed write is already stored
    Unchanged,
    /// The key was deleted at or after this write's timestamp
    Deleted { at: i64 },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Position in the `(timestamp, db_name, key)` export order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncCursor {
    pub timestamp: i64,
    pub db_name: String,
    pub key: String,
}

/// One page of exported writes
#[derive(Debug, Clone, Default)]
pub struct WritePage {
    pub writes: Vec<SignedWrite>,
    /// Set when more writes follow `next`
    pub has_more: bool,
    pub next: Option<SyncCursor>,
}

struct Namespace {
    tree: sled::Tree,
    /// Serializes writers within this namespace
    writer: Mutex<()>,
}

/// Storage backend for a node
pub struct Storage {
    db: Db,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
    /// `db_name \0 key` -> i64_be timestamp of the deleted entry
    tombstones: sled::Tree,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    /// Sum of key and stored value lengths
    size_bytes: AtomicU64,
    key_count: AtomicU64,
}

fn check_namespace(db_name: &str) -> Result<(), StorageError> {
    if db_name.is_empty() || db_name.starts_with(RESERVED_DB_PREFIX) {
        return Err(StorageError::InvalidNamespace(db_name.to_string()));
    }
    Ok(())
}

fn tombstone_key(db_name: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(db_name.len() + 1 + key.len());
    out.extend_from_slice(db_name.as_bytes());
    out.push(0);
    out.extend_from_slice(key.as_bytes());
    out
}

fn decode_key(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let metadata = db.open_tree(META_TREE)?;
        let tombstones = db.open_tree(TOMBSTONE_TREE)?;

        let mut namespaces = HashMap::new();
        let mut size_bytes = 0u64;
        let mut key_count = 0u64;
        for name in db.tree_names() {
            let name = decode_key(&name);
            if name.starts_with(RESERVED_DB_PREFIX) {
                continue;
            }
            let tree = db.open_tree(&name)?;
            for item in tree.iter() {
                let (k, v) = item?;
                size_bytes += (k.len() + v.len()) as u64;
                key_count += 1;
            }
            namespaces.insert(
                name,
                Arc::new(Namespace {
                    tree,
                    writer: Mutex::new(()),
                }),
            );
        }
        debug!(
            "Opened storage with {} namespaces, {} keys",
            namespaces.len(),
            key_count
        );

        Ok(Self {
            db,
            metadata,
            tombstones,
            namespaces: RwLock::new(namespaces),
            size_bytes: AtomicU64::new(size_bytes),
            key_count: AtomicU64::new(key_count),
        })
    }

    fn namespace(&self, db_name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().get(db_name).cloned()
    }

    fn namespace_or_create(&self, db_name: &str) -> Result<Arc<Namespace>, StorageError> {
        check_namespace(db_name)?;
        if let Some(ns) = self.namespace(db_name) {
            return Ok(ns);
        }
        let mut namespaces = self.namespaces.write();
        if let Some(ns) = namespaces.get(db_name) {
            return Ok(Arc::clone(ns));
        }
        let ns = Arc::new(Namespace {
            tree: self.db.open_tree(db_name)?,
            writer: Mutex::new(()),
        });
        namespaces.insert(db_name.to_string(), Arc::clone(&ns));
        debug!("Created namespace {}", db_name);
        Ok(ns)
    }

    fn tombstone(&self, db_name: &str, key: &str) -> Result<Option<i64>, StorageError> {
        Ok(self
            .tombstones
            .get(tombstone_key(db_name, key))?
            .and_then(|raw| <[u8; 8]>::try_from(raw.as_ref()).ok())
            .map(i64::from_be_bytes))
    }

    /// Write `entry` unless an existing entry is strictly newer.
    ///
    /// Equal timestamps go to the later arrival. Signed writes no newer than
    /// a deleted entry stay deleted.
    fn write_entry(
        &self,
        db_name: &str,
        key: &str,
        entry: &StoredEntry,
    ) -> Result<ApplyOutcome, StorageError> {
        let ns = self.namespace_or_create(db_name)?;
        let _guard = ns.writer.lock();

        let tombstone = self.tombstone(db_name, key)?;
        if let Some(at) = tombstone {
            if matches!(entry.origin, EntryOrigin::Signed { .. }) && entry.timestamp <= at {
                return Ok(ApplyOutcome::Deleted { at });
            }
        }

        let previous = ns.tree.get(key.as_bytes())?;
        if let Some(raw) = &previous {
            match postcard::from_bytes::<StoredEntry>(raw) {
                Ok(existing) if existing == *entry => return Ok(ApplyOutcome::Unchanged),
                Ok(existing) if existing.timestamp > entry.timestamp => {
                    return Ok(ApplyOutcome::Stale {
                        existing: existing.timestamp,
                    })
                }
                Ok(_) => {}
                Err(e) => warn!("Overwriting corrupt entry {}/{}: {}", db_name, key, e),
            }
        }

        let encoded = postcard::to_allocvec(entry)?;
        let new_len = (key.len() + encoded.len()) as u64;
        ns.tree.insert(key.as_bytes(), encoded)?;
        ns.tree.flush()?;
        if tombstone.is_some() {
            self.tombstones.remove(tombstone_key(db_name, key))?;
        }

        match previous {
            Some(raw) => {
                let old_len = (key.len() + raw.len()) as u64;
                self.size_bytes.fetch_add(new_len, Ordering::Relaxed);
                self.size_bytes.fetch_sub(old_len, Ordering::Relaxed);
            }
            None => {
                self.size_bytes.fetch_add(new_len, Ordering::Relaxed);
                self.key_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Store an unsigned local entry
    pub fn put_local(
        &self,
        db_name: &str,
        key: &str,
        value: &[u8],
        timestamp: i64,
    ) -> Result<ApplyOutcome, StorageError> {
        let entry = StoredEntry {
            value: value.to_vec(),
            timestamp,
            origin: EntryOrigin::Local,
        };
        self.write_entry(db_name, key, &entry)
    }

    /// Merge a verified signed write
    pub fn apply_write(&self, write: &SignedWrite) -> Result<ApplyOutcome, StorageError> {
        let entry = StoredEntry {
            value: write.value.clone(),
            timestamp: write.timestamp,
            origin: EntryOrigin::Signed {
                public_key: write.public_key,
                signature: write.signature.clone(),
                scheme: write.scheme,
            },
        };
        self.write_entry(&write.db_name, &write.key, &entry)
    }

    /// Get the stored record for a key
    pub fn get_entry(&self, db_name: &str, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        let Some(ns) = self.namespace(db_name) else {
            return Ok(None);
        };
        match ns.tree.get(key.as_bytes())? {
            Some(raw) => postcard::from_bytes(&raw)
                .map(Some)
                .map_err(|_| StorageError::Corrupt {
                    db_name: db_name.to_string(),
                    key: key.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Get the value for a key
    pub fn get(&self, db_name: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.get_entry(db_name, key)?.map(|entry| entry.value))
    }

    /// Delete a key. Returns whether it existed.
    ///
    /// A signed entry leaves a tombstone at its timestamp so sync cannot
    /// bring the same write back.
    pub fn delete(&self, db_name: &str, key: &str) -> Result<bool, StorageError> {
        let Some(ns) = self.namespace(db_name) else {
            return Ok(false);
        };
        let _guard = ns.writer.lock();
        match ns.tree.remove(key.as_bytes())? {
            Some(raw) => {
                if let Ok(stored) = postcard::from_bytes::<StoredEntry>(&raw) {
                    if matches!(stored.origin, EntryOrigin::Signed { .. }) {
                        self.tombstones.insert(
                            tombstone_key(db_name, key),
                            stored.timestamp.to_be_bytes().to_vec(),
                        )?;
                        self.tombstones.flush()?;
                    }
                }
                ns.tree.flush()?;
                self.size_bytes
                    .fetch_sub((key.len() + raw.len()) as u64, Ordering::Relaxed);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Namespaces in name order
    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Keys of a namespace in key order
    pub fn list_keys(&self, db_name: &str) -> Result<Vec<String>, StorageError> {
        let Some(ns) = self.namespace(db_name) else {
            return Ok(Vec::new());
        };
        let mut keys = Vec::new();
        for key in ns.tree.iter().keys() {
            keys.push(decode_key(&key?));
        }
        Ok(keys)
    }

    fn scan_namespace(&self, db_name: &str, ns: &Namespace, out: &mut Vec<Entry>) -> Result<(), StorageError> {
        for item in ns.tree.iter() {
            let (k, v) = item?;
            let key = decode_key(&k);
            match postcard::from_bytes::<StoredEntry>(&v) {
                Ok(stored) => out.push(stored.to_entry(db_name, &key)),
                Err(e) => warn!("Skipping corrupt entry {}/{}: {}", db_name, key, e),
            }
        }
        Ok(())
    }

    /// Snapshot of every entry in one namespace, or in all of them
    pub fn scan_all(&self, db_name: Option<&str>) -> Result<Vec<Entry>, StorageError> {
        let mut entries = Vec::new();
        match db_name {
            Some(name) => {
                if let Some(ns) = self.namespace(name) {
                    self.scan_namespace(name, &ns, &mut entries)?;
                }
            }
            None => {
                let namespaces: Vec<(String, Arc<Namespace>)> = self
                    .namespaces
                    .read()
                    .iter()
                    .map(|(name, ns)| (name.clone(), Arc::clone(ns)))
                    .collect();
                for (name, ns) in namespaces {
                    self.scan_namespace(&name, &ns, &mut entries)?;
                }
                entries.sort_by(|a, b| (&a.db_name, &a.key).cmp(&(&b.db_name, &b.key)));
            }
        }
        Ok(entries)
    }

    /// Replicable writes newer than `since`, ordered by `(timestamp, db_name, key)`.
    ///
    /// Resumes strictly after `after` and stops at `limit` writes or once the
    /// page would exceed `max_bytes`. A page always holds at least one write
    /// when any remain.
    pub fn writes_since(
        &self,
        since: Option<i64>,
        after: Option<&SyncCursor>,
        limit: usize,
        max_bytes: usize,
    ) -> Result<WritePage, StorageError> {
        let namespaces: Vec<(String, Arc<Namespace>)> = self
            .namespaces
            .read()
            .iter()
            .map(|(name, ns)| (name.clone(), Arc::clone(ns)))
            .collect();

        let mut candidates: Vec<(SyncCursor, SignedWrite)> = Vec::new();
        for (name, ns) in namespaces {
            for item in ns.tree.iter() {
                let (k, v) = item?;
                let key = decode_key(&k);
                let stored = match postcard::from_bytes::<StoredEntry>(&v) {
                    Ok(stored) => stored,
                    Err(e) => {
                        warn!("Skipping corrupt entry {}/{}: {}", name, key, e);
                        continue;
                    }
                };
                if !stored.is_replicable()
                    || since.is_some_and(|since| stored.timestamp <= since)
                {
                    continue;
                }
                let cursor = SyncCursor {
                    timestamp: stored.timestamp,
                    db_name: name.clone(),
                    key: key.clone(),
                };
                if after.is_some_and(|after| cursor <= *after) {
                    continue;
                }
                if let Some(write) = stored.to_signed_write(&name, &key) {
                    candidates.push((cursor, write));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut page = WritePage::default();
        let mut bytes = 0usize;
        let total = candidates.len();
        for (index, (cursor, write)) in candidates.into_iter().enumerate() {
            let size = write.encoded_len();
            if page.writes.len() >= limit || (!page.writes.is_empty() && bytes + size > max_bytes) {
                break;
            }
            bytes += size;
            page.writes.push(write);
            page.next = Some(cursor);
            page.has_more = index + 1 < total;
        }
        if !page.has_more {
            page.next = None;
        }
        Ok(page)
    }

    /// Sum of key and stored value sizes
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Number of keys across all namespaces
    pub fn total_key_count(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    /// Store metadata
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        self.metadata.flush()?;
        Ok(())
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use meshkv_core::crypto::{generate_db_name, sign_write, KeyPair};
    use proptest::prelude::*;
    use tempfile::tempdir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn newest_write_wins_in_any_order(
            order in prop::collection::btree_set(1i64..1_000_000, 1..10)
                .prop_map(|set| set.into_iter().collect::<Vec<_>>())
                .prop_shuffle()
        ) {
            let dir = tempdir().unwrap();
            let storage = Storage::open(dir.path()).unwrap();
            let keys = KeyPair::generate();
            let db = generate_db_name("notes", &keys.public_key_hex()).unwrap();

            for ts in &order {
                let write = sign_write(&keys, &db, "k", ts.to_string().as_bytes(), *ts).unwrap();
                storage.apply_write(&write).unwrap();
            }

            let newest = order.iter().max().unwrap();
            let entry = storage.get_entry(&db, "k").unwrap().unwrap();
            prop_assert_eq!(entry.timestamp, *newest);
            prop_assert_eq!(entry.value, newest.to_string().into_bytes());
            prop_assert_eq!(storage.total_key_count(), 1);
        }
    }
}
