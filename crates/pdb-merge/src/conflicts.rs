//! Durable queue of unresolved merges, keyed by an auto-increment integer.
//! The engine never retries a stored conflict; external tooling resolves and
//! deletes rows through the MergeTree.

use std::sync::Arc;

use pdb_types::{Item, PdbError, Version};

use pdb_storage::keys;
use pdb_storage::kv::{decode, decode_item, encode, encode_item, fjall_err, Store};

/// One quarantined merge.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConflictRecord {
    /// The incoming remote item.
    pub n: Item,
    /// The local head it was paired with, when one existed.
    pub l: Option<Item>,
    /// The merge attempt, when one was synthesized before failing.
    pub c: Option<Item>,
    pub lcas: Vec<Version>,
    /// Perspective the remote item came from.
    pub pe: String,
    pub err: String,
}

pub struct ConflictStore {
    store: Arc<Store>,
    /// Serializes counter allocation across the per-perspective merge loops.
    next: tokio::sync::Mutex<u64>,
}

fn io_err(e: tokio::task::JoinError) -> PdbError {
    PdbError::Storage(e.to_string())
}

impl ConflictStore {
    /// Recover the counter from the meta keyspace.
    pub async fn open(store: Arc<Store>) -> Result<ConflictStore, PdbError> {
        let scan = store.clone();
        let next = tokio::task::spawn_blocking(move || -> Result<u64, PdbError> {
            match scan.meta.get(keys::conflict_seq_key()).map_err(fjall_err)? {
                Some(bytes) => Ok(decode::<u64>(&bytes)? + 1),
                None => Ok(1),
            }
        })
        .await
        .map_err(io_err)??;
        Ok(ConflictStore {
            store,
            next: tokio::sync::Mutex::new(next),
        })
    }

    /// Append a record; `meta_puts` rows (typically the merge cursor of the
    /// originating perspective) commit in the same batch.
    pub async fn append(
        &self,
        record: ConflictRecord,
        meta_puts: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<u64, PdbError> {
        let mut next = self.next.lock().await;
        let n = *next;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PdbError> {
            let mut batch = store.db.batch();
            batch.insert(&store.conflicts, keys::conflict_key(n), encode_item(&record)?);
            batch.insert(&store.meta, keys::conflict_seq_key(), encode(&n)?);
            for (k, v) in meta_puts {
                batch.insert(&store.meta, k, v);
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(io_err)??;
        *next = n + 1;
        Ok(n)
    }

    pub async fn get(&self, n: u64) -> Result<Option<ConflictRecord>, PdbError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<ConflictRecord>, PdbError> {
            match store.conflicts.get(keys::conflict_key(n)).map_err(fjall_err)? {
                Some(bytes) => Ok(Some(decode_item(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(io_err)?
    }

    /// All rows in queue order, oldest first.
    pub async fn list(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<(u64, ConflictRecord)>, PdbError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(u64, ConflictRecord)>, PdbError> {
            let mut out = Vec::new();
            for guard in store.conflicts.prefix(Vec::new()) {
                let (k, v) = guard.into_inner().map_err(fjall_err)?;
                let Some(n) = keys::parse_conflict_key(&k) else {
                    continue;
                };
                out.push((n, decode_item(&v)?));
                if let Some(limit) = limit {
                    if out.len() >= limit {
                        break;
                    }
                }
            }
            Ok(out)
        })
        .await
        .map_err(io_err)?
    }

    pub async fn remove(&self, n: u64) -> Result<(), PdbError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            store
                .conflicts
                .remove(keys::conflict_key(n))
                .map_err(fjall_err)
        })
        .await
        .map_err(io_err)?
    }

    pub async fn count(&self) -> Result<u64, PdbError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, PdbError> {
            let mut count = 0u64;
            for guard in store.conflicts.prefix(Vec::new()) {
                guard.into_inner().map_err(fjall_err)?;
                count += 1;
            }
            Ok(count)
        })
        .await
        .map_err(io_err)?
    }
}
