use std::path::Path;
use std::sync::Arc;

use pdb_types::{Item, PdbError};

/// Map a fjall error into the fatal storage error kind.
pub fn fjall_err(e: fjall::Error) -> PdbError {
    PdbError::Storage(e.to_string())
}

/// Encode a control value (sequence numbers, cursors) for the meta keyspace.
pub fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, PdbError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| PdbError::Storage(e.to_string()))
}

/// Decode a control value written by [`encode`].
pub fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, PdbError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| PdbError::Storage(e.to_string()))
}

/// Items (and the conflict records that embed them) persist in BSON: their
/// bodies are BSON documents already, and BSON survives the round trip where
/// a non-self-describing codec cannot.
pub fn encode_item<T: serde::Serialize>(item: &T) -> Result<Vec<u8>, PdbError> {
    bson::to_vec(item).map_err(|e| PdbError::Storage(e.to_string()))
}

/// Decode a record written by [`encode_item`].
pub fn decode_item<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, PdbError> {
    bson::from_slice(bytes).map_err(|e| PdbError::Storage(e.to_string()))
}

/// Shared storage handle: the ordered byte-key/byte-value store underneath
/// every tree of one merge tree.
///
/// All six keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic. A crash can never leave a partially indexed
/// item.
pub struct Store {
    /// The underlying fjall database.
    pub db: fjall::Database,
    /// Primary index: `tree ++ v` → BSON(Item)
    pub by_version: fjall::Keyspace,
    /// Secondary index: `tree ++ len(id) ++ id ++ i_be(8)` → `v`
    pub by_id: fjall::Keyspace,
    /// Insertion order: `tree ++ i_be(8)` → `v`
    pub by_i: fjall::Keyspace,
    /// Current head set: `tree ++ len(id) ++ id ++ v` → `∅`
    pub heads: fjall::Keyspace,
    /// Cursors and side tables: `tree ++ label` → bincode(value)
    pub meta: fjall::Keyspace,
    /// Unresolved merges: `n_be(8)` → BSON(ConflictRecord)
    pub conflicts: fjall::Keyspace,
}

impl Store {
    /// Open (or create) a `Store` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, PdbError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let by_version = db
            .keyspace("by_version", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let by_id = db
            .keyspace("by_id", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let by_i = db
            .keyspace("by_i", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let heads = db
            .keyspace("heads", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let meta = db
            .keyspace("meta", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let conflicts = db
            .keyspace("conflicts", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        Ok(Arc::new(Store {
            db,
            by_version,
            by_id,
            by_i,
            heads,
            meta,
            conflicts,
        }))
    }
}

/// Typed read of the `remoteToLocal` side table. Runs on the caller's
/// thread; wrap in `spawn_blocking` from async contexts.
pub fn rtl_get(store: &Store, remote_v: &[u8]) -> Result<Option<pdb_types::Version>, PdbError> {
    match store.meta.get(crate::keys::rtl_key(remote_v)).map_err(fjall_err)? {
        Some(bytes) => Ok(Some(pdb_types::Version::from_bytes(bytes.to_vec()))),
        None => Ok(None),
    }
}

/// Blocking read of an item row.
pub fn item_get(store: &Store, tree: &str, v: &[u8]) -> Result<Option<Item>, PdbError> {
    match store
        .by_version
        .get(crate::keys::version_key(tree, v))
        .map_err(fjall_err)?
    {
        Some(bytes) => Ok(Some(decode_item(&bytes)?)),
        None => Ok(None),
    }
}
