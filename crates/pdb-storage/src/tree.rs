use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use futures::Stream;
use pdb_types::{Id, Item, PdbError, Version};
use tokio::sync::watch;

use crate::keys;
use crate::kv::{encode_item, fjall_err, item_get, Store};

/// Items fetched per read-stream drain.
const STREAM_CHUNK: usize = 64;

/// Head selection for [`Tree::heads`].
#[derive(Debug, Clone, Default)]
pub struct HeadFilter {
    /// Restrict to one id.
    pub id: Option<Id>,
    /// Restrict to ids with this byte prefix; callers usually take the first
    /// match.
    pub prefix: Option<Vec<u8>>,
    pub skip_conflicts: bool,
    pub skip_deletes: bool,
    pub limit: Option<usize>,
}

impl HeadFilter {
    pub fn id(id: Id) -> Self {
        HeadFilter {
            id: Some(id),
            ..Default::default()
        }
    }
}

/// Extra rows carried by a write so that cross-index state (the
/// `remoteToLocal` side table, merge cursors, conflict-row deletion) commits
/// in the same atomic batch as the item.
#[derive(Debug, Default)]
pub struct WriteExtra {
    /// Parents that live in another tree (merge writes into the local tree).
    /// They are exempt from the parent-existence check; the merge engine
    /// asserts them against the `remoteToLocal` table instead.
    pub foreign_parents: HashSet<Version>,
    /// Raw rows for the meta keyspace.
    pub meta_puts: Vec<(Vec<u8>, Vec<u8>)>,
    /// Conflict-queue rows to delete.
    pub conflict_deletes: Vec<u64>,
}

/// Options for [`Tree::read_stream`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Start after this insertion sequence (exclusive), or at it when
    /// `include_offset` is set.
    pub since: Option<u64>,
    pub include_offset: bool,
    /// Never finish; after draining, wait for the next commit.
    pub tail: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TreeStats {
    pub items: u64,
    pub heads: u64,
}

struct WriterState {
    next_i: u64,
}

struct TreeInner {
    store: Arc<Store>,
    name: String,
    v_size: usize,
    /// Single-writer queue: writes apply in submission order (lock order).
    writer: tokio::sync::Mutex<WriterState>,
    /// Ids with a submitted but not yet committed write.
    pending: Mutex<HashMap<Id, usize>>,
    /// Last committed insertion sequence, bumped after each batch commit.
    committed: watch::Sender<u64>,
}

/// One append-only versioned log with three indices (by version, by id, by
/// insertion sequence) plus the current head set. Cheap to clone; clones
/// share the writer queue.
#[derive(Clone)]
pub struct Tree {
    inner: Arc<TreeInner>,
}

/// Removes the id from the pending set when the write leaves the queue,
/// whether it committed or failed.
struct PendingGuard<'t> {
    inner: &'t TreeInner,
    id: Id,
}

impl<'t> PendingGuard<'t> {
    fn new(inner: &'t TreeInner, id: Id) -> Self {
        let mut pending = inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending.entry(id.clone()).or_insert(0) += 1;
        PendingGuard { inner, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = pending.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&self.id);
            }
        }
    }
}

impl Tree {
    /// Open the tree named `name`, recovering the insertion-sequence cursor
    /// from the last `by_i` row.
    pub async fn open(store: Arc<Store>, name: &str, v_size: usize) -> Result<Tree, PdbError> {
        let scan_store = store.clone();
        let scan_name = name.to_string();
        let last_i = tokio::task::spawn_blocking(move || -> Result<u64, PdbError> {
            let mut last = 0u64;
            for guard in scan_store.by_i.prefix(keys::tree_prefix(&scan_name)) {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                if let Some(i) = keys::parse_i_key(&scan_name, &k) {
                    last = i;
                }
            }
            Ok(last)
        })
        .await
        .map_err(|e| PdbError::Storage(e.to_string()))??;

        let (committed, _) = watch::channel(last_i);
        Ok(Tree {
            inner: Arc::new(TreeInner {
                store,
                name: name.to_string(),
                v_size,
                writer: tokio::sync::Mutex::new(WriterState {
                    next_i: last_i + 1,
                }),
                pending: Mutex::new(HashMap::new()),
                committed,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn v_size(&self) -> usize {
        self.inner.v_size
    }

    /// Last committed insertion sequence (0 when empty).
    pub fn committed_i(&self) -> u64 {
        *self.inner.committed.borrow()
    }

    /// Subscribe to commit notifications; used by tailing read streams.
    pub fn watch_commits(&self) -> watch::Receiver<u64> {
        self.inner.committed.subscribe()
    }

    /// Validate and append one item: all four index rows plus the head-set
    /// update commit in a single atomic batch. The caller's `h.i` is ignored
    /// and reassigned. Returns the stamped item.
    pub async fn write(&self, item: Item) -> Result<Item, PdbError> {
        self.write_with(item, WriteExtra::default()).await
    }

    /// [`Tree::write`] with extra batch rows, see [`WriteExtra`].
    pub async fn write_with(&self, mut item: Item, extra: WriteExtra) -> Result<Item, PdbError> {
        item.h.i = None;
        item.validate(self.inner.v_size)?;

        let _pending = PendingGuard::new(&self.inner, item.h.id.clone());
        let mut writer = self.inner.writer.lock().await;

        let store = self.inner.store.clone();
        let name = self.inner.name.clone();
        let v = item.h.v.clone();
        let pa = item.h.pa.clone();
        let foreign = extra.foreign_parents;
        tokio::task::spawn_blocking(move || -> Result<(), PdbError> {
            if store
                .by_version
                .get(keys::version_key(&name, v.as_bytes()))
                .map_err(fjall_err)?
                .is_some()
            {
                return Err(PdbError::DuplicateVersion);
            }
            for p in &pa {
                if foreign.contains(p) {
                    continue;
                }
                if store
                    .by_version
                    .get(keys::version_key(&name, p.as_bytes()))
                    .map_err(fjall_err)?
                    .is_none()
                {
                    return Err(PdbError::MissingParent);
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| PdbError::Storage(e.to_string()))??;

        let i = writer.next_i;
        item.h.i = Some(i);

        let store = self.inner.store.clone();
        let name = self.inner.name.clone();
        let stamped = item.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PdbError> {
            let id = stamped.h.id.as_bytes();
            let v = stamped.h.v.as_bytes();
            let mut batch = store.db.batch();
            batch.insert(
                &store.by_version,
                keys::version_key(&name, v),
                encode_item(&stamped)?,
            );
            batch.insert(&store.by_id, keys::id_key(&name, id, i), v.to_vec());
            batch.insert(&store.by_i, keys::i_key(&name, i), v.to_vec());
            for p in &stamped.h.pa {
                batch.remove(&store.heads, keys::head_key(&name, id, p.as_bytes()));
            }
            batch.insert(&store.heads, keys::head_key(&name, id, v), Vec::new());
            for (k, val) in extra.meta_puts {
                batch.insert(&store.meta, k, val);
            }
            for n in extra.conflict_deletes {
                batch.remove(&store.conflicts, keys::conflict_key(n));
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(|e| PdbError::Storage(e.to_string()))??;

        writer.next_i = i + 1;
        // send_replace: the commit must be visible even while nobody tails.
        self.inner.committed.send_replace(i);
        Ok(item)
    }

    pub async fn get_by_version(&self, v: &Version) -> Result<Option<Item>, PdbError> {
        let store = self.inner.store.clone();
        let name = self.inner.name.clone();
        let v = v.clone();
        tokio::task::spawn_blocking(move || item_get(&store, &name, v.as_bytes()))
            .await
            .map_err(|e| PdbError::Storage(e.to_string()))?
    }

    /// Current heads matching `filter`. Ordering across ids follows the key
    /// layout; callers selecting by id may assert at most one result.
    pub async fn heads(&self, filter: HeadFilter) -> Result<Vec<Item>, PdbError> {
        let store = self.inner.store.clone();
        let name = self.inner.name.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Item>, PdbError> {
            let prefix = match &filter.id {
                Some(id) => keys::head_prefix(&name, id.as_bytes()),
                None => keys::tree_prefix(&name),
            };
            let mut out = Vec::new();
            for guard in store.heads.prefix(prefix) {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                let Some((id, v)) = keys::split_head_key(&name, &k) else {
                    continue;
                };
                if let Some(wanted) = &filter.prefix {
                    if !id.starts_with(wanted) {
                        continue;
                    }
                }
                let Some(item) = item_get(&store, &name, v)? else {
                    continue;
                };
                if filter.skip_conflicts && item.h.c {
                    continue;
                }
                if filter.skip_deletes && item.h.d {
                    continue;
                }
                out.push(item);
                if let Some(limit) = filter.limit {
                    if out.len() >= limit {
                        break;
                    }
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| PdbError::Storage(e.to_string()))?
    }

    /// The version with the largest insertion sequence, or `None` when the
    /// tree is empty.
    pub async fn last_version(&self) -> Result<Option<Version>, PdbError> {
        let store = self.inner.store.clone();
        let name = self.inner.name.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Version>, PdbError> {
            let mut last = None;
            for guard in store.by_i.prefix(keys::tree_prefix(&name)) {
                let (_, v) = guard.into_inner().map_err(fjall_err)?;
                last = Some(Version::from_bytes(v.to_vec()));
            }
            Ok(last)
        })
        .await
        .map_err(|e| PdbError::Storage(e.to_string()))?
    }

    /// True while a write for `id` sits in the writer queue but has not yet
    /// committed. Head lookups use this to defer a "not found" answer.
    pub fn in_buffer(&self, id: &Id) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Lazy sequence of items in insertion order. Finite unless `tail` is
    /// set, in which case it re-checks after each commit.
    pub fn read_stream(
        &self,
        opts: ReadOptions,
    ) -> impl Stream<Item = Result<Item, PdbError>> + Send + 'static {
        let tree = self.clone();
        try_stream! {
            let mut cursor = match opts.since {
                Some(s) if opts.include_offset => s.saturating_sub(1),
                Some(s) => s,
                None => 0,
            };
            let mut commits = tree.watch_commits();
            'outer: loop {
                let chunk = tree.chunk_after(cursor, STREAM_CHUNK).await?;
                if chunk.is_empty() {
                    if !opts.tail {
                        break;
                    }
                    loop {
                        if *commits.borrow_and_update() > cursor {
                            break;
                        }
                        if commits.changed().await.is_err() {
                            break 'outer;
                        }
                    }
                    continue;
                }
                for item in chunk {
                    cursor = item.h.i.unwrap_or(cursor);
                    yield item;
                }
            }
        }
    }

    /// One drain step of a read stream: items with `i > after`, at most
    /// `limit`.
    async fn chunk_after(&self, after: u64, limit: usize) -> Result<Vec<Item>, PdbError> {
        let store = self.inner.store.clone();
        let name = self.inner.name.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Item>, PdbError> {
            let start = keys::i_key(&name, after.saturating_add(1));
            let end = keys::i_key(&name, u64::MAX);
            let mut out = Vec::new();
            for guard in store.by_i.range(start..=end).take(limit) {
                let (_, v) = guard.into_inner().map_err(fjall_err)?;
                if let Some(item) = item_get(&store, &name, &v)? {
                    out.push(item);
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| PdbError::Storage(e.to_string()))?
    }

    pub async fn stats(&self) -> Result<TreeStats, PdbError> {
        let store = self.inner.store.clone();
        let name = self.inner.name.clone();
        tokio::task::spawn_blocking(move || -> Result<TreeStats, PdbError> {
            let mut items = 0u64;
            for guard in store.by_i.prefix(keys::tree_prefix(&name)) {
                guard.into_inner().map_err(fjall_err)?;
                items += 1;
            }
            let mut heads = 0u64;
            for guard in store.heads.prefix(keys::tree_prefix(&name)) {
                guard.into_inner().map_err(fjall_err)?;
                heads += 1;
            }
            Ok(TreeStats { items, heads })
        })
        .await
        .map_err(|e| PdbError::Storage(e.to_string()))?
    }

    /// Wait until the writer queue is empty. Used by `close()` so that no
    /// batch is in flight when the store handle is dropped.
    pub async fn drain(&self) {
        let _writer = self.inner.writer.lock().await;
    }

    /// Bulk-delete every row of this tree (used when a perspective is
    /// removed). The tree must not have writers attached.
    pub async fn delete_all(&self) -> Result<(), PdbError> {
        let _writer = self.inner.writer.lock().await;
        let store = self.inner.store.clone();
        let name = self.inner.name.clone();
        tokio::task::spawn_blocking(move || -> Result<(), PdbError> {
            let prefix = keys::tree_prefix(&name);
            let mut batch = store.db.batch();
            for ks in [&store.by_version, &store.by_id, &store.by_i, &store.heads, &store.meta] {
                let doomed: Vec<Vec<u8>> = ks
                    .prefix(prefix.clone())
                    .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                    .collect::<Result<_, _>>()?;
                for k in doomed {
                    batch.remove(ks, k);
                }
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(|e| PdbError::Storage(e.to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pdb_types::Header;

    fn open_store(dir: &std::path::Path) -> Arc<Store> {
        Store::open(dir).expect("open store")
    }

    fn item(id: &str, v: &str, pa: &[&str]) -> Item {
        Item::new(
            Header {
                id: id.into(),
                v: v.parse().unwrap(),
                pa: pa.iter().map(|p| p.parse().unwrap()).collect(),
                pe: None,
                i: None,
                d: false,
                c: false,
            },
            Some(bson::doc! {"some": true}),
        )
    }

    #[tokio::test]
    async fn write_then_get_by_version() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        let written = tree.write(item("abc", "Aaaa", &[])).await.unwrap();
        assert_eq!(written.h.i, Some(1));

        let got = tree
            .get_by_version(&"Aaaa".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, written);
        assert!(tree
            .get_by_version(&"Bbbb".parse().unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sequence_is_dense_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        for (n, v) in ["Aaaa", "Bbbb", "Cccc"].iter().enumerate() {
            let pa: Vec<&str> = if n == 0 {
                vec![]
            } else {
                vec![["Aaaa", "Bbbb"][n - 1]]
            };
            let written = tree.write(item("abc", v, &pa)).await.unwrap();
            assert_eq!(written.h.i, Some(n as u64 + 1));
        }
        assert_eq!(tree.committed_i(), 3);
    }

    #[tokio::test]
    async fn write_updates_head_set() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        tree.write(item("abc", "Aaaa", &[])).await.unwrap();
        tree.write(item("abc", "Bbbb", &["Aaaa"])).await.unwrap();

        let heads = tree.heads(HeadFilter::id("abc".into())).await.unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].h.v, "Bbbb".parse().unwrap());
    }

    #[tokio::test]
    async fn divergent_writes_leave_two_heads() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        tree.write(item("abc", "Aaaa", &[])).await.unwrap();
        tree.write(item("abc", "Bbbb", &["Aaaa"])).await.unwrap();
        tree.write(item("abc", "Cccc", &["Aaaa"])).await.unwrap();

        let heads = tree.heads(HeadFilter::id("abc".into())).await.unwrap();
        assert_eq!(heads.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        tree.write(item("abc", "Aaaa", &[])).await.unwrap();
        let err = tree.write(item("abc", "Aaaa", &[])).await.unwrap_err();
        assert!(matches!(err, PdbError::DuplicateVersion));
    }

    #[tokio::test]
    async fn missing_parent_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        let err = tree.write(item("abc", "Bbbb", &["Aaaa"])).await.unwrap_err();
        assert!(matches!(err, PdbError::MissingParent));
    }

    #[tokio::test]
    async fn foreign_parent_exemption() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "l", 3).await.unwrap();

        let mut extra = WriteExtra::default();
        extra.foreign_parents.insert("Aaaa".parse().unwrap());
        tree.write_with(item("abc", "Bbbb", &["Aaaa"]), extra)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn last_version_tracks_largest_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        assert!(tree.last_version().await.unwrap().is_none());
        tree.write(item("abc", "Aaaa", &[])).await.unwrap();
        tree.write(item("xyz", "Bbbb", &[])).await.unwrap();
        assert_eq!(
            tree.last_version().await.unwrap().unwrap(),
            "Bbbb".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();
            tree.write(item("abc", "Aaaa", &[])).await.unwrap();
            tree.write(item("abc", "Bbbb", &["Aaaa"])).await.unwrap();
        }
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();
        let written = tree.write(item("abc", "Cccc", &["Bbbb"])).await.unwrap();
        assert_eq!(written.h.i, Some(3));
    }

    #[tokio::test]
    async fn read_stream_honors_since_and_offset() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        tree.write(item("abc", "Aaaa", &[])).await.unwrap();
        tree.write(item("abc", "Bbbb", &["Aaaa"])).await.unwrap();
        tree.write(item("abc", "Cccc", &["Bbbb"])).await.unwrap();

        let all: Vec<Item> = tree
            .read_stream(ReadOptions::default())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].h.i, Some(1));

        let after: Vec<Item> = tree
            .read_stream(ReadOptions {
                since: Some(2),
                ..Default::default()
            })
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].h.i, Some(3));

        let from: Vec<Item> = tree
            .read_stream(ReadOptions {
                since: Some(2),
                include_offset: true,
                ..Default::default()
            })
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(from.len(), 2);
        assert_eq!(from[0].h.i, Some(2));
    }

    #[tokio::test]
    async fn tail_stream_sees_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        tree.write(item("abc", "Aaaa", &[])).await.unwrap();

        let mut stream = Box::pin(tree.read_stream(ReadOptions {
            tail: true,
            ..Default::default()
        }));
        assert_eq!(
            stream.next().await.unwrap().unwrap().h.v,
            "Aaaa".parse().unwrap()
        );

        let writer = tree.clone();
        tokio::spawn(async move {
            writer.write(item("abc", "Bbbb", &["Aaaa"])).await.unwrap();
        });
        assert_eq!(
            stream.next().await.unwrap().unwrap().h.v,
            "Bbbb".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn delete_all_empties_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let tree = Tree::open(store.clone(), "pe", 3).await.unwrap();
        let other = Tree::open(store, "other", 3).await.unwrap();

        tree.write(item("abc", "Aaaa", &[])).await.unwrap();
        other.write(item("abc", "Aaaa", &[])).await.unwrap();

        tree.delete_all().await.unwrap();
        assert!(tree
            .get_by_version(&"Aaaa".parse().unwrap())
            .await
            .unwrap()
            .is_none());
        assert!(tree.heads(HeadFilter::default()).await.unwrap().is_empty());
        // Sibling trees are untouched.
        assert!(other
            .get_by_version(&"Aaaa".parse().unwrap())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn stats_count_items_and_heads() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        tree.write(item("abc", "Aaaa", &[])).await.unwrap();
        tree.write(item("abc", "Bbbb", &["Aaaa"])).await.unwrap();
        tree.write(item("xyz", "Cccc", &[])).await.unwrap();

        let stats = tree.stats().await.unwrap();
        assert_eq!(stats, TreeStats { items: 3, heads: 2 });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_writes_serialize_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Tree::open(open_store(dir.path()), "pe", 3).await.unwrap();

        let mut handles = Vec::new();
        for n in 0u8..20 {
            let tree = tree.clone();
            handles.push(tokio::spawn(async move {
                let v = Version::from_bytes(vec![n, n, n]);
                tree.write(Item::new(
                    Header {
                        id: format!("id{n}").as_str().into(),
                        v,
                        pa: vec![],
                        pe: None,
                        i: None,
                        d: false,
                        c: false,
                    },
                    Some(bson::doc! {"n": n as i32}),
                ))
                .await
                .unwrap()
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap().h.i.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=20).collect::<Vec<u64>>());
    }
}
