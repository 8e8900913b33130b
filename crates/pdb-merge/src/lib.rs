//! The merge tree: one local history, one staging tree, and one tree per
//! remote perspective, plus the engine that lifts remote histories into the
//! local history through streaming three-way merges.

pub mod conflicts;
pub mod merge;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use pdb_storage::{keys, HeadFilter, ReadOptions, Store, Tree, TreeStats, WriteExtra};
use pdb_types::{
    validate_perspective_name, Header, Id, Item, MergeTreeConfig, PdbError, Version, LOCAL_TREE,
    STAGE_TREE,
};

pub use conflicts::{ConflictRecord, ConflictStore};
pub use merge::{merge_documents, merge_items, MergeCandidate, MergeKind, MergedContent};

/// Delay between head-lookup retries while a write is in the buffer.
const LOOKUP_RETRY: Duration = Duration::from_millis(100);
/// Retry budget for one head lookup (~5s).
const LOOKUP_ATTEMPTS: u32 = 50;
/// Merge candidates buffered between the engine and its consumer.
const MERGE_CHANNEL_CAPACITY: usize = 8;

fn io_err(e: tokio::task::JoinError) -> PdbError {
    PdbError::Storage(e.to_string())
}

/// Single-item lookup over the local tree, used by adapters to fetch the
/// last known local state.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HeadLookupReq {
    #[serde(default)]
    pub id: Option<Id>,
    #[serde(default)]
    pub prefix_exists: Option<Id>,
}

/// Counts reported by [`MergeTree::stats`], dumped on SIGUSR2 by the node.
#[derive(Debug, serde::Serialize)]
pub struct MergeTreeStats {
    pub trees: BTreeMap<String, TreeStats>,
    pub conflicts: u64,
}

/// Tracks how far a perspective's merge cursor may durably advance: never
/// past the lowest remote `i` whose candidate is still unconfirmed.
struct OffsetTracker {
    durable: u64,
    highest: u64,
    pending: BTreeSet<u64>,
}

impl OffsetTracker {
    fn new(start: u64) -> Self {
        OffsetTracker {
            durable: start,
            highest: start,
            pending: BTreeSet::new(),
        }
    }

    fn begin(&mut self, i: u64) {
        self.pending.insert(i);
        self.highest = self.highest.max(i);
    }

    fn complete(&mut self, i: u64) -> u64 {
        self.pending.remove(&i);
        let low = match self.pending.first() {
            Some(lowest_pending) => lowest_pending.saturating_sub(1),
            None => self.highest,
        };
        self.durable = self.durable.max(low);
        self.durable
    }
}

struct Inner {
    store: Arc<Store>,
    cfg: MergeTreeConfig,
    local: Tree,
    stage: Tree,
    remotes: HashMap<String, Tree>,
    conflicts: ConflictStore,
    local_busy: AtomicBool,
    auto_merging: AtomicBool,
    merging: AtomicBool,
    closed: AtomicBool,
    trackers: tokio::sync::Mutex<HashMap<String, OffsetTracker>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), PdbError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PdbError::Closed)
        } else {
            Ok(())
        }
    }

    /// Store I/O errors are fatal: the merge tree transitions to closed and
    /// rejects further operations.
    fn note<T>(&self, result: Result<T, PdbError>) -> Result<T, PdbError> {
        result.map_err(|e| self.note_err(e))
    }

    fn note_err(&self, e: PdbError) -> PdbError {
        if matches!(e, PdbError::Storage(_)) {
            self.closed.store(true, Ordering::SeqCst);
        }
        e
    }
}

/// Handle to one merge tree. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MergeTree {
    inner: Arc<Inner>,
}

impl MergeTree {
    /// Open the store at `path` and the `_local`, `_stage` and perspective
    /// trees.
    pub async fn open(
        path: &Path,
        cfg: MergeTreeConfig,
        perspectives: &[String],
    ) -> Result<MergeTree, PdbError> {
        if cfg.v_size == 0 || cfg.v_size > 16 {
            return Err(PdbError::MalformedItem(format!(
                "v_size {} out of range",
                cfg.v_size
            )));
        }
        if cfg.v_size < 4 {
            tracing::warn!(
                v_size = cfg.v_size,
                "small version size: collisions per id become likely around 2^{} items",
                cfg.v_size * 4
            );
        }
        for name in perspectives {
            validate_perspective_name(name)?;
        }

        let store = Store::open(path)?;
        let local = Tree::open(store.clone(), LOCAL_TREE, cfg.v_size).await?;
        let stage = Tree::open(store.clone(), STAGE_TREE, cfg.v_size).await?;
        let mut remotes = HashMap::new();
        for name in perspectives {
            remotes.insert(
                name.clone(),
                Tree::open(store.clone(), name, cfg.v_size).await?,
            );
        }
        let conflicts = ConflictStore::open(store.clone()).await?;

        Ok(MergeTree {
            inner: Arc::new(Inner {
                store,
                cfg,
                local,
                stage,
                remotes,
                conflicts,
                local_busy: AtomicBool::new(false),
                auto_merging: AtomicBool::new(false),
                merging: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                trackers: tokio::sync::Mutex::new(HashMap::new()),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn v_size(&self) -> usize {
        self.inner.cfg.v_size
    }

    /// The local (merged) history. Read-only access; writes go through
    /// [`MergeTree::local_writer`].
    pub fn local_tree(&self) -> &Tree {
        &self.inner.local
    }

    pub fn remote_tree(&self, pe: &str) -> Result<Tree, PdbError> {
        self.inner
            .remotes
            .get(pe)
            .cloned()
            .ok_or_else(|| PdbError::UnknownPerspective(pe.to_string()))
    }

    pub fn perspectives(&self) -> Vec<String> {
        self.inner.remotes.keys().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Write streams
    // -----------------------------------------------------------------------

    /// Writer for incoming items of one perspective.
    pub fn remote_writer(&self, pe: &str) -> Result<RemoteWriter, PdbError> {
        self.inner.ensure_open()?;
        let tree = self.remote_tree(pe)?;
        Ok(RemoteWriter {
            inner: self.inner.clone(),
            pe: pe.to_string(),
            tree,
            broken: false,
        })
    }

    /// Writer for locally-authored items and merge confirmations. At most
    /// one may be open at a time.
    pub fn local_writer(&self) -> Result<LocalWriter, PdbError> {
        self.inner.ensure_open()?;
        if self.inner.local_busy.swap(true, Ordering::SeqCst) {
            return Err(PdbError::LocalWriterBusy);
        }
        Ok(LocalWriter {
            inner: self.inner.clone(),
            broken: AtomicBool::new(false),
        })
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Lazy stream of merge candidates, one per new remote item, resuming
    /// from the durable per-perspective cursors. Conflicts are recorded on
    /// the side and never surface as stream errors.
    ///
    /// The engine is pull-driven and lock-steps each perspective: the next
    /// candidate of a perspective is computed only after the previous one
    /// was confirmed into the local tree.
    pub fn start_merge(&self) -> Result<MergeStream, PdbError> {
        self.inner.ensure_open()?;
        if self.inner.merging.swap(true, Ordering::SeqCst) {
            return Err(PdbError::AlreadyAutoMerging);
        }
        let (tx, rx) = mpsc::channel(MERGE_CHANNEL_CAPACITY);
        let mut tasks = Vec::new();
        for (pe, tree) in self.inner.remotes.clone() {
            tasks.push(tokio::spawn(merge_loop(
                self.inner.clone(),
                pe,
                tree,
                tx.clone(),
            )));
        }
        Ok(MergeStream {
            rx: ReceiverStream::new(rx),
            inner: self.inner.clone(),
            tasks,
        })
    }

    /// Pipe the merge stream into the local writer. Fails when an external
    /// local writer is attached or auto-merge is already engaged.
    pub fn auto_merge(&self) -> Result<(), PdbError> {
        self.inner.ensure_open()?;
        if self.inner.auto_merging.swap(true, Ordering::SeqCst) {
            return Err(PdbError::AlreadyAutoMerging);
        }
        let writer = match self.local_writer() {
            Ok(w) => w,
            Err(e) => {
                self.inner.auto_merging.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let stream = match self.start_merge() {
            Ok(s) => s,
            Err(e) => {
                self.inner.auto_merging.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(next) = stream.next().await {
                let candidate = match next {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!(error = %e, "merge stream failed");
                        break;
                    }
                };
                let pe = candidate.pe.clone();
                match writer.confirm(&candidate).await {
                    Ok(item) => {
                        tracing::debug!(
                            pe = %pe,
                            id = ?item.h.id,
                            v = %item.h.v,
                            kind = ?candidate.kind,
                            "merged into local tree"
                        );
                    }
                    Err(e) => {
                        tracing::error!(pe = %pe, error = %e, "merge confirmation failed");
                        break;
                    }
                }
            }
            inner.auto_merging.store(false, Ordering::SeqCst);
        });
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Head lookup
    // -----------------------------------------------------------------------

    /// Resolve `{id}` or `{prefixExists}` against the local tree only.
    ///
    /// A "not found" answer is deferred while a write for the id sits in the
    /// write buffer, in ~100ms steps up to a bounded budget.
    pub async fn head_lookup(&self, req: &HeadLookupReq) -> Result<Option<Item>, PdbError> {
        self.inner.ensure_open()?;
        if let Some(id) = &req.id {
            for _ in 0..LOOKUP_ATTEMPTS {
                let mut heads = self
                    .inner
                    .local
                    .heads(HeadFilter {
                        id: Some(id.clone()),
                        skip_conflicts: true,
                        skip_deletes: true,
                        ..Default::default()
                    })
                    .await?;
                if heads.len() > 1 {
                    return Err(PdbError::HeadAmbiguous);
                }
                if let Some(head) = heads.pop() {
                    return Ok(Some(head));
                }
                if !self.inner.local.in_buffer(id) {
                    return Ok(None);
                }
                tokio::time::sleep(LOOKUP_RETRY).await;
            }
            return Ok(None);
        }
        if let Some(prefix) = &req.prefix_exists {
            let mut heads = self
                .inner
                .local
                .heads(HeadFilter {
                    prefix: Some(prefix.as_bytes().to_vec()),
                    skip_conflicts: true,
                    skip_deletes: true,
                    limit: Some(1),
                    ..Default::default()
                })
                .await?;
            return Ok(heads.pop());
        }
        Err(PdbError::MalformedItem(
            "head lookup needs id or prefixExists".into(),
        ))
    }

    // -----------------------------------------------------------------------
    // Conflicts
    // -----------------------------------------------------------------------

    pub async fn get_conflicts(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<(u64, ConflictRecord)>, PdbError> {
        self.inner.ensure_open()?;
        self.inner.conflicts.list(limit).await
    }

    pub async fn get_conflict(&self, n: u64) -> Result<Option<ConflictRecord>, PdbError> {
        self.inner.ensure_open()?;
        self.inner.conflicts.get(n).await
    }

    /// Record the chosen outcome of a stored conflict into the local tree
    /// and delete the row, in one batch. Returns `None` when no such row
    /// exists (already resolved).
    pub async fn resolve_conflict(
        &self,
        n: u64,
        resolution: Resolution,
    ) -> Result<Option<Item>, PdbError> {
        self.inner.ensure_open()?;
        let Some(record) = self.inner.conflicts.get(n).await? else {
            return Ok(None);
        };

        let (body, deleted) = match resolution {
            Resolution::KeepLocal => {
                let local = record.l.as_ref().ok_or_else(|| {
                    PdbError::MalformedItem("conflict has no local side to keep".into())
                })?;
                (local.b.clone(), local.h.d)
            }
            Resolution::TakeRemote => (record.n.b.clone(), record.n.h.d),
            Resolution::Body(doc) => (Some(doc), false),
            Resolution::Delete => (None, true),
        };

        let mut pa = Vec::new();
        if let Some(local_head) = &record.l {
            pa.push(local_head.h.v.clone());
        }
        pa.push(record.n.h.v.clone());

        let item = Item::new(
            Header {
                id: record.n.h.id.clone(),
                v: Version::random(self.inner.cfg.v_size),
                pa,
                pe: None,
                i: None,
                d: deleted,
                c: false,
            },
            if deleted { None } else { body },
        );

        let mut extra = WriteExtra::default();
        extra.foreign_parents.insert(record.n.h.v.clone());
        extra.meta_puts.push((
            keys::rtl_key(record.n.h.v.as_bytes()),
            item.h.v.as_bytes().to_vec(),
        ));
        extra.conflict_deletes.push(n);

        let written = self.inner.note(self.inner.local.write_with(item, extra).await)?;
        Ok(Some(written))
    }

    // -----------------------------------------------------------------------
    // Introspection & shutdown
    // -----------------------------------------------------------------------

    pub async fn stats(&self) -> Result<MergeTreeStats, PdbError> {
        self.inner.ensure_open()?;
        let mut trees = BTreeMap::new();
        trees.insert(LOCAL_TREE.to_string(), self.inner.local.stats().await?);
        trees.insert(STAGE_TREE.to_string(), self.inner.stage.stats().await?);
        for (pe, tree) in &self.inner.remotes {
            trees.insert(pe.clone(), tree.stats().await?);
        }
        Ok(MergeTreeStats {
            trees,
            conflicts: self.inner.conflicts.count().await?,
        })
    }

    /// Drain writers and shut the engine down. Idempotent; every operation
    /// after this fails with [`PdbError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.inner.local.drain().await;
        self.inner.stage.drain().await;
        for tree in self.inner.remotes.values() {
            tree.drain().await;
        }
    }
}

/// Outcome chosen for a stored conflict.
#[derive(Debug, Clone)]
pub enum Resolution {
    KeepLocal,
    TakeRemote,
    Body(bson::Document),
    Delete,
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

/// Accepts incoming items of one perspective. After an error the writer is
/// closed; the caller must reattach.
pub struct RemoteWriter {
    inner: Arc<Inner>,
    pe: String,
    tree: Tree,
    broken: bool,
}

impl RemoteWriter {
    pub fn perspective(&self) -> &str {
        &self.pe
    }

    pub async fn write(&mut self, mut item: Item) -> Result<Item, PdbError> {
        self.inner.ensure_open()?;
        if self.broken {
            return Err(PdbError::Closed);
        }
        match &item.h.pe {
            None => item.h.pe = Some(self.pe.clone()),
            Some(pe) if pe == &self.pe => {}
            Some(pe) => {
                self.broken = true;
                return Err(PdbError::MalformedItem(format!(
                    "item names perspective '{pe}', channel is '{}'",
                    self.pe
                )));
            }
        }
        let result = self.inner.note(self.tree.write(item).await);
        if result.is_err() {
            self.broken = true;
        }
        result
    }
}

/// The single local write stream. Dropping it releases the slot. Like the
/// remote write streams, it closes on the first failed write.
pub struct LocalWriter {
    inner: Arc<Inner>,
    broken: AtomicBool,
}

impl LocalWriter {
    fn ensure_usable(&self) -> Result<(), PdbError> {
        self.inner.ensure_open()?;
        if self.broken.load(Ordering::SeqCst) {
            return Err(PdbError::Closed);
        }
        Ok(())
    }

    fn track<T>(&self, result: Result<T, PdbError>) -> Result<T, PdbError> {
        if result.is_err() {
            self.broken.store(true, Ordering::SeqCst);
        }
        self.inner.note(result)
    }

    /// Write a locally-authored item. Parents must already exist in the
    /// local tree.
    pub async fn write(&self, item: Item) -> Result<Item, PdbError> {
        self.ensure_usable()?;
        if item.h.pe.is_some() {
            self.broken.store(true, Ordering::SeqCst);
            return Err(PdbError::MalformedItem(
                "local items must not name a perspective".into(),
            ));
        }
        let result = self.inner.local.write(item).await;
        self.track(result)
    }

    /// Confirm a merge candidate: the item, its `remoteToLocal` rows and the
    /// advanced merge cursor commit in one batch.
    pub async fn confirm(&self, candidate: &MergeCandidate) -> Result<Item, PdbError> {
        self.ensure_usable()?;
        let mut extra = WriteExtra {
            foreign_parents: candidate.foreign_parents.clone(),
            ..Default::default()
        };
        for (remote_v, local_v) in &candidate.rtl {
            extra
                .meta_puts
                .push((keys::rtl_key(remote_v.as_bytes()), local_v.as_bytes().to_vec()));
        }
        {
            let mut trackers = self.inner.trackers.lock().await;
            if let Some(tracker) = trackers.get_mut(&candidate.pe) {
                let low = tracker.complete(candidate.remote_i);
                extra.meta_puts.push((
                    keys::merge_offset_key(&candidate.pe),
                    pdb_storage::encode(&low)?,
                ));
            }
        }
        let result = self
            .inner
            .local
            .write_with(candidate.item.clone(), extra)
            .await;
        self.track(result)
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        self.inner.local_busy.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Merge stream
// ---------------------------------------------------------------------------

/// Stream of merge candidates. Dropping it cancels the per-perspective merge
/// loops at their next suspension point.
pub struct MergeStream {
    rx: ReceiverStream<Result<MergeCandidate, PdbError>>,
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Stream for MergeStream {
    type Item = Result<MergeCandidate, PdbError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for MergeStream {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.inner.merging.store(false, Ordering::SeqCst);
    }
}

async fn read_merge_offset(store: &Arc<Store>, pe: &str) -> Result<u64, PdbError> {
    let store = store.clone();
    let key = keys::merge_offset_key(pe);
    tokio::task::spawn_blocking(move || -> Result<u64, PdbError> {
        match store.meta.get(key).map_err(pdb_storage::fjall_err)? {
            Some(bytes) => pdb_storage::decode(&bytes),
            None => Ok(0),
        }
    })
    .await
    .map_err(io_err)?
}

async fn write_merge_offset(store: &Arc<Store>, pe: &str, offset: u64) -> Result<(), PdbError> {
    let store = store.clone();
    let key = keys::merge_offset_key(pe);
    let value = pdb_storage::encode(&offset)?;
    tokio::task::spawn_blocking(move || {
        store
            .meta
            .insert(key, value)
            .map_err(pdb_storage::fjall_err)
    })
    .await
    .map_err(io_err)?
}

/// Wait until the candidate's item shows up in the local tree (confirmation)
/// or the consumer goes away.
async fn wait_confirmed(
    local: &Tree,
    v: &Version,
    tx: &mpsc::Sender<Result<MergeCandidate, PdbError>>,
) -> Result<bool, PdbError> {
    let mut commits = local.watch_commits();
    loop {
        if local.get_by_version(v).await?.is_some() {
            return Ok(true);
        }
        tokio::select! {
            _ = tx.closed() => return Ok(false),
            changed = commits.changed() => {
                if changed.is_err() {
                    return Ok(false);
                }
            }
        }
    }
}

/// Per-perspective engine: tail the remote tree from the durable cursor,
/// pair every item with the local head of its id, and emit the outcome.
async fn merge_loop(
    inner: Arc<Inner>,
    pe: String,
    tree: Tree,
    tx: mpsc::Sender<Result<MergeCandidate, PdbError>>,
) {
    let start = match read_merge_offset(&inner.store, &pe).await {
        Ok(offset) => offset,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            return;
        }
    };
    inner
        .trackers
        .lock()
        .await
        .insert(pe.clone(), OffsetTracker::new(start));

    let mut items = Box::pin(tree.read_stream(ReadOptions {
        since: Some(start),
        tail: true,
        ..Default::default()
    }));

    while let Some(next) = items.next().await {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let item = match next {
            Ok(item) => item,
            Err(e) => {
                let _ = tx.send(Err(inner.note_err(e))).await;
                return;
            }
        };
        let remote_i = item.h.i.unwrap_or(0);
        if let Some(tracker) = inner.trackers.lock().await.get_mut(&pe) {
            tracker.begin(remote_i);
        }

        let outcome =
            merge::compute(&inner.store, &inner.local, &tree, &pe, &item, inner.cfg.v_size).await;
        match outcome {
            Err(e) => {
                let _ = tx.send(Err(inner.note_err(e))).await;
                return;
            }
            Ok(merge::MergeOutcome::Noop) => {
                let low = match inner.trackers.lock().await.get_mut(&pe) {
                    Some(tracker) => tracker.complete(remote_i),
                    None => remote_i,
                };
                if let Err(e) = write_merge_offset(&inner.store, &pe, low).await {
                    let _ = tx.send(Err(inner.note_err(e))).await;
                    return;
                }
            }
            Ok(merge::MergeOutcome::Conflict(record)) => {
                let low = match inner.trackers.lock().await.get_mut(&pe) {
                    Some(tracker) => tracker.complete(remote_i),
                    None => remote_i,
                };
                let err = record.err.clone();
                let offset_row = match pdb_storage::encode(&low) {
                    Ok(value) => vec![(keys::merge_offset_key(&pe), value)],
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                match inner.conflicts.append(record, offset_row).await {
                    Ok(n) => {
                        tracing::info!(pe = %pe, n, error = %err, "merge conflict recorded");
                    }
                    Err(e) => {
                        let _ = tx.send(Err(inner.note_err(e))).await;
                        return;
                    }
                }
            }
            Ok(merge::MergeOutcome::Candidate(candidate)) => {
                // Durable staging record; replay after a crash synthesizes a
                // fresh attempt, duplicate adoption is suppressed by the
                // remoteToLocal table.
                let stage_extra = WriteExtra {
                    foreign_parents: candidate.item.h.pa.iter().cloned().collect(),
                    ..Default::default()
                };
                if let Err(e) = inner
                    .stage
                    .write_with(candidate.item.clone(), stage_extra)
                    .await
                {
                    let _ = tx.send(Err(inner.note_err(e))).await;
                    return;
                }
                let confirm_v = candidate.item.h.v.clone();
                if tx.send(Ok(candidate)).await.is_err() {
                    return;
                }
                match wait_confirmed(&inner.local, &confirm_v, &tx).await {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        let _ = tx.send(Err(inner.note_err(e))).await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn remote_item(id: &str, v: &str, pa: &[&str], b: Option<bson::Document>) -> Item {
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
            b,
        )
    }

    fn local_item(id: &str, v: &str, pa: &[&str], b: Option<bson::Document>) -> Item {
        remote_item(id, v, pa, b)
    }

    fn tombstone(id: &str, v: &str, pa: &[&str]) -> Item {
        let mut item = remote_item(id, v, pa, None);
        item.h.d = true;
        item
    }

    async fn open_mt(dir: &std::path::Path) -> MergeTree {
        MergeTree::open(
            dir,
            MergeTreeConfig::default(),
            &["someClient".to_string()],
        )
        .await
        .unwrap()
    }

    /// Poll until `cond` holds; panics after ~5s.
    async fn wait_until<F, Fut>(what: &str, mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if cond().await {
                return;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for: {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn local_items(mt: &MergeTree) -> Vec<Item> {
        use futures::StreamExt;
        mt.local_tree()
            .read_stream(ReadOptions::default())
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn two_item_remote_import() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        let mut writer = mt.remote_writer("someClient").unwrap();
        writer
            .write(remote_item("abc", "Aaaa", &[], Some(bson::doc! {"some": true})))
            .await
            .unwrap();
        writer
            .write(remote_item(
                "abc",
                "Bbbb",
                &["Aaaa"],
                Some(bson::doc! {"some": "other"}),
            ))
            .await
            .unwrap();

        // The perspective tree holds both items, pe stamped in, i = 1, 2.
        use futures::StreamExt;
        let imported: Vec<Item> = mt
            .remote_tree("someClient")
            .unwrap()
            .read_stream(ReadOptions::default())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(imported.len(), 2);
        assert_eq!(imported[0].h.pe.as_deref(), Some("someClient"));
        assert_eq!(imported[0].h.i, Some(1));
        assert_eq!(imported[1].h.i, Some(2));

        mt.auto_merge().unwrap();
        wait_until("local tree has two items", || async {
            mt.local_tree().stats().await.unwrap().items == 2
        })
        .await;

        let merged = local_items(&mt).await;
        assert_eq!(merged.len(), 2);
        // Fresh versions, parent chain preserved.
        assert_ne!(merged[0].h.v, "Aaaa".parse().unwrap());
        assert!(merged[0].h.pa.is_empty());
        assert_eq!(merged[1].h.pa, vec![merged[0].h.v.clone()]);
        assert_eq!(merged[0].b, Some(bson::doc! {"some": true}));
        assert_eq!(merged[1].b, Some(bson::doc! {"some": "other"}));
        assert!(merged.iter().all(|item| item.h.pe.is_none()));

        mt.close().await;
    }

    #[tokio::test]
    async fn fast_forward_adoption() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        {
            let writer = mt.local_writer().unwrap();
            writer
                .write(local_item("x", "Aaaa", &[], Some(bson::doc! {"n": 1})))
                .await
                .unwrap();
        }

        // The peer publishes a descendant of our head, naming our version.
        let mut writer = mt.remote_writer("someClient").unwrap();
        writer
            .write(remote_item("x", "Bbbb", &["Aaaa"], Some(bson::doc! {"n": 2})))
            .await
            .unwrap();

        mt.auto_merge().unwrap();
        wait_until("fast-forward lands", || async {
            mt.local_tree().stats().await.unwrap().items == 2
        })
        .await;

        let items = local_items(&mt).await;
        let ff = &items[1];
        assert_eq!(ff.h.pa, vec!["Aaaa".parse().unwrap()]);
        assert_eq!(ff.b, Some(bson::doc! {"n": 2}));
        assert_ne!(ff.h.v, "Bbbb".parse().unwrap());

        let head = mt
            .head_lookup(&HeadLookupReq {
                id: Some("x".into()),
                prefix_exists: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.h.v, ff.h.v);
        mt.close().await;
    }

    #[tokio::test]
    async fn concurrent_divergent_edits_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        {
            let writer = mt.local_writer().unwrap();
            writer
                .write(local_item("abc", "Aaaa", &[], Some(bson::doc! {"a": 1, "b": 1})))
                .await
                .unwrap();
            writer
                .write(local_item(
                    "abc",
                    "Cccc",
                    &["Aaaa"],
                    Some(bson::doc! {"a": 2, "b": 1}),
                ))
                .await
                .unwrap();
        }

        let mut writer = mt.remote_writer("someClient").unwrap();
        writer
            .write(remote_item(
                "abc",
                "Dddd",
                &["Aaaa"],
                Some(bson::doc! {"a": 1, "b": 2}),
            ))
            .await
            .unwrap();

        mt.auto_merge().unwrap();
        wait_until("merge lands", || async {
            mt.local_tree().stats().await.unwrap().items == 3
        })
        .await;

        let items = local_items(&mt).await;
        let merged = &items[2];
        assert_eq!(merged.b, Some(bson::doc! {"a": 2, "b": 2}));
        assert_eq!(
            merged.h.pa,
            vec!["Cccc".parse().unwrap(), "Dddd".parse().unwrap()]
        );
        // The merged item is the single non-conflict head.
        let head = mt
            .head_lookup(&HeadLookupReq {
                id: Some("abc".into()),
                prefix_exists: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.h.v, merged.h.v);
        mt.close().await;
    }

    #[tokio::test]
    async fn field_conflict_goes_to_the_conflict_store() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        {
            let writer = mt.local_writer().unwrap();
            writer
                .write(local_item("abc", "Aaaa", &[], Some(bson::doc! {"a": 1})))
                .await
                .unwrap();
            writer
                .write(local_item("abc", "Cccc", &["Aaaa"], Some(bson::doc! {"a": 2})))
                .await
                .unwrap();
        }
        let mut writer = mt.remote_writer("someClient").unwrap();
        writer
            .write(remote_item("abc", "Dddd", &["Aaaa"], Some(bson::doc! {"a": 3})))
            .await
            .unwrap();

        mt.auto_merge().unwrap();
        wait_until("conflict row recorded", || async {
            !mt.get_conflicts(None).await.unwrap().is_empty()
        })
        .await;

        // No merged item entered the local tree.
        assert_eq!(mt.local_tree().stats().await.unwrap().items, 2);

        let (n, record) = mt.get_conflicts(None).await.unwrap().remove(0);
        assert_eq!(n, 1);
        assert_eq!(record.pe, "someClient");
        assert!(record.err.contains('a'), "err names the field: {}", record.err);
        assert_eq!(record.n.h.v, "Dddd".parse().unwrap());
        assert_eq!(record.l.as_ref().unwrap().h.v, "Cccc".parse().unwrap());
        assert_eq!(record.lcas, vec!["Aaaa".parse().unwrap()]);
        mt.close().await;
    }

    #[tokio::test]
    async fn delete_vs_modify_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        {
            let writer = mt.local_writer().unwrap();
            writer
                .write(local_item("abc", "Aaaa", &[], Some(bson::doc! {"a": 1})))
                .await
                .unwrap();
            writer.write(tombstone("abc", "Cccc", &["Aaaa"])).await.unwrap();
        }
        let mut writer = mt.remote_writer("someClient").unwrap();
        writer
            .write(remote_item("abc", "Dddd", &["Aaaa"], Some(bson::doc! {"a": 2})))
            .await
            .unwrap();

        mt.auto_merge().unwrap();
        wait_until("conflict row recorded", || async {
            !mt.get_conflicts(None).await.unwrap().is_empty()
        })
        .await;

        let (_, record) = mt.get_conflicts(None).await.unwrap().remove(0);
        assert!(record.err.contains("delete"));
        mt.close().await;
    }

    #[tokio::test]
    async fn head_lookup_sees_inflight_write() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;
        let writer = mt.local_writer().unwrap();

        // The write enters the buffer synchronously on first poll, so the
        // lookup must defer rather than answer "not found".
        let head_lookup_req = HeadLookupReq {
            id: Some("y".into()),
            prefix_exists: None,
        };
        let (written, found) = tokio::join!(
            writer.write(local_item("y", "Aaaa", &[], Some(bson::doc! {"ok": true}))),
            mt.head_lookup(&head_lookup_req)
        );
        let written = written.unwrap();
        let found = found.unwrap().expect("lookup must see the pending write");
        assert_eq!(found.h.v, written.h.v);
        mt.close().await;
    }

    #[tokio::test]
    async fn head_lookup_filters_and_ambiguity() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;
        let writer = mt.local_writer().unwrap();

        writer
            .write(local_item("abc", "Aaaa", &[], Some(bson::doc! {"a": 1})))
            .await
            .unwrap();
        writer.write(tombstone("abc", "Bbbb", &["Aaaa"])).await.unwrap();

        // A deleted head means "no head".
        assert!(mt
            .head_lookup(&HeadLookupReq {
                id: Some("abc".into()),
                prefix_exists: None
            })
            .await
            .unwrap()
            .is_none());

        // Two live heads: refuse to pick one.
        writer
            .write(local_item("xyz", "Cccc", &[], Some(bson::doc! {"n": 1})))
            .await
            .unwrap();
        writer
            .write(local_item("xyz", "Dddd", &["Cccc"], Some(bson::doc! {"n": 2})))
            .await
            .unwrap();
        writer
            .write(local_item("xyz", "Eeee", &["Cccc"], Some(bson::doc! {"n": 3})))
            .await
            .unwrap();
        assert!(matches!(
            mt.head_lookup(&HeadLookupReq {
                id: Some("xyz".into()),
                prefix_exists: None
            })
            .await,
            Err(PdbError::HeadAmbiguous)
        ));

        // Prefix probe finds the surviving head.
        let head = mt
            .head_lookup(&HeadLookupReq {
                id: None,
                prefix_exists: Some("xy".into()),
            })
            .await;
        // Both xyz heads match the prefix; the probe returns the first.
        assert!(head.unwrap().is_some());
        mt.close().await;
    }

    #[tokio::test]
    async fn local_writer_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        let first = mt.local_writer().unwrap();
        assert!(matches!(mt.local_writer(), Err(PdbError::LocalWriterBusy)));
        drop(first);
        let _second = mt.local_writer().unwrap();
        mt.close().await;
    }

    #[tokio::test]
    async fn auto_merge_excludes_external_writer() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        mt.auto_merge().unwrap();
        assert!(matches!(mt.local_writer(), Err(PdbError::LocalWriterBusy)));
        assert!(matches!(mt.auto_merge(), Err(PdbError::AlreadyAutoMerging)));
        mt.close().await;
    }

    #[tokio::test]
    async fn external_merge_stream_confirms_in_lock_step() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        let mut writer = mt.remote_writer("someClient").unwrap();
        writer
            .write(remote_item("abc", "Aaaa", &[], Some(bson::doc! {"n": 1})))
            .await
            .unwrap();
        writer
            .write(remote_item("abc", "Bbbb", &["Aaaa"], Some(bson::doc! {"n": 2})))
            .await
            .unwrap();

        let local = mt.local_writer().unwrap();
        let mut stream = mt.start_merge().unwrap();
        assert!(matches!(mt.start_merge(), Err(PdbError::AlreadyAutoMerging)));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.kind, MergeKind::FastForward);
        local.confirm(&first).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.remote_i, 2);
        local.confirm(&second).await.unwrap();

        assert_eq!(mt.local_tree().stats().await.unwrap().items, 2);
        mt.close().await;
    }

    #[tokio::test]
    async fn readopting_a_merged_head_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        let mut writer = mt.remote_writer("someClient").unwrap();
        let x = writer
            .write(remote_item("abc", "Aaaa", &[], Some(bson::doc! {"n": 1})))
            .await
            .unwrap();
        mt.auto_merge().unwrap();
        wait_until("adoption lands", || async {
            mt.local_tree().stats().await.unwrap().items == 1
        })
        .await;

        // Replaying the same remote item must be suppressed through the
        // remoteToLocal table.
        let outcome = merge::compute(
            &mt.inner.store,
            &mt.inner.local,
            &mt.remote_tree("someClient").unwrap(),
            "someClient",
            &x,
            mt.v_size(),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, merge::MergeOutcome::Noop));
        mt.close().await;
    }

    #[tokio::test]
    async fn merge_cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mt = open_mt(dir.path()).await;
            let mut writer = mt.remote_writer("someClient").unwrap();
            writer
                .write(remote_item("abc", "Aaaa", &[], Some(bson::doc! {"n": 1})))
                .await
                .unwrap();
            writer
                .write(remote_item("abc", "Bbbb", &["Aaaa"], Some(bson::doc! {"n": 2})))
                .await
                .unwrap();
            mt.auto_merge().unwrap();
            wait_until("both items merged", || async {
                mt.local_tree().stats().await.unwrap().items == 2
            })
            .await;
            mt.close().await;
        }
        // Let aborted merge loops release their store handles.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mt = open_mt(dir.path()).await;
        mt.auto_merge().unwrap();
        // Give the merge loops a chance to (wrongly) replay.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mt.local_tree().stats().await.unwrap().items, 2);
        mt.close().await;
    }

    #[tokio::test]
    async fn resolve_conflict_take_remote() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        {
            let writer = mt.local_writer().unwrap();
            writer
                .write(local_item("abc", "Aaaa", &[], Some(bson::doc! {"a": 1})))
                .await
                .unwrap();
            writer
                .write(local_item("abc", "Cccc", &["Aaaa"], Some(bson::doc! {"a": 2})))
                .await
                .unwrap();
        }
        let mut writer = mt.remote_writer("someClient").unwrap();
        writer
            .write(remote_item("abc", "Dddd", &["Aaaa"], Some(bson::doc! {"a": 3})))
            .await
            .unwrap();
        mt.auto_merge().unwrap();
        wait_until("conflict row recorded", || async {
            !mt.get_conflicts(None).await.unwrap().is_empty()
        })
        .await;

        let (n, _) = mt.get_conflicts(None).await.unwrap().remove(0);
        let resolved = mt
            .resolve_conflict(n, Resolution::TakeRemote)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.b, Some(bson::doc! {"a": 3}));
        assert_eq!(
            resolved.h.pa,
            vec!["Cccc".parse().unwrap(), "Dddd".parse().unwrap()]
        );

        assert!(mt.get_conflict(n).await.unwrap().is_none());
        // Re-resolving an already cleared row is a no-op.
        assert!(mt
            .resolve_conflict(n, Resolution::TakeRemote)
            .await
            .unwrap()
            .is_none());

        let head = mt
            .head_lookup(&HeadLookupReq {
                id: Some("abc".into()),
                prefix_exists: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.h.v, resolved.h.v);
        mt.close().await;
    }

    #[tokio::test]
    async fn unknown_perspective_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;
        assert!(matches!(
            mt.remote_writer("nobody"),
            Err(PdbError::UnknownPerspective(_))
        ));
        mt.close().await;
    }

    #[tokio::test]
    async fn remote_writer_closes_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;
        let mut writer = mt.remote_writer("someClient").unwrap();

        let mut wrong = remote_item("abc", "Aaaa", &[], Some(bson::doc! {}));
        wrong.h.pe = Some("somebodyElse".into());
        assert!(matches!(
            writer.write(wrong).await,
            Err(PdbError::MalformedItem(_))
        ));
        // The stream is closed; it must be re-opened by the caller.
        assert!(matches!(
            writer
                .write(remote_item("abc", "Bbbb", &[], Some(bson::doc! {})))
                .await,
            Err(PdbError::Closed)
        ));
        mt.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;
        mt.close().await;
        mt.close().await;
        assert!(matches!(mt.local_writer(), Err(PdbError::Closed)));
        assert!(matches!(
            mt.head_lookup(&HeadLookupReq {
                id: Some("x".into()),
                prefix_exists: None
            })
            .await,
            Err(PdbError::Closed)
        ));
    }

    #[tokio::test]
    async fn stats_cover_all_trees() {
        let dir = tempfile::tempdir().unwrap();
        let mt = open_mt(dir.path()).await;

        let mut writer = mt.remote_writer("someClient").unwrap();
        writer
            .write(remote_item("abc", "Aaaa", &[], Some(bson::doc! {"n": 1})))
            .await
            .unwrap();
        mt.auto_merge().unwrap();
        wait_until("adoption lands", || async {
            mt.local_tree().stats().await.unwrap().items == 1
        })
        .await;

        let stats = mt.stats().await.unwrap();
        assert_eq!(stats.trees[LOCAL_TREE].items, 1);
        assert_eq!(stats.trees["someClient"].items, 1);
        assert!(stats.trees.contains_key(STAGE_TREE));
        assert_eq!(stats.conflicts, 0);
        mt.close().await;
    }
}
