//! The three-way merge: LCA discovery across the remote and local DAGs under
//! the `remoteToLocal` equivalence, fast-forward detection, and the
//! per-field body merge.

use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use pdb_types::{Header, Id, Item, PdbError, Version};

use pdb_storage::{rtl_get, Store, Tree};

use crate::conflicts::ConflictRecord;

/// What the merge engine decided for one incoming remote item.
#[derive(Debug)]
pub enum MergeOutcome {
    /// The remote item is already represented in the local history.
    Noop,
    /// A new local item to be confirmed into the local tree.
    Candidate(MergeCandidate),
    /// Incompatible outcomes; goes to the conflict store.
    Conflict(ConflictRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Remote head descends from the local head (or the id is new locally).
    FastForward,
    /// True divergence; the candidate's `pa` names both heads.
    Merge,
}

/// A computed merge awaiting confirmation into the local tree.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub pe: String,
    /// Insertion sequence of the remote item that produced this candidate.
    pub remote_i: u64,
    pub kind: MergeKind,
    /// The synthesized local item: fresh `v`, no `pe`, `i` assigned on write.
    pub item: Item,
    /// LCA versions backing a [`MergeKind::Merge`].
    pub lcas: Vec<Version>,
    /// `remoteToLocal` rows recorded in the same batch as the confirmation.
    pub rtl: Vec<(Version, Version)>,
    /// `pa` entries that have no row in the local tree (the remote head of a
    /// true merge).
    pub foreign_parents: HashSet<Version>,
}

fn io_err(e: tokio::task::JoinError) -> PdbError {
    PdbError::Storage(e.to_string())
}

async fn rtl_lookup(store: &Arc<Store>, v: &Version) -> Result<Option<Version>, PdbError> {
    let store = store.clone();
    let v = v.clone();
    tokio::task::spawn_blocking(move || rtl_get(&store, v.as_bytes()))
        .await
        .map_err(io_err)?
}

/// `v` plus its `remoteToLocal` image, when one exists. Membership tests
/// during the LCA walk consider every form.
async fn canonical_forms(store: &Arc<Store>, v: &Version) -> Result<Vec<Version>, PdbError> {
    let mut forms = vec![v.clone()];
    if let Some(mapped) = rtl_lookup(store, v).await? {
        forms.push(mapped);
    }
    Ok(forms)
}

// ---------------------------------------------------------------------------
// Ancestor walk
// ---------------------------------------------------------------------------

/// Walks one tree's ancestry in reverse insertion order. Parents without a
/// row in the tree (cross-tree references in merged items) join the frontier
/// but cannot be expanded further on this side.
struct Walk {
    tree: Tree,
    heap: BinaryHeap<(u64, Version)>,
    visited: HashSet<Version>,
}

impl Walk {
    async fn new(tree: Tree, start: &Version) -> Result<Walk, PdbError> {
        let mut heap = BinaryHeap::new();
        let mut visited = HashSet::new();
        if let Some(item) = tree.get_by_version(start).await? {
            heap.push((item.h.i.unwrap_or(0), start.clone()));
            visited.insert(start.clone());
        }
        Ok(Walk {
            tree,
            heap,
            visited,
        })
    }

    /// Expand the frontier member with the largest `i`. Returns the versions
    /// that entered the frontier this step, or `None` when exhausted.
    async fn step(&mut self) -> Result<Option<Vec<Version>>, PdbError> {
        let Some((_, v)) = self.heap.pop() else {
            return Ok(None);
        };
        let mut yielded = vec![v.clone()];
        if let Some(item) = self.tree.get_by_version(&v).await? {
            for p in item.h.pa {
                if !self.visited.insert(p.clone()) {
                    continue;
                }
                match self.tree.get_by_version(&p).await? {
                    Some(parent) => self.heap.push((parent.h.i.unwrap_or(0), p)),
                    None => yielded.push(p),
                }
            }
        }
        Ok(Some(yielded))
    }
}

/// Lowest common ancestor of a remote head and a local head, walking both
/// ancestries in lock step. The first version observed in both frontiers
/// (under the `remoteToLocal` equivalence) wins; an empty result means the
/// two histories share no root.
pub(crate) async fn find_lca(
    store: &Arc<Store>,
    remote: &Tree,
    remote_v: &Version,
    local: &Tree,
    local_v: &Version,
) -> Result<Vec<Version>, PdbError> {
    let mut remote_walk = Walk::new(remote.clone(), remote_v).await?;
    let mut local_walk = Walk::new(local.clone(), local_v).await?;
    let mut seen_remote: HashSet<Version> = HashSet::new();
    let mut seen_local: HashSet<Version> = HashSet::new();

    loop {
        let mut progressed = false;

        if let Some(batch) = remote_walk.step().await? {
            progressed = true;
            for v in batch {
                let forms = canonical_forms(store, &v).await?;
                if let Some(hit) = forms.iter().find(|f| seen_local.contains(*f)) {
                    return Ok(vec![hit.clone()]);
                }
                seen_remote.extend(forms);
            }
        }

        if let Some(batch) = local_walk.step().await? {
            progressed = true;
            for v in batch {
                let forms = canonical_forms(store, &v).await?;
                if let Some(hit) = forms.iter().find(|f| seen_remote.contains(*f)) {
                    return Ok(vec![hit.clone()]);
                }
                seen_local.extend(forms);
            }
        }

        if !progressed {
            return Ok(vec![]);
        }
    }
}

// ---------------------------------------------------------------------------
// Body merge
// ---------------------------------------------------------------------------

/// Outcome of merging the contents of two divergent items over their LCA.
#[derive(Debug, PartialEq)]
pub enum MergedContent {
    Body(bson::Document),
    Tombstone,
    /// Top-level fields with incompatible changes on both sides.
    Conflict(Vec<String>),
}

/// Per-top-level-field last-writer-wins relative to the LCA body. Nested
/// documents compare as opaque values.
pub fn merge_documents(
    base: &bson::Document,
    ours: &bson::Document,
    theirs: &bson::Document,
) -> Result<bson::Document, Vec<String>> {
    let mut keys: Vec<String> = Vec::new();
    for k in ours.keys().chain(theirs.keys()).chain(base.keys()) {
        if !keys.iter().any(|seen| seen == k) {
            keys.push(k.clone());
        }
    }

    let mut out = bson::Document::new();
    let mut conflicts = Vec::new();
    for k in keys {
        let b = base.get(&k);
        let o = ours.get(&k);
        let t = theirs.get(&k);
        let winner = if o == t {
            o
        } else if o == b {
            t
        } else if t == b {
            o
        } else {
            conflicts.push(k);
            continue;
        };
        if let Some(value) = winner {
            out.insert(k, value.clone());
        }
    }

    if conflicts.is_empty() {
        Ok(out)
    } else {
        Err(conflicts)
    }
}

fn body_of(item: &Item) -> bson::Document {
    item.b.clone().unwrap_or_default()
}

/// Merge two divergent items over their common ancestor. Tombstones
/// propagate: delete vs delete deletes, delete vs modify conflicts, delete
/// vs unchanged deletes.
pub fn merge_items(lca: &Item, ours: &Item, theirs: &Item) -> MergedContent {
    let base = body_of(lca);
    match (ours.h.d, theirs.h.d) {
        (true, true) => MergedContent::Tombstone,
        (true, false) => {
            if body_of(theirs) == base && !lca.h.d {
                MergedContent::Tombstone
            } else {
                MergedContent::Conflict(vec!["delete vs modify".into()])
            }
        }
        (false, true) => {
            if body_of(ours) == base && !lca.h.d {
                MergedContent::Tombstone
            } else {
                MergedContent::Conflict(vec!["delete vs modify".into()])
            }
        }
        (false, false) => match merge_documents(&base, &body_of(ours), &body_of(theirs)) {
            Ok(doc) => MergedContent::Body(doc),
            Err(fields) => MergedContent::Conflict(fields),
        },
    }
}

// ---------------------------------------------------------------------------
// Candidate computation
// ---------------------------------------------------------------------------

fn synthesize(id: Id, v_size: usize, pa: Vec<Version>, body: Option<bson::Document>, d: bool) -> Item {
    Item::new(
        Header {
            id,
            v: Version::random(v_size),
            pa,
            pe: None,
            i: None,
            d,
            c: false,
        },
        body,
    )
}

fn conflict(x: &Item, l: Option<&Item>, lcas: Vec<Version>, pe: &str, err: String) -> MergeOutcome {
    MergeOutcome::Conflict(ConflictRecord {
        n: x.clone(),
        l: l.cloned(),
        c: None,
        lcas,
        pe: pe.to_string(),
        err,
    })
}

/// Pair one remote item with the current local head of its id and decide the
/// outcome. Items of one perspective are fed in insertion order, which keeps
/// per-id merges ordered; distinct ids are independent.
pub(crate) async fn compute(
    store: &Arc<Store>,
    local: &Tree,
    remote: &Tree,
    pe: &str,
    x: &Item,
    v_size: usize,
) -> Result<MergeOutcome, PdbError> {
    // Already adopted earlier (re-ingest after a resync is a no-op).
    if rtl_lookup(store, &x.h.v).await?.is_some() {
        return Ok(MergeOutcome::Noop);
    }

    let mut heads = local
        .heads(pdb_storage::HeadFilter {
            id: Some(x.h.id.clone()),
            skip_conflicts: true,
            skip_deletes: false,
            ..Default::default()
        })
        .await?;
    if heads.len() > 1 {
        return Ok(conflict(
            x,
            None,
            vec![],
            pe,
            "multiple non-conflict local heads".into(),
        ));
    }
    let local_head = heads.pop();

    let Some(local_head) = local_head else {
        // The id is unknown locally (or every head is a quarantined
        // conflict): adopt, re-mapping parents into the local history.
        let mut pa = Vec::with_capacity(x.h.pa.len());
        for p in &x.h.pa {
            match rtl_lookup(store, p).await? {
                Some(mapped) => pa.push(mapped),
                None => {
                    if local.get_by_version(p).await?.is_some() {
                        pa.push(p.clone());
                    } else {
                        return Ok(conflict(
                            x,
                            None,
                            vec![],
                            pe,
                            format!("parent {p} unknown in local history"),
                        ));
                    }
                }
            }
        }
        let item = synthesize(x.h.id.clone(), v_size, pa, x.b.clone(), x.h.d);
        let rtl = vec![(x.h.v.clone(), item.h.v.clone())];
        return Ok(MergeOutcome::Candidate(MergeCandidate {
            pe: pe.to_string(),
            remote_i: x.h.i.unwrap_or(0),
            kind: MergeKind::FastForward,
            item,
            lcas: vec![],
            rtl,
            foreign_parents: HashSet::new(),
        }));
    };

    // The remote head may already BE the local head (exported items echoed
    // back by the peer carry the local version).
    let canon_x: Vec<Version> = canonical_forms(store, &x.h.v).await?;
    if canon_x.contains(&local_head.h.v) {
        return Ok(MergeOutcome::Noop);
    }

    let lcas = find_lca(store, remote, &x.h.v, local, &local_head.h.v).await?;
    if lcas.is_empty() {
        return Ok(conflict(
            x,
            Some(&local_head),
            vec![],
            pe,
            "no common ancestor".into(),
        ));
    }

    // Remote strictly behind the local history.
    if lcas.iter().any(|l| canon_x.contains(l)) {
        return Ok(MergeOutcome::Noop);
    }

    if lcas.contains(&local_head.h.v) {
        // Fast-forward: re-stamp the remote item onto the local head.
        let item = synthesize(
            x.h.id.clone(),
            v_size,
            vec![local_head.h.v.clone()],
            x.b.clone(),
            x.h.d,
        );
        let rtl = vec![(x.h.v.clone(), item.h.v.clone())];
        return Ok(MergeOutcome::Candidate(MergeCandidate {
            pe: pe.to_string(),
            remote_i: x.h.i.unwrap_or(0),
            kind: MergeKind::FastForward,
            item,
            lcas,
            rtl,
            foreign_parents: HashSet::new(),
        }));
    }

    // True divergence: three-way merge over the LCA body.
    let lca_v = &lcas[0];
    let lca_item = match local.get_by_version(lca_v).await? {
        Some(item) => item,
        None => remote.get_by_version(lca_v).await?.ok_or_else(|| {
            PdbError::Storage(format!("lca {lca_v} has no row in either tree"))
        })?,
    };

    match merge_items(&lca_item, &local_head, x) {
        MergedContent::Conflict(fields) => Ok(conflict(
            x,
            Some(&local_head),
            lcas,
            pe,
            format!("conflicting fields: {}", fields.join(", ")),
        )),
        merged => {
            let (body, d) = match merged {
                MergedContent::Body(doc) => (Some(doc), false),
                MergedContent::Tombstone => (None, true),
                MergedContent::Conflict(_) => unreachable!(),
            };
            let item = synthesize(
                x.h.id.clone(),
                v_size,
                vec![local_head.h.v.clone(), x.h.v.clone()],
                body,
                d,
            );
            let mut foreign = HashSet::new();
            foreign.insert(x.h.v.clone());
            Ok(MergeOutcome::Candidate(MergeCandidate {
                pe: pe.to_string(),
                remote_i: x.h.i.unwrap_or(0),
                kind: MergeKind::Merge,
                item,
                lcas,
                // A true merge creates new content; the remote version keeps
                // its own identity and stays reachable through `pa`.
                rtl: vec![],
                foreign_parents: foreign,
            }))
        }
    }
}
