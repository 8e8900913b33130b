//! Byte-key layouts for the index families.
//!
//! Every key starts with a length-prefixed tree name `(len: u8) ++ name`;
//! ids are length-prefixed the same way because they are arbitrary bytes and
//! may contain any delimiter. Sequence numbers are big-endian so that
//! lexicographic order equals numeric order.

/// `(len: u8) ++ tree_name` — common prefix of every key of a tree.
pub fn tree_prefix(tree: &str) -> Vec<u8> {
    let name = tree.as_bytes();
    debug_assert!(name.len() <= u8::MAX as usize);
    let mut buf = Vec::with_capacity(1 + name.len());
    buf.push(name.len() as u8);
    buf.extend_from_slice(name);
    buf
}

/// `by_version` keyspace: `tree ++ v` — primary item lookup.
pub fn version_key(tree: &str, v: &[u8]) -> Vec<u8> {
    let mut buf = tree_prefix(tree);
    buf.extend_from_slice(v);
    buf
}

/// `by_id` keyspace: `tree ++ (len: u8) ++ id ++ i_be(8)` → `v`.
/// Scans versions of one id in insertion order.
pub fn id_key(tree: &str, id: &[u8], i: u64) -> Vec<u8> {
    let mut buf = id_prefix(tree, id);
    buf.extend_from_slice(&i.to_be_bytes());
    buf
}

/// Prefix of all `by_id` rows of a single id.
pub fn id_prefix(tree: &str, id: &[u8]) -> Vec<u8> {
    let mut buf = tree_prefix(tree);
    debug_assert!(id.len() <= u8::MAX as usize);
    buf.push(id.len() as u8);
    buf.extend_from_slice(id);
    buf
}

/// `by_i` keyspace: `tree ++ i_be(8)` → `v` — whole-tree insertion order.
pub fn i_key(tree: &str, i: u64) -> Vec<u8> {
    let mut buf = tree_prefix(tree);
    buf.extend_from_slice(&i.to_be_bytes());
    buf
}

/// Insertion sequence encoded in a `by_i` key (after the tree prefix).
pub fn parse_i_key(tree: &str, key: &[u8]) -> Option<u64> {
    let pfx = 1 + tree.len();
    let raw: [u8; 8] = key.get(pfx..pfx + 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

/// `heads` keyspace: `tree ++ (len: u8) ++ id ++ v` → `∅`.
pub fn head_key(tree: &str, id: &[u8], v: &[u8]) -> Vec<u8> {
    let mut buf = id_prefix(tree, id);
    buf.extend_from_slice(v);
    buf
}

/// Prefix of all head rows of a single id.
pub fn head_prefix(tree: &str, id: &[u8]) -> Vec<u8> {
    id_prefix(tree, id)
}

/// Split a `heads` key into `(id, v)`. `None` on a foreign or truncated key.
pub fn split_head_key<'k>(tree: &str, key: &'k [u8]) -> Option<(&'k [u8], &'k [u8])> {
    let rest = key.get(1 + tree.len()..)?;
    let id_len = *rest.first()? as usize;
    let id = rest.get(1..1 + id_len)?;
    let v = rest.get(1 + id_len..)?;
    if v.is_empty() {
        return None;
    }
    Some((id, v))
}

/// `meta` keyspace: `tree ++ label`.
pub fn meta_key(tree: &str, label: &[u8]) -> Vec<u8> {
    let mut buf = tree_prefix(tree);
    buf.extend_from_slice(label);
    buf
}

/// Durable merge cursor of a remote tree: last remote `i` fully lifted into
/// the local history.
pub fn merge_offset_key(tree: &str) -> Vec<u8> {
    meta_key(tree, b"merge_offset")
}

/// `remoteToLocal` side table (meta keyspace, reserved `_rtl` namespace):
/// maps a remote version to the local version that re-stamped it.
pub fn rtl_key(remote_v: &[u8]) -> Vec<u8> {
    meta_key("_rtl", remote_v)
}

/// Auto-increment cursor for the conflict queue (meta keyspace).
pub fn conflict_seq_key() -> Vec<u8> {
    meta_key("_conflicts", b"seq")
}

/// `conflicts` keyspace: `n_be(8)` — the queue is global to the store.
pub fn conflict_key(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Queue key of a conflict row.
pub fn parse_conflict_key(key: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}
