//! Oplog transform: consumes a MongoDB-style change log and emits canonical
//! items. The adapter is side-effect-free on its input records; the only
//! outside contact is the head-lookup request channel, used to materialize
//! the pre-state of partial updates.

use std::future::Future;

use bson::{Bson, Document};
use pdb_types::{Header, Id, Item, PdbError, Version};

/// The request channel for the last known local state of an id.
///
/// RPITIT, matching the storage-facing traits of the core crates; no
/// `async-trait` involved.
pub trait HeadLookup: Send + Sync {
    fn lookup(&self, id: &Id) -> impl Future<Output = Result<Option<Item>, PdbError>> + Send;
}

/// One observed change, already classified.
#[derive(Debug, Clone, PartialEq)]
pub enum OplogEvent {
    Insert {
        id: Id,
        doc: Document,
        ts: i64,
    },
    UpdateFull {
        id: Id,
        doc: Document,
        ts: i64,
    },
    UpdateModifier {
        id: Id,
        set: Document,
        unset: Vec<String>,
        ts: i64,
    },
    Delete {
        id: Id,
        ts: i64,
    },
}

fn malformed(msg: impl Into<String>) -> PdbError {
    PdbError::MalformedItem(msg.into())
}

fn id_from_bson(value: &Bson) -> Result<Id, PdbError> {
    match value {
        Bson::String(s) => Ok(s.as_str().into()),
        Bson::Binary(bin) => Ok(bin.bytes.clone().into()),
        Bson::ObjectId(oid) => Ok(oid.bytes().to_vec().into()),
        other => Err(malformed(format!("unsupported _id type: {other}"))),
    }
}

fn ts_from_doc(doc: &Document) -> i64 {
    match doc.get("ts") {
        Some(Bson::Timestamp(ts)) => ((ts.time as i64) << 32) | ts.increment as i64,
        Some(Bson::Int64(n)) => *n,
        Some(Bson::Int32(n)) => *n as i64,
        _ => 0,
    }
}

fn doc_without_id(doc: &Document) -> Document {
    let mut out = doc.clone();
    out.remove("_id");
    out
}

impl OplogEvent {
    /// Classify a raw oplog entry: `{ts, op, ns, o, o2?}` with op one of
    /// `i`, `u`, `d`.
    pub fn from_doc(entry: &Document) -> Result<OplogEvent, PdbError> {
        let op = entry
            .get_str("op")
            .map_err(|_| malformed("oplog entry without op"))?;
        let o = entry
            .get_document("o")
            .map_err(|_| malformed("oplog entry without o"))?;
        let ts = ts_from_doc(entry);

        match op {
            "i" => {
                let id = id_from_bson(o.get("_id").ok_or_else(|| malformed("insert without _id"))?)?;
                Ok(OplogEvent::Insert {
                    id,
                    doc: doc_without_id(o),
                    ts,
                })
            }
            "u" => {
                let o2 = entry
                    .get_document("o2")
                    .map_err(|_| malformed("update without o2"))?;
                let id =
                    id_from_bson(o2.get("_id").ok_or_else(|| malformed("update without _id"))?)?;
                let is_modifier = o.keys().any(|k| k.starts_with('$'));
                if is_modifier {
                    let set = o
                        .get_document("$set")
                        .map(|d| d.clone())
                        .unwrap_or_default();
                    let unset = o
                        .get_document("$unset")
                        .map(|d| d.keys().cloned().collect())
                        .unwrap_or_default();
                    Ok(OplogEvent::UpdateModifier { id, set, unset, ts })
                } else {
                    Ok(OplogEvent::UpdateFull {
                        id,
                        doc: doc_without_id(o),
                        ts,
                    })
                }
            }
            "d" => {
                let id = id_from_bson(o.get("_id").ok_or_else(|| malformed("delete without _id"))?)?;
                Ok(OplogEvent::Delete { id, ts })
            }
            other => Err(malformed(format!("unsupported oplog op '{other}'"))),
        }
    }
}

/// Write `value` at a (possibly dotted) path, creating intermediate
/// documents.
fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(nested)) = doc.get_mut(head) {
                set_path(nested, rest, value);
            }
        }
    }
}

/// Remove the field at a (possibly dotted) path; missing segments are a
/// no-op, like the source modifier semantics.
fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(nested)) = doc.get_mut(head) {
                unset_path(nested, rest);
            }
        }
    }
}

fn synthesize(id: Id, v_size: usize, pa: Vec<Version>, body: Option<Document>, d: bool, ts: i64) -> Item {
    let mut item = Item::new(
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
    );
    item.m = Some(bson::doc! {"ts": ts});
    item
}

/// Turn one oplog event into a canonical item, chaining it onto the last
/// known local head. A partial update or delete without a base fails with
/// [`PdbError::PreviousVersionNotFound`].
pub async fn transform<L: HeadLookup>(
    event: &OplogEvent,
    lookup: &L,
    v_size: usize,
) -> Result<Item, PdbError> {
    match event {
        OplogEvent::Insert { id, doc, ts } => {
            let pa = match lookup.lookup(id).await? {
                Some(head) => vec![head.h.v],
                None => vec![],
            };
            Ok(synthesize(id.clone(), v_size, pa, Some(doc.clone()), false, *ts))
        }
        OplogEvent::UpdateFull { id, doc, ts } => {
            let pa = match lookup.lookup(id).await? {
                Some(head) => vec![head.h.v],
                None => vec![],
            };
            Ok(synthesize(id.clone(), v_size, pa, Some(doc.clone()), false, *ts))
        }
        OplogEvent::UpdateModifier { id, set, unset, ts } => {
            let base = lookup
                .lookup(id)
                .await?
                .ok_or(PdbError::PreviousVersionNotFound)?;
            let mut body = base.b.clone().unwrap_or_default();
            for (path, value) in set {
                set_path(&mut body, path, value.clone());
            }
            for path in unset {
                unset_path(&mut body, path);
            }
            Ok(synthesize(
                id.clone(),
                v_size,
                vec![base.h.v],
                Some(body),
                false,
                *ts,
            ))
        }
        OplogEvent::Delete { id, ts } => {
            let base = lookup
                .lookup(id)
                .await?
                .ok_or(PdbError::PreviousVersionNotFound)?;
            Ok(synthesize(id.clone(), v_size, vec![base.h.v], None, true, *ts))
        }
    }
}
