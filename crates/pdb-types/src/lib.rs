use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tree name of the local (merged, authoritative) history.
pub const LOCAL_TREE: &str = "_local";
/// Tree name of the staging area for computed-but-unconfirmed merges.
pub const STAGE_TREE: &str = "_stage";

/// Default size of a version identifier in bytes.
///
/// 3 bytes → 24 bits of randomness, 4 chars base64 on the wire. Collisions
/// for a single id become likely around 2^12 versions; `MergeTree` logs a
/// warning when configured below 4.
pub const DEFAULT_V_SIZE: usize = 3;

/// Largest id accepted in an item header. Ids are length-prefixed with a
/// single byte in the index key layout.
pub const MAX_ID_LEN: usize = 255;

#[derive(thiserror::Error, Debug)]
pub enum PdbError {
    #[error("malformed item: {0}")]
    MalformedItem(String),
    #[error("version already exists in tree")]
    DuplicateVersion,
    #[error("parent version not found in tree")]
    MissingParent,
    #[error("unknown perspective: {0}")]
    UnknownPerspective(String),
    #[error("a local write stream is already open")]
    LocalWriterBusy,
    #[error("auto-merge is already engaged")]
    AlreadyAutoMerging,
    #[error("multiple non-conflict heads exist where one was required")]
    HeadAmbiguous,
    #[error("no previous version known for id")]
    PreviousVersionNotFound,
    /// Informational: the operation succeeded but produced a conflict row.
    #[error("conflict recorded under key {0}")]
    ConflictRecorded(u64),
    #[error("merge tree is closed")]
    Closed,
    #[error("storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Opaque random version identifier, unique within a tree with overwhelming
/// probability. Raw bytes in index keys, base64 (no padding) on the wire.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(Vec<u8>);

impl Version {
    /// Allocate a fresh random version of `v_size` bytes.
    pub fn random(v_size: usize) -> Self {
        let mut bytes = vec![0u8; v_size];
        rand::thread_rng().fill_bytes(&mut bytes);
        Version(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Version(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD_NO_PAD.encode(&self.0))
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({self})")
    }
}

impl FromStr for Version {
    type Err = PdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STANDARD_NO_PAD
            .decode(s)
            .map(Version)
            .map_err(|e| PdbError::MalformedItem(format!("bad version encoding: {e}")))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct VersionVisitor;

        impl Visitor<'_> for VersionVisitor {
            type Value = Version;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base64 version string")
            }

            fn visit_str<E: de::Error>(self, s: &str) -> Result<Version, E> {
                s.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(VersionVisitor)
    }
}

// ---------------------------------------------------------------------------
// Id
// ---------------------------------------------------------------------------

/// Logical document identifier: opaque bytes. On the wire it arrives as a
/// BSON string or binary; both decode into the raw byte form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(#[serde(with = "serde_bytes")] Vec<u8>);

impl Id {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Id {
    fn from(bytes: Vec<u8>) -> Self {
        Id(bytes)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", String::from_utf8_lossy(&self.0))
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// Item header. `i` is assigned by the tree on write and must not be set by
/// the caller; `pe` is present only inside remote trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub id: Id,
    pub v: Version,
    #[serde(default)]
    pub pa: Vec<Version>,
    #[serde(default)]
    pub pe: Option<String>,
    #[serde(default)]
    pub i: Option<u64>,
    #[serde(default)]
    pub d: bool,
    #[serde(default)]
    pub c: bool,
}

/// The canonical record carried everywhere: header, opaque body (absent for
/// tombstones) and adapter-private meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub h: Header,
    #[serde(default)]
    pub b: Option<bson::Document>,
    #[serde(default)]
    pub m: Option<bson::Document>,
}

impl Item {
    pub fn new(h: Header, b: Option<bson::Document>) -> Self {
        Item { h, b, m: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.h.d
    }

    /// Validate item shape against a tree's version size. Duplicate-version
    /// and parent-existence checks are the tree's concern; this covers the
    /// structural rules only.
    pub fn validate(&self, v_size: usize) -> Result<(), PdbError> {
        if self.h.id.is_empty() {
            return Err(PdbError::MalformedItem("empty id".into()));
        }
        if self.h.id.len() > MAX_ID_LEN {
            return Err(PdbError::MalformedItem(format!(
                "id exceeds {MAX_ID_LEN} bytes"
            )));
        }
        if self.h.v.len() != v_size {
            return Err(PdbError::MalformedItem(format!(
                "version is {} bytes, tree uses {v_size}",
                self.h.v.len()
            )));
        }
        if self.h.pa.len() > 2 {
            return Err(PdbError::MalformedItem("more than two parents".into()));
        }
        if self.h.pa.len() == 2 && self.h.pa[0] == self.h.pa[1] {
            return Err(PdbError::MalformedItem("duplicate parent".into()));
        }
        for p in &self.h.pa {
            if p.len() != v_size {
                return Err(PdbError::MalformedItem(format!(
                    "parent version is {} bytes, tree uses {v_size}",
                    p.len()
                )));
            }
        }
        if self.h.d && self.b.is_some() {
            return Err(PdbError::MalformedItem("tombstone carries a body".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-db merge tree settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeTreeConfig {
    pub v_size: usize,
}

impl Default for MergeTreeConfig {
    fn default() -> Self {
        MergeTreeConfig {
            v_size: DEFAULT_V_SIZE,
        }
    }
}

/// One authorized peer of a db.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveConfig {
    pub name: String,
    #[serde(default)]
    pub import: bool,
    #[serde(default)]
    pub export: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// One replicated database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub name: String,
    #[serde(default)]
    pub merge_tree: MergeTreeConfig,
    #[serde(default)]
    pub perspectives: Vec<PerspectiveConfig>,
}

/// Perspective names must fit the id/key layout and must not collide with
/// the reserved `_local` / `_stage` trees.
pub fn validate_perspective_name(name: &str) -> Result<(), PdbError> {
    if name.is_empty() {
        return Err(PdbError::MalformedItem("empty perspective name".into()));
    }
    if name.len() > MAX_ID_LEN - 1 {
        return Err(PdbError::MalformedItem(format!(
            "perspective name exceeds {} bytes",
            MAX_ID_LEN - 1
        )));
    }
    if name.starts_with('_') {
        return Err(PdbError::MalformedItem(format!(
            "perspective name '{name}' uses the reserved '_' prefix"
        )));
    }
    Ok(())
}
