use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ledgit_crypto::ContentHasher;
use ledgit_types::ObjectId;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Identity of raw blob content.
///
/// The id depends only on the uncompressed bytes, so the same content stored
/// compressed, chunked, locally or remotely always resolves to one blob.
pub fn identify(content: &[u8]) -> ObjectId {
    ContentHasher::BLOB.hash(content)
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// What a tree entry points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Blob,
    Tree,
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blob => write!(f, "blob"),
            Self::Tree => write!(f, "tree"),
        }
    }
}

/// A single entry in a tree object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Entry name (file or directory name, no separators).
    pub name: String,
    /// Whether the entry references a blob or a subtree.
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Content-addressed ID of the referenced object.
    pub hash: ObjectId,
}

impl TreeEntry {
    pub fn blob(name: impl Into<String>, hash: ObjectId) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::Blob,
            hash,
        }
    }

    pub fn tree(name: impl Into<String>, hash: ObjectId) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::Tree,
            hash,
        }
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.as_bytes().cmp(other.name.as_bytes())
    }
}

/// Directory listing object.
///
/// Entries are always held sorted by the byte order of their names; the
/// JSON encoding of that sorted list is what gets hashed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Create an empty tree.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Sorted entries.
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical byte encoding; this is what the tree id is computed over.
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// The tree id.
    pub fn id(&self) -> StoreResult<ObjectId> {
        Ok(ContentHasher::TREE.hash(&self.to_bytes()?))
    }

    /// Decode a tree and check it against the id it was stored under.
    pub fn from_bytes(expected: &ObjectId, data: &[u8]) -> StoreResult<Self> {
        let decoded: Tree =
            serde_json::from_slice(data).map_err(|e| StoreError::Serialization(e.to_string()))?;
        // Re-run canonicalisation; a stored tree with unsorted entries is corrupt.
        let (computed, tree) = build_tree(decoded.entries)?;
        if computed != *expected {
            return Err(StoreError::HashMismatch {
                id: *expected,
                computed,
            });
        }
        Ok(tree)
    }
}

/// Build a tree from entries given in any order.
///
/// Entries are canonically sorted before hashing, so two trees with the same
/// logical content hash identically regardless of insertion order.
pub fn build_tree(entries: impl IntoIterator<Item = TreeEntry>) -> StoreResult<(ObjectId, Tree)> {
    let mut entries: Vec<TreeEntry> = entries.into_iter().collect();
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in &entries {
        if entry.name.is_empty() || entry.name.contains('/') || entry.name.contains('\0') {
            return Err(StoreError::Validation(format!(
                "invalid tree entry name {:?}",
                entry.name
            )));
        }
        if entry.hash.is_null() {
            return Err(StoreError::Validation(format!(
                "tree entry {:?} has a null hash",
                entry.name
            )));
        }
        if !seen.insert(entry.name.as_str()) {
            return Err(StoreError::Validation(format!(
                "duplicate tree entry {:?}",
                entry.name
            )));
        }
    }
    entries.sort();
    let tree = Tree { entries };
    let id = tree.id()?;
    Ok((id, tree))
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// The hashed fields of a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFields {
    pub parent_hash: Option<ObjectId>,
    pub author_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub root_tree_hash: ObjectId,
}

/// Immutable commit object. The hash is derived from all other fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    hash: ObjectId,
    #[serde(flatten)]
    fields: CommitFields,
}

impl Commit {
    pub fn hash(&self) -> ObjectId {
        self.hash
    }

    pub fn parent_hash(&self) -> Option<ObjectId> {
        self.fields.parent_hash
    }

    pub fn author_id(&self) -> &str {
        &self.fields.author_id
    }

    pub fn message(&self) -> &str {
        &self.fields.message
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.fields.timestamp
    }

    pub fn root_tree_hash(&self) -> ObjectId {
        self.fields.root_tree_hash
    }

    pub fn fields(&self) -> &CommitFields {
        &self.fields
    }

    /// Encoding of the hashed fields, suitable for storing as a blob.
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(&self.fields).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Decode a commit and check it against the expected commit hash.
    pub fn from_bytes(expected: &ObjectId, data: &[u8]) -> StoreResult<Self> {
        let fields: CommitFields =
            serde_json::from_slice(data).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let (computed, commit) = build_commit(fields)?;
        if computed != *expected {
            return Err(StoreError::HashMismatch {
                id: *expected,
                computed,
            });
        }
        Ok(commit)
    }
}

/// Build a commit. Pure: the same fields always give the same hash.
pub fn build_commit(fields: CommitFields) -> StoreResult<(ObjectId, Commit)> {
    if fields.root_tree_hash.is_null() {
        return Err(StoreError::Validation(
            "commit root tree hash is empty".into(),
        ));
    }
    if fields.author_id.trim().is_empty() {
        return Err(StoreError::Validation("commit author id is empty".into()));
    }
    if fields.parent_hash.is_some_and(|p| p.is_null()) {
        return Err(StoreError::Validation(
            "commit parent hash is the null id".into(),
        ));
    }
    let hash = ContentHasher::COMMIT
        .hash_json(&fields)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok((hash, Commit { hash, fields }))
}
