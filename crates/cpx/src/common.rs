//! 📦 Common data structures: the building blocks of cpx
//!
//! ---
//!
//! 🎬 COLD OPEN, INT. LOADING DOCK, 3:47 AM
//!
//! A forklift beeps somewhere. A `Split` arrives, describing a slice of a file it has never
//! actually read. A reader picks it up, squints at the bytes, and out come `Document`s,
//! one at a time, each clutching a URI like a boarding pass. They do not know which shard
//! they're going to. The router does. The router always knows. 🦆
//!
//! This module holds the humble, load-bearing structs that ferry documents from wherever they
//! were born to wherever they're going. They don't ask questions. They carry the bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::errors::PumpError;

/// 🔗 A record on its way to the writer: destination URI plus the document itself.
pub type Record = (String, Document);

/// 🏷️ What kind of bytes are these, actually?
///
/// Stores care. XML gets parsed, text gets indexed, binary gets stored and politely ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Xml,
    Text,
    Binary,
    #[default]
    Unknown,
}

/// 🔒 The four things a role may be allowed to do to a document. There is no fifth thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Insert,
    Update,
    Execute,
}

impl FromStr for Capability {
    type Err = PumpError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Capability::Read),
            "insert" => Ok(Capability::Insert),
            "update" => Ok(Capability::Update),
            "execute" => Ok(Capability::Execute),
            // 💀 "admin" is not a capability. "please" is not a capability either.
            _ => Err(PumpError::config(format!("Illegal capability: '{}'", raw.trim()))),
        }
    }
}

/// 🔒 A (role, capability) pair. One line of the document's guest list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessGrant {
    pub role: String,
    pub capability: Capability,
}

/// 🗂️ Everything about a document that isn't the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default, alias = "permissions")]
    pub grants: Vec<AccessGrant>,
    #[serde(default)]
    pub quality: i32,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DocumentMetadata {
    /// ➕ Adds a collection unless it's already there. Sets, but with insertion order.
    pub(crate) fn add_collection(&mut self, collection: impl Into<String>) {
        let collection = collection.into();
        if !self.collections.contains(&collection) {
            self.collections.push(collection);
        }
    }
}

/// 📄 A `Document`, one logical unit of content, born in a reader, buried after the store acks.
///
/// `content` is `None` for a "naked" document: only its metadata travels, the bytes already
/// live in the destination. Like forwarding your mail without moving house.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub content: Option<Vec<u8>>,
    pub kind: ContentKind,
    pub metadata: Option<DocumentMetadata>,
}

impl Document {
    pub fn new(content: Vec<u8>, kind: ContentKind) -> Self {
        Self {
            content: Some(content),
            kind,
            metadata: None,
        }
    }

    /// 👻 A metadata-only document. The body stays home.
    pub fn naked(metadata: DocumentMetadata) -> Self {
        Self {
            content: None,
            kind: ContentKind::Unknown,
            metadata: Some(metadata),
        }
    }

    pub fn is_naked(&self) -> bool {
        self.content.is_none()
    }

    /// 📏 Content length in bytes. Naked documents weigh nothing.
    pub fn content_len(&self) -> usize {
        self.content.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// ✍️ Metadata, created on demand.
    pub fn metadata_mut(&mut self) -> &mut DocumentMetadata {
        self.metadata.get_or_insert_with(DocumentMetadata::default)
    }

    /// 🔤 The content as UTF-8, if it is. Tests love this. Production mostly doesn't care.
    pub fn content_str(&self) -> Option<&str> {
        self.content
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

/// 🧩 A `Split`: a described contiguous slice of a source, consumed by exactly one reader.
///
/// Produced by whoever plans the job (not us). We just read it, sort it, and hand it out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Split {
    pub path: PathBuf,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub length: u64,
}

impl Split {
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
        }
    }

    /// 📏 One split covering a whole file (or directory, whose length is the sum of its files).
    pub fn whole(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let length = measure(path).with_context(|| {
            format!(
                "💀 Tried to measure '{}' for a split and the filesystem shrugged.",
                path.display()
            )
        })?;
        Ok(Self::new(path, 0, length))
    }

    /// 📐 File splits always cover whole files. A region (non-zero offset, or a length that
    /// disagrees with the file) is refused. A zero length means "measure it for me". Paths
    /// that can't be measured pass through untouched and fail in the reader.
    pub(crate) fn as_whole_file(&self) -> anyhow::Result<Split> {
        if self.offset != 0 {
            return Err(PumpError::config(format!(
                "Split {self} starts at offset {}; file splits must cover whole files",
                self.offset
            ))
            .into());
        }
        let Ok(measured) = measure(&self.path) else {
            return Ok(self.clone());
        };
        if self.length != 0 && self.length != measured {
            return Err(PumpError::config(format!(
                "Split {self} covers {} of {measured} bytes; file splits must cover whole files",
                self.length
            ))
            .into());
        }
        Ok(Split::new(&self.path, 0, measured))
    }

    pub fn display_name(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// 🔖 A stable short tag for auto-generated URIs: same split, same tag, every run.
    pub fn tag(&self) -> String {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.display_name().as_bytes());
        hasher.update(&self.offset.to_le_bytes());
        format!("{:08x}", hasher.finalize())
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.display_name(), self.offset, self.length)
    }
}

fn measure(path: &Path) -> std::io::Result<u64> {
    let meta = std::fs::metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += measure(&entry?.path())?;
    }
    Ok(total)
}

/// 📂 Every regular file under `root`, recursively, sorted so reruns visit files in the same order.
/// A plain file is its own one-element listing.
pub(crate) fn list_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// 🏷️ The bare file name, for `filename_as_collection` and friends.
pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_capabilities_ignore_your_caps_lock() {
        assert_eq!("READ".parse::<Capability>().ok(), Some(Capability::Read));
        assert_eq!(" update ".parse::<Capability>().ok(), Some(Capability::Update));
        assert!("admin".parse::<Capability>().is_err());
    }

    #[test]
    fn the_one_where_a_split_tag_is_stable_and_offset_sensitive() {
        let a = Split::new("/data/a.xml", 0, 10);
        let b = Split::new("/data/a.xml", 0, 99);
        let c = Split::new("/data/a.xml", 5, 10);
        assert_eq!(a.tag(), b.tag(), "length does not change identity");
        assert_ne!(a.tag(), c.tag(), "offset does");
        assert_eq!(a.tag().len(), 8);
    }

    #[test]
    fn the_one_where_naked_documents_weigh_nothing() {
        let doc = Document::naked(DocumentMetadata::default());
        assert!(doc.is_naked());
        assert_eq!(doc.content_len(), 0);
        assert_eq!(Document::new(b"abc".to_vec(), ContentKind::Text).content_len(), 3);
    }

    #[test]
    fn the_one_where_collections_are_deduplicated_politely() {
        let mut meta = DocumentMetadata::default();
        meta.add_collection("a");
        meta.add_collection("a");
        meta.add_collection("b");
        assert_eq!(meta.collections, vec!["a", "b"]);
    }

    #[test]
    fn the_one_where_a_directory_split_measures_all_its_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("x.csv"), "a,b\n1,2\n")?;
        std::fs::create_dir(dir.path().join("nested"))?;
        std::fs::write(dir.path().join("nested").join("y.csv"), "a\n")?;
        let split = Split::whole(dir.path())?;
        assert_eq!(split.length, 10);
        let files = list_files(dir.path())?;
        assert_eq!(files.len(), 2);
        assert!(files[0] < files[1], "listing is sorted");
        Ok(())
    }
}
