//! Origin side of the migration: request signing, the NetStorage HTTP
//! client, and the [`OriginStore`] seam the migration engine talks through.

pub mod client;
pub mod error;
pub mod signer;
mod xml;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use client::NetStorageClient;
pub use error::OriginError;
pub use signer::RequestSigner;

/// Streamed object body.
pub type ByteStream = BoxStream<'static, Result<Bytes, OriginError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl EntryKind {
    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "file" => Self::File,
            "dir" => Self::Dir,
            "symlink" => Self::Symlink,
            _ => Self::Other,
        }
    }
}

/// One entry of a listing or directory response.
///
/// For `list` the name is a full path; for `dir` it is relative to the
/// listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    pub name: String,
}

impl Entry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::File,
            name: name.into(),
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Dir,
            name: name.into(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub max_entries: usize,
    /// Listing stops before this path.
    pub end: Option<String>,
}

/// One page of a resumable listing. `resume == None` means the listing is
/// exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub resume: Option<String>,
    pub entries: Vec<Entry>,
}

/// Read-side operations the migration needs from the origin.
#[async_trait]
pub trait OriginStore: Send + Sync {
    /// One bounded page of the flat, resumable listing starting at `path`.
    async fn list(&self, path: &str, options: &ListOptions) -> Result<ListPage, OriginError>;

    /// Immediate children of the directory at `path`.
    async fn dir(&self, path: &str) -> Result<Vec<Entry>, OriginError>;

    /// Signed streaming read of the object at `path`.
    async fn open_read(&self, path: &str) -> Result<ByteStream, OriginError>;
}
