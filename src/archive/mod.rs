//! In-memory archive index.
//!
//! A submitted model archive is parsed once into an [`ArchiveIndex`] keyed by
//! normalized path. Entries stay compressed until a request asks for them;
//! every read works on its own cheap clone of the parsed archive, so reads of
//! different entries never wait on each other.

pub mod encoding;

use bytes::Bytes;
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use std::io::{Cursor, Read};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::paths;

type ZipBuffer = ZipArchive<Cursor<Bytes>>;

/// Upper bound on buffer space reserved up front from a claimed size
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Initial buffer capacity for a payload whose size comes from untrusted
/// input (a central directory record, a `Content-Length` header)
pub(crate) fn preallocation(claimed: u64) -> usize {
    claimed.min(MAX_PREALLOCATION) as usize
}

/// Errors raised while indexing an archive or reading one of its entries
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Not a valid model archive: {0}")]
    InvalidArchiveFormat(#[source] zip::result::ZipError),

    #[error("Unsupported entry name encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("No {} model file found in archive", paths::DESCRIPTOR_SUFFIX)]
    DescriptorNotFound,

    #[error("Failed to read archive entry {path}: {source}")]
    Entry {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

impl ArchiveError {
    /// Errors the requester reports as "invalid model archive"
    pub fn is_invalid_format(&self) -> bool {
        matches!(
            self,
            ArchiveError::InvalidArchiveFormat(_)
                | ArchiveError::UnsupportedEncoding(_)
                | ArchiveError::DescriptorNotFound
        )
    }
}

/// One packaged file
#[derive(Clone)]
pub struct ArchiveEntry {
    stored_path: String,
    index: usize,
    size: u64,
    archive: ZipBuffer,
}

impl ArchiveEntry {
    /// Path as recorded in the archive, after name decoding
    pub fn stored_path(&self) -> &str {
        &self.stored_path
    }

    /// Uncompressed size recorded in the central directory
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Decompress the entry on the blocking pool
    pub async fn read(&self) -> Result<Bytes, ArchiveError> {
        let mut archive = self.archive.clone();
        let index = self.index;
        let path = self.stored_path.clone();

        tokio::task::spawn_blocking(move || -> Result<Bytes, ArchiveError> {
            let to_entry_error = |source: std::io::Error| ArchiveError::Entry {
                path: path.clone(),
                source,
            };
            let mut file = archive
                .by_index(index)
                .map_err(|e| to_entry_error(e.into()))?;
            let mut data = Vec::with_capacity(preallocation(file.size()));
            file.read_to_end(&mut data).map_err(to_entry_error)?;
            Ok(Bytes::from(data))
        })
        .await?
    }
}

impl fmt::Debug for ArchiveEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveEntry")
            .field("stored_path", &self.stored_path)
            .field("index", &self.index)
            .field("size", &self.size)
            .finish()
    }
}

/// Normalized path -> entry, for one loaded archive
///
/// Keys are kept sorted so lookups that scan (descriptor discovery) are
/// deterministic regardless of the archive's internal order.
#[derive(Debug, Default)]
pub struct ArchiveIndex {
    entries: BTreeMap<String, ArchiveEntry>,
    collisions: usize,
}

impl ArchiveIndex {
    /// Parse archive bytes and index every file entry.
    ///
    /// `encoding` is a WHATWG label used for entry names that are not stored
    /// as UTF-8.
    pub async fn build(bytes: Bytes, encoding: &str) -> Result<Self, ArchiveError> {
        let encoding = encoding::resolve_label(encoding)?;
        tokio::task::spawn_blocking(move || Self::build_blocking(bytes, encoding)).await?
    }

    fn build_blocking(
        bytes: Bytes,
        encoding: &'static encoding_rs::Encoding,
    ) -> Result<Self, ArchiveError> {
        let total_bytes = bytes.len();
        let mut archive =
            ZipArchive::new(Cursor::new(bytes)).map_err(ArchiveError::InvalidArchiveFormat)?;

        let mut index = Self::default();
        for i in 0..archive.len() {
            let (stored_path, size) = {
                let file = archive
                    .by_index_raw(i)
                    .map_err(ArchiveError::InvalidArchiveFormat)?;
                if file.is_dir() {
                    continue;
                }
                let name = encoding::decode_entry_name(file.name_raw(), file.name(), encoding);
                (name, file.size())
            };

            index.insert(ArchiveEntry {
                stored_path,
                index: i,
                size,
                archive: archive.clone(),
            });
        }

        info!(
            "Indexed archive: {} entries from {} bytes ({} name collisions, encoding {})",
            index.len(),
            total_bytes,
            index.collisions,
            encoding.name()
        );

        Ok(index)
    }

    /// Insert under the normalized key; a later entry replaces an earlier one
    fn insert(&mut self, entry: ArchiveEntry) {
        let key = paths::normalize(&entry.stored_path);
        let stored_path = entry.stored_path.clone();
        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            self.collisions += 1;
            warn!(
                "Archive paths collide after normalization: {:?} replaces {:?} (key {:?})",
                stored_path, previous.stored_path, key
            );
        }
    }

    /// First entry (in key order) whose normalized path ends in `.pmx`
    pub fn find_descriptor(&self) -> Option<&ArchiveEntry> {
        let found = self
            .entries
            .iter()
            .find(|(key, _)| paths::is_descriptor(key))
            .map(|(_, entry)| entry);

        match found {
            Some(entry) => debug!("Model descriptor: {}", entry.stored_path),
            None => debug!("No model descriptor among {} entries", self.len()),
        }
        found
    }

    /// Look up an already-normalized path
    pub fn resolve(&self, normalized_path: &str) -> Option<&ArchiveEntry> {
        self.entries.get(normalized_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries dropped because another path normalized to the same key
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    /// Entries in key order
    pub fn iter(&self) -> btree_map::Iter<'_, String, ArchiveEntry> {
        self.entries.iter()
    }
}
