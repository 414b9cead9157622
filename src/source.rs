//! Discovery of raw export files and grouping of a user's split export.
//!
//! Exports are named `UserID_<id>_<period>.json` (optionally `.gz`) and live
//! either in a directory tree or inside a plain `.tar` archive.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// A named byte payload belonging to one user's export.
#[derive(Debug, Clone)]
pub enum RawSource {
    File {
        path: PathBuf,
    },
    /// A regular entry inside a tar archive, addressed by its data offset.
    ArchiveEntry {
        archive: Arc<PathBuf>,
        name: String,
        offset: u64,
        size: u64,
    },
}

impl RawSource {
    /// Base name of the file or entry.
    pub fn name(&self) -> Cow<'_, str> {
        match self {
            RawSource::File { path } => path
                .file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_else(|| path.to_string_lossy()),
            RawSource::ArchiveEntry { name, .. } => Cow::Borrowed(name),
        }
    }

    /// Read the whole payload, gunzipping `.gz` sources.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let raw = match self {
            RawSource::File { path } => std::fs::read(path),
            RawSource::ArchiveEntry {
                archive,
                offset,
                size,
                ..
            } => read_archive_range(archive, *offset, *size),
        }
        .map_err(|source| self.read_error(source))?;

        if !self.name().ends_with(".gz") {
            return Ok(raw);
        }
        let mut decoded = Vec::with_capacity(raw.len() * 4);
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut decoded)
            .map_err(|source| self.read_error(source))?;
        Ok(decoded)
    }

    fn read_error(&self, source: std::io::Error) -> Error {
        Error::SourceRead {
            name: self.name().into_owned(),
            source,
        }
    }
}

fn read_archive_range(archive: &Path, offset: u64, size: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(archive)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(size as usize);
    file.take(size).read_to_end(&mut buf)?;
    Ok(buf)
}

/// All sources that belong to one user, in name order.
#[derive(Debug, Clone)]
pub struct SourceGroup {
    pub user_key: String,
    pub sources: Vec<RawSource>,
}

impl SourceGroup {
    /// Concatenate every source of the group into one newline-delimited payload.
    pub fn read_payload(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        for source in &self.sources {
            let bytes = source.read_all()?;
            if bytes.is_empty() {
                continue;
            }
            if !payload.is_empty() && payload.last() != Some(&b'\n') {
                payload.push(b'\n');
            }
            payload.extend_from_slice(&bytes);
        }
        Ok(payload)
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().into_owned()).collect()
    }
}

/// Extract the user identifier from an export name.
///
/// `UserID_6913_20171122-233133.json` yields `6913`.
pub fn user_key(name: &str) -> Option<&str> {
    let mut parts = name.split('_');
    parts.next()?;
    let id = parts.next()?;
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Some(id)
    } else {
        None
    }
}

/// Lists export sources matching a file-name pattern.
pub struct SourceEnumerator {
    pattern: glob::Pattern,
}

impl SourceEnumerator {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| Error::Config(format!("invalid file pattern {pattern:?}: {e}")))?;
        Ok(Self { pattern })
    }

    /// Enumerate a directory tree or a `.tar` archive, depending on what `path` is.
    pub fn open(&self, path: &Path) -> Result<Vec<RawSource>> {
        if path.is_dir() {
            self.directory(path)
        } else {
            self.archive(path)
        }
    }

    pub fn directory(&self, root: &Path) -> Result<Vec<RawSource>> {
        std::fs::read_dir(root).map_err(|source| Error::Enumeration {
            path: root.to_path_buf(),
            source,
        })?;

        let mut sources = Vec::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable directory entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if self.pattern.matches(&name) {
                sources.push(RawSource::File {
                    path: entry.into_path(),
                });
            }
        }
        debug!("found {} candidate files under {}", sources.len(), root.display());
        Ok(sources)
    }

    pub fn archive(&self, path: &Path) -> Result<Vec<RawSource>> {
        let enumeration_error = |source| Error::Enumeration {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(enumeration_error)?;
        let mut archive = tar::Archive::new(file);
        let shared_path = Arc::new(path.to_path_buf());

        let mut sources = Vec::new();
        for entry in archive.entries().map_err(enumeration_error)? {
            let entry = entry.map_err(enumeration_error)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let entry_path = entry.path().map_err(enumeration_error)?;
            let Some(name) = entry_path.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            if !self.pattern.matches(&name) {
                continue;
            }
            sources.push(RawSource::ArchiveEntry {
                archive: Arc::clone(&shared_path),
                name,
                offset: entry.raw_file_position(),
                size: entry.size(),
            });
        }
        debug!("found {} candidate entries in {}", sources.len(), path.display());
        Ok(sources)
    }
}

/// Group sources by the user id embedded in their names.
///
/// Sources without an extractable id are skipped with a warning.
pub fn group_by_user(sources: Vec<RawSource>) -> Vec<SourceGroup> {
    let mut groups: BTreeMap<String, Vec<RawSource>> = BTreeMap::new();
    for source in sources {
        let key = match user_key(&source.name()) {
            Some(key) => key.to_string(),
            None => {
                warn!("skipping {}: no user id in name", source.name());
                continue;
            }
        };
        groups.entry(key).or_default().push(source);
    }

    groups
        .into_iter()
        .map(|(user_key, mut sources)| {
            sources.sort_by(|a, b| a.name().cmp(&b.name()));
            SourceGroup { user_key, sources }
        })
        .collect()
}
