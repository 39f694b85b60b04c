//! Source item inventory.
//!
//! A [`FileList`] is a globally path-sorted list of items to be archived (or
//! reconstructed from an archive during extraction). Each worker owns one
//! contiguous partition of the list; the partition boundaries are the same
//! deterministic formula everywhere so no coordination is needed to agree on
//! ownership.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{io_err, ArchiveError};

/// Kind of an archive member.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    /// Fifo, socket, device. Warned about and skipped by the layout planner.
    Other,
}

/// Metadata for a single file, directory, or symlink.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Absolute path of the item on disk.
    pub path: PathBuf,
    /// Path relative to the walk anchor; used as the archive member name.
    /// Never starts with a separator.
    pub rel_path: PathBuf,
    pub kind: EntryKind,
    /// Size in bytes; 0 for anything but regular files.
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub uname: String,
    pub gname: String,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    /// Symlink target, present iff `kind == Symlink`.
    pub link_target: Option<PathBuf>,
}

impl Entry {
    pub fn from_metadata(
        path: PathBuf,
        rel_path: PathBuf,
        meta: &fs::Metadata,
    ) -> Result<Self, ArchiveError> {
        let ft = meta.file_type();
        let kind = if ft.is_file() {
            EntryKind::File
        } else if ft.is_dir() {
            EntryKind::Dir
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Other
        };

        let link_target = if kind == EntryKind::Symlink {
            Some(fs::read_link(&path).map_err(|e| io_err(e, &path))?)
        } else {
            None
        };

        let size = if kind == EntryKind::File { meta.len() } else { 0 };
        Ok(Entry {
            uname: user_name(meta.uid()),
            gname: group_name(meta.gid()),
            path,
            rel_path,
            kind,
            size,
            mode: meta.mode() & 0o7777,
            uid: meta.uid() as u64,
            gid: meta.gid() as u64,
            mtime: meta.mtime(),
            link_target,
        })
    }
}

fn user_name(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_default()
}

fn group_name(gid: u32) -> String {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_default()
}

/// A contiguous slice of the global list owned by one worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Global index of the first owned entry.
    pub start: usize,
    /// Number of owned entries.
    pub count: usize,
}

impl Partition {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.count
    }
}

/// Compute the entry range owned by worker `rank` out of `ranks`, splitting
/// `total` entries as evenly as possible with the remainder going to the
/// lowest ranks.
pub fn partition(total: usize, rank: usize, ranks: usize) -> Partition {
    let q = total / ranks;
    let rem = total % ranks;
    let start = rank * q + rank.min(rem);
    let count = q + usize::from(rank < rem);
    Partition { start, count }
}

/// Globally path-sorted inventory of source items.
#[derive(Debug, Default)]
pub struct FileList {
    entries: Vec<Entry>,
}

impl FileList {
    /// Build a list by walking the given source roots. Symlinks are recorded,
    /// not followed. Entries are sorted by absolute path so parent
    /// directories always precede their children.
    pub fn walk(inputs: &[PathBuf], anchor: &Path) -> Result<Self, ArchiveError> {
        let mut entries = Vec::new();
        for input in inputs {
            for item in WalkDir::new(input).follow_links(false) {
                let item = item.map_err(|e| {
                    ArchiveError::Other(Box::new(e))
                })?;
                let path = item.path().to_path_buf();
                let meta = fs::symlink_metadata(&path).map_err(|e| io_err(e, &path))?;
                let rel_path = relative_to(&path, anchor);
                if rel_path.as_os_str().is_empty() {
                    continue;
                }
                entries.push(Entry::from_metadata(path, rel_path, &meta)?);
            }
        }
        Ok(Self::from_entries(entries))
    }

    /// Wrap an existing entry set, sorting it into archive order.
    pub fn from_entries(mut entries: Vec<Entry>) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        FileList { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Entry {
        &self.entries[idx]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    /// Total bytes held in regular files.
    pub fn sum_file_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.size)
            .sum()
    }

    /// Partition owned by `rank` out of `ranks` workers.
    pub fn partition(&self, rank: usize, ranks: usize) -> Partition {
        partition(self.entries.len(), rank, ranks)
    }
}

/// Compute the member name for `path` under `anchor`. Falls back to the path
/// itself with leading separators trimmed when it does not live under the
/// anchor.
pub fn relative_to(path: &Path, anchor: &Path) -> PathBuf {
    match path.strip_prefix(anchor) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path
            .components()
            .skip_while(|c| *c == std::path::Component::RootDir)
            .collect(),
    }
}

/// Pre-flight validation: at least one source must be readable, and the
/// destination must either already exist (we warn and overwrite) or have a
/// writable parent directory.
pub fn check_archive_paths(inputs: &[PathBuf], dest: &Path) -> Result<(), ArchiveError> {
    let mut readable = 0;
    for input in inputs {
        if fs::metadata(input).is_ok() {
            readable += 1;
        } else {
            eprintln!("[partar] Could not read '{}'", input.display());
        }
    }
    if readable == 0 {
        return Err(ArchiveError::Failed(
            "at least one valid source must be specified".to_string(),
        ));
    }

    if dest.exists() {
        eprintln!("[partar] Destination target exists, we will overwrite");
    } else {
        let parent = dest.parent().filter(|p| !p.as_os_str().is_empty());
        let parent = parent.unwrap_or(Path::new("."));
        let meta = fs::metadata(parent).map_err(|e| io_err(e, parent))?;
        if meta.permissions().readonly() {
            return Err(ArchiveError::Failed(format!(
                "destination parent directory is not writable: '{}'",
                parent.display()
            )));
        }
    }
    Ok(())
}
