//! Archive layout planning.
//!
//! Pass one: every worker sizes the entries in its partition of the sorted
//! file list (exact encoded header length, file data padded to 512 bytes)
//! and accumulates local offsets. Pass two: an exclusive prefix-sum over the
//! per-worker byte totals shifts local offsets to authoritative global
//! offsets. Because the list is globally sorted and partitions are
//! contiguous, the resulting offsets are monotone in path order across the
//! whole archive.

use crate::collective::Collective;
use crate::flist::{EntryKind, FileList};
use crate::header::{encode_header, pad512};
use crate::options::ArchiveOpts;

/// Planner output for one entry.
pub struct EntryLayout {
    /// Exact encoded header length in bytes.
    pub header_size: u64,
    /// 0 for non-files; `ceil(size / 512) * 512` for regular files.
    pub padded_data_size: u64,
    /// Absolute byte position of the entry's header within the archive.
    pub global_offset: u64,
    /// The encoded header, written verbatim by the header phase. Empty for
    /// skipped entries.
    pub header_bytes: Vec<u8>,
}

impl EntryLayout {
    pub fn entry_size(&self) -> u64 {
        self.header_size + self.padded_data_size
    }

    /// Offset of the first data byte (files only).
    pub fn data_offset(&self) -> u64 {
        self.global_offset + self.header_size
    }
}

/// Layout of one worker's partition plus the global totals.
pub struct Layout {
    /// One record per local entry, in partition order.
    pub entries: Vec<EntryLayout>,
    /// Sum of local entry sizes.
    pub local_bytes: u64,
    /// Size of the archive body across all workers (headers + padded data,
    /// excluding the 1024-byte terminator).
    pub archive_body_size: u64,
    /// Global padded data byte total, used for progress reporting.
    pub total_data_bytes: u64,
    /// True if any entry in any partition failed to encode.
    pub encode_failed: bool,
}

/// Compute the layout for `rank`'s partition of `flist`.
pub fn plan(
    flist: &FileList,
    rank: usize,
    coll: &Collective,
    opts: &ArchiveOpts,
) -> Layout {
    let part = flist.partition(rank, coll.ranks());
    let mut entries = Vec::with_capacity(part.count);
    let mut local_bytes = 0u64;
    let mut data_bytes = 0u64;
    let mut failed = false;

    for idx in part.range() {
        let entry = flist.get(idx);
        let record = match entry.kind {
            EntryKind::File | EntryKind::Dir | EntryKind::Symlink => {
                match encode_header(entry, opts) {
                    Ok(bytes) => {
                        let padded = if entry.kind == EntryKind::File {
                            pad512(entry.size)
                        } else {
                            0
                        };
                        data_bytes += padded;
                        EntryLayout {
                            header_size: bytes.len() as u64,
                            padded_data_size: padded,
                            global_offset: local_bytes,
                            header_bytes: bytes,
                        }
                    }
                    Err(e) => {
                        eprintln!("[partar] {}", e);
                        failed = true;
                        EntryLayout {
                            header_size: 0,
                            padded_data_size: 0,
                            global_offset: local_bytes,
                            header_bytes: Vec::new(),
                        }
                    }
                }
            }
            EntryKind::Other => {
                eprintln!(
                    "[partar] Unsupported type, cannot archive '{}'",
                    entry.path.display()
                );
                EntryLayout {
                    header_size: 0,
                    padded_data_size: 0,
                    global_offset: local_bytes,
                    header_bytes: Vec::new(),
                }
            }
        };
        local_bytes += record.entry_size();
        entries.push(record);
    }

    let archive_body_size = coll.allreduce_sum(rank, local_bytes);
    let total_data_bytes = coll.allreduce_sum(rank, data_bytes);
    let global_prefix = coll.exscan_sum(rank, local_bytes);
    for record in &mut entries {
        record.global_offset += global_prefix;
    }

    Layout {
        entries,
        local_bytes,
        archive_body_size,
        total_data_bytes,
        encode_failed: failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::run_team;
    use crate::flist::{Entry, EntryKind, FileList};
    use std::path::PathBuf;

    fn entry(rel: &str, kind: EntryKind, size: u64) -> Entry {
        Entry {
            path: PathBuf::from("/src").join(rel),
            rel_path: PathBuf::from(rel),
            kind,
            size,
            mode: 0o755,
            uid: 0,
            gid: 0,
            uname: "root".to_string(),
            gname: "root".to_string(),
            mtime: 1_700_000_000,
            link_target: None,
        }
    }

    fn sample_list() -> FileList {
        FileList::from_entries(vec![
            entry("dir", EntryKind::Dir, 0),
            entry("dir/a", EntryKind::File, 3),
            entry("dir/b", EntryKind::File, 513),
            entry("dir/c", EntryKind::File, 512),
            entry("dir/d", EntryKind::File, 0),
        ])
    }

    #[test]
    fn offsets_are_monotone_and_aligned() {
        let flist = sample_list();
        let opts = ArchiveOpts::default();
        for ranks in [1usize, 2, 3] {
            let layouts = run_team(ranks, |rank, coll| plan(&flist, rank, coll, &opts));
            let all: Vec<&EntryLayout> =
                layouts.iter().flat_map(|l| l.entries.iter()).collect();
            assert_eq!(all.len(), flist.len());
            let mut expect = 0u64;
            for record in &all {
                assert_eq!(record.global_offset, expect);
                assert_eq!(record.global_offset % 512, 0);
                expect += record.entry_size();
            }
            assert_eq!(layouts[0].archive_body_size, expect);
        }
    }

    #[test]
    fn padding_rules() {
        let flist = sample_list();
        let opts = ArchiveOpts::default();
        let layouts = run_team(1, |rank, coll| plan(&flist, rank, coll, &opts));
        let records = &layouts[0].entries;
        // dir
        assert_eq!(records[0].padded_data_size, 0);
        // 3 bytes -> one block
        assert_eq!(records[1].padded_data_size, 512);
        // 513 bytes -> two blocks
        assert_eq!(records[2].padded_data_size, 1024);
        // exactly 512 -> one block, no extra padding
        assert_eq!(records[3].padded_data_size, 512);
        // empty file -> no data region
        assert_eq!(records[4].padded_data_size, 0);
    }

    #[test]
    fn partition_totals_match_single_worker() {
        let flist = sample_list();
        let opts = ArchiveOpts::default();
        let single = run_team(1, |rank, coll| plan(&flist, rank, coll, &opts));
        let multi = run_team(3, |rank, coll| plan(&flist, rank, coll, &opts));
        assert_eq!(single[0].archive_body_size, multi[0].archive_body_size);
        assert_eq!(single[0].total_data_bytes, multi[1].total_data_bytes);
    }
}
