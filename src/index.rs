//! Sidecar offset index.
//!
//! `<archive>.idx` holds one 64-bit big-endian offset per entry, in entry
//! order, with no header; the entry count is derived from the file size.
//! Worker 0 performs all index file I/O; the other workers contribute their
//! offsets through the collective gather and receive read results through a
//! broadcast.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::collective::Collective;
use crate::error::ArchiveError;

/// Path of the index file for `archive`.
pub fn index_path(archive: &Path) -> PathBuf {
    let mut name = OsString::from(archive.as_os_str());
    name.push(".idx");
    PathBuf::from(name)
}

/// Collectively write the index. Every worker passes the offsets of its own
/// entries in entry order; worker 0 gathers the full array and writes the
/// file. Any failure fails the operation on all workers.
pub fn write_index(
    archive: &Path,
    rank: usize,
    coll: &Collective,
    local_offsets: &[u64],
) -> Result<(), ArchiveError> {
    let all = coll.allgatherv(rank, local_offsets);

    let mut ok = true;
    if rank == 0 {
        let path = index_path(archive);
        match write_offsets(&path, &all) {
            Ok(()) => {}
            Err(e) => {
                eprintln!("[partar] Failed to write index '{}': {}", path.display(), e);
                ok = false;
            }
        }
    }
    if coll.alltrue(rank, ok) {
        Ok(())
    } else {
        Err(ArchiveError::Failed("failed to write offset index".to_string()))
    }
}

fn write_offsets(path: &Path, offsets: &[u64]) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for &offset in offsets {
        writer.write_u64::<BigEndian>(offset)?;
    }
    writer.flush()
}

/// Collectively read the index. Returns `Ok(None)` when the index file is
/// missing or unreadable (the caller falls back to scanning); this is not an
/// error. On success every worker receives the full offset array.
pub fn read_index(
    archive: &Path,
    rank: usize,
    coll: &Collective,
) -> Result<Option<Vec<u64>>, ArchiveError> {
    let offsets = if rank == 0 {
        read_offsets(&index_path(archive))
    } else {
        None
    };
    let have = coll.broadcast(rank, 0, offsets.is_some());
    if !have {
        return Ok(None);
    }
    let offsets = coll.broadcast(rank, 0, offsets.unwrap_or_default());
    if rank == 0 {
        println!("[partar] Read index {}", index_path(archive).display());
    }
    Ok(Some(offsets))
}

fn read_offsets(path: &Path) -> Option<Vec<u64>> {
    let file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let count = (len / 8) as usize;
    let mut reader = BufReader::new(file);
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        match reader.read_u64::<BigEndian>() {
            Ok(v) => offsets.push(v),
            Err(e) => {
                eprintln!("[partar] Failed to read index '{}': {}", path.display(), e);
                return None;
            }
        }
    }
    Some(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::run_team;

    #[test]
    fn index_path_appends_suffix() {
        assert_eq!(
            index_path(Path::new("/tmp/out.tar")),
            PathBuf::from("/tmp/out.tar.idx")
        );
    }

    #[test]
    fn gathered_write_then_broadcast_read() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.tar");

        // two workers each contribute their half in entry order
        let halves = [vec![0u64, 512], vec![1536, 2048, 4096]];
        run_team(2, |rank, coll| {
            write_index(&archive, rank, coll, &halves[rank]).unwrap();
        });

        let raw = std::fs::read(index_path(&archive)).unwrap();
        assert_eq!(raw.len(), 5 * 8);
        assert_eq!(&raw[..8], &[0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&raw[8..16], &[0, 0, 0, 0, 0, 0, 2, 0]);

        let reads = run_team(2, |rank, coll| read_index(&archive, rank, coll).unwrap());
        for offsets in reads {
            assert_eq!(offsets, Some(vec![0, 512, 1536, 2048, 4096]));
        }
    }

    #[test]
    fn missing_index_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("missing.tar");
        let reads = run_team(2, |rank, coll| read_index(&archive, rank, coll).unwrap());
        for offsets in reads {
            assert_eq!(offsets, None);
        }
    }
}
