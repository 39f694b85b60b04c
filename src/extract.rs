//! Archive extraction.
//!
//! Offsets for random access come from the sidecar index when present, or
//! from a one-worker scan of the archive. With offsets in hand, entries are
//! partitioned contiguously across workers, metadata is parsed directly at
//! each entry's offset, directories are created ahead of any file, and file
//! contents move through one of two backends. Without offsets (compressed
//! archives), every worker streams the archive from the start and owns
//! every `ranks`-th entry.

use std::fs::{self, File, Permissions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use flate2::read::GzDecoder;

use crate::collective::{run_team, Collective};
use crate::error::{io_err, ArchiveError};
use crate::fdcache::{copy_range, FdCache};
use crate::flist::{partition, EntryKind};
use crate::index;
use crate::options::{ArchiveOpts, ExtractBackend};
use crate::progress::{ProgressTracker, WorkerCounters};
use crate::summary::OpTimer;

/// Metadata parsed from one archive member.
#[derive(Clone, Debug)]
struct MemberMeta {
    /// Member name from the archive; relative, sanitized.
    rel_path: PathBuf,
    kind: EntryKind,
    size: u64,
    mode: u32,
    mtime: i64,
    /// Index of this member in archive order.
    global_idx: usize,
}

/// Extract all members of `archive` beneath the `dest` anchor directory.
pub fn extract_archive(
    archive: &Path,
    dest: &Path,
    opts: &ArchiveOpts,
) -> Result<(), ArchiveError> {
    let ranks = opts.team_size();

    println!("[partar] Extracting {}", archive.display());
    let timer = OpTimer::start();
    fs::create_dir_all(dest).map_err(|e| io_err(e, dest))?;

    let mut tracker = ProgressTracker::new("Extracted", ranks, opts.progress_interval);
    let archive_len = fs::metadata(archive).map_err(|e| io_err(e, archive))?.len();
    tracker.set_totals(0, archive_len);
    let tracker = &tracker;

    let results = run_team(ranks, |rank, coll| {
        worker_extract(archive, dest, opts, rank, coll, tracker)
    });
    let outcome: Result<Vec<()>, ArchiveError> = results.into_iter().collect();

    tracker.finish();
    timer.finish(tracker.state().processed_bytes);
    outcome.map(|_| ())
}

/// Print one line per archive member without extracting anything.
pub fn list_archive(archive: &Path) -> Result<(), ArchiveError> {
    let reader = stream_reader(archive)?;
    let mut ar = tar::Archive::new(reader);
    let mut count = 0usize;
    for entry in ar.entries().map_err(format_err)? {
        let entry = entry.map_err(format_err)?;
        let path = entry.path().map_err(format_err)?.into_owned();
        println!("- {} ({} bytes)", path.display(), entry.size());
        count += 1;
    }
    println!("[partar] {} items", count);
    Ok(())
}

fn worker_extract(
    archive: &Path,
    dest: &Path,
    opts: &ArchiveOpts,
    rank: usize,
    coll: &Collective,
    tracker: &ProgressTracker,
) -> Result<(), ArchiveError> {
    let counters = tracker.counters(rank);

    // Step 1: locate entry offsets. Index first, then a scan; a scan
    // failure (e.g. a compressed archive) falls through to streaming.
    let from_index = index::read_index(archive, rank, coll)?;
    let have_index = from_index.is_some();
    let offsets = match from_index {
        Some(offsets) => Some(offsets),
        None => {
            let scanned = if rank == 0 {
                match scan_entry_offsets(archive) {
                    Ok(offsets) => Some(offsets),
                    Err(e) => {
                        eprintln!("[partar] Cannot index archive ({}), streaming instead", e);
                        None
                    }
                }
            } else {
                None
            };
            let have = coll.broadcast(rank, 0, scanned.is_some());
            if have {
                Some(coll.broadcast(rank, 0, scanned.unwrap_or_default()))
            } else {
                None
            }
        }
    };

    match offsets {
        Some(offsets) => extract_with_offsets(
            archive, dest, opts, rank, coll, &offsets, have_index, &counters, tracker,
        ),
        None => extract_streaming(archive, dest, opts, rank, coll, &counters, tracker),
    }
}

#[allow(clippy::too_many_arguments)]
fn extract_with_offsets(
    archive: &Path,
    dest: &Path,
    opts: &ArchiveOpts,
    rank: usize,
    coll: &Collective,
    offsets: &[u64],
    have_index: bool,
    counters: &WorkerCounters,
    tracker: &ProgressTracker,
) -> Result<(), ArchiveError> {
    let ranks = coll.ranks();
    let part = partition(offsets.len(), rank, ranks);

    let file = File::open(archive);
    if !coll.alltrue(rank, file.is_ok()) {
        return Err(ArchiveError::Failed(format!(
            "failed to open archive '{}'",
            archive.display()
        )));
    }
    let mut file = file.map_err(|e| io_err(e, archive))?;

    // Step 3: parse metadata at each owned offset. A parse failure here is
    // how a stale index surfaces; fail the whole operation cleanly.
    let mut local_meta = Vec::with_capacity(part.count);
    let mut local_data_offsets = Vec::with_capacity(part.count);
    let mut ok = true;
    for idx in part.range() {
        match parse_member_at(&mut file, offsets[idx], idx) {
            Ok((meta, data_offset)) => {
                local_data_offsets.push(data_offset);
                local_meta.push(meta);
            }
            Err(e) => {
                eprintln!("[partar] {}", e);
                ok = false;
                break;
            }
        }
    }
    if !coll.alltrue(rank, ok) {
        return Err(ArchiveError::Format(
            "failed to read entry metadata (archive and index may not match)".to_string(),
        ));
    }

    // Every worker can look up any entry's data offset by global index.
    let data_offsets = coll.allgatherv(rank, &local_data_offsets);

    // Share the member table so the chunk walk below can cover all files.
    let mut members: Vec<MemberMeta> = Vec::with_capacity(offsets.len());
    for root in 0..ranks {
        let share = if rank == root { local_meta.clone() } else { Vec::new() };
        members.extend(coll.broadcast(rank, root, share));
    }

    // Step 4: all directories exist before any file is created.
    let mut failed = false;
    for meta in &members[part.range()] {
        if meta.kind == EntryKind::Dir {
            if let Err(e) = fs::create_dir_all(dest.join(&meta.rel_path)) {
                eprintln!("[partar] Failed to create directory '{}': {}", meta.rel_path.display(), e);
                failed = true;
            }
        }
    }
    coll.barrier();

    // Step 5: file contents.
    match opts.extract_backend {
        ExtractBackend::TarReader => {
            failed |= copy_with_reader(&mut file, dest, opts, offsets, &members, part.range(), counters, tracker);
            coll.barrier();
            failed |= apply_metadata(dest, &members[part.range()], true);
        }
        ExtractBackend::DirectPositional => {
            if rank == 0 {
                failed |= precreate_files(dest, &members);
            }
            coll.barrier();
            failed |= copy_chunks(&file, dest, opts, rank, ranks, &members, &data_offsets, counters, tracker);
            failed |= create_symlinks(&mut file, dest, offsets, &members, part.range());
            if opts.preserve {
                failed |= restore_xattrs(&mut file, dest, offsets, &members, part.range());
            }
            coll.barrier();
            failed |= apply_metadata(dest, &members[part.range()], false);
        }
    }

    // Step 6: persist scanned offsets so the next extraction seeks directly.
    if !have_index {
        index::write_index(archive, rank, coll, &offsets[part.range()])?;
    }

    if !coll.alltrue(rank, !failed) {
        return Err(ArchiveError::Failed("failed to extract all items".to_string()));
    }
    Ok(())
}

/// Streaming path: every worker reads the archive from offset zero; the
/// worker with `index mod ranks == rank` owns each entry. Handles
/// gzip-compressed archives.
fn extract_streaming(
    archive: &Path,
    dest: &Path,
    opts: &ArchiveOpts,
    rank: usize,
    coll: &Collective,
    counters: &WorkerCounters,
    tracker: &ProgressTracker,
) -> Result<(), ArchiveError> {
    let ranks = coll.ranks();

    // Pass 1: metadata for owned entries.
    let mut owned: Vec<MemberMeta> = Vec::new();
    let mut ok = true;
    match stream_reader(archive) {
        Ok(reader) => {
            let mut ar = tar::Archive::new(reader);
            match ar.entries() {
                Ok(entries) => {
                    for (count, entry) in entries.enumerate() {
                        match entry {
                            Ok(mut entry) => {
                                if count % ranks == rank {
                                    match member_from_entry(&mut entry, count) {
                                        Ok(meta) => owned.push(meta),
                                        Err(e) => {
                                            eprintln!("[partar] {}", e);
                                            ok = false;
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                eprintln!("[partar] Failed to read entry {}: {}", count, e);
                                ok = false;
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    eprintln!("[partar] {}", e);
                    ok = false;
                }
            }
        }
        Err(e) => {
            eprintln!("[partar] {}", e);
            ok = false;
        }
    }
    if !coll.alltrue(rank, ok) {
        return Err(ArchiveError::Format("failed to read archive".to_string()));
    }

    // Directories first.
    let mut failed = false;
    for meta in &owned {
        if meta.kind == EntryKind::Dir {
            if let Err(e) = fs::create_dir_all(dest.join(&meta.rel_path)) {
                eprintln!("[partar] Failed to create directory '{}': {}", meta.rel_path.display(), e);
                failed = true;
            }
        }
    }
    coll.barrier();

    // Pass 2: unpack owned entries.
    match stream_reader(archive) {
        Ok(reader) => {
            let mut ar = tar::Archive::new(reader);
            ar.set_preserve_permissions(true);
            ar.set_preserve_mtime(true);
            if opts.preserve {
                ar.set_unpack_xattrs(true);
            }
            match ar.entries() {
                Ok(entries) => {
                    for (count, entry) in entries.enumerate() {
                        let owned_entry = count % ranks == rank;
                        match entry {
                            Ok(mut entry) => {
                                if !owned_entry {
                                    continue;
                                }
                                let size = entry.size();
                                if entry.header().entry_type().is_symlink() {
                                    remove_existing_link(dest, &entry);
                                }
                                match entry.unpack_in(dest) {
                                    Ok(_) => {
                                        counters.add_bytes(size);
                                        counters.add_item();
                                    }
                                    Err(e) => {
                                        eprintln!("[partar] Failed to unpack entry {}: {}", count, e);
                                        failed = true;
                                    }
                                }
                                tracker.maybe_emit();
                            }
                            Err(e) => {
                                eprintln!("[partar] Failed to read entry {}: {}", count, e);
                                failed = true;
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    eprintln!("[partar] {}", e);
                    failed = true;
                }
            }
        }
        Err(e) => {
            eprintln!("[partar] {}", e);
            failed = true;
        }
    }
    coll.barrier();

    // Creating files perturbed directory mtimes; fix them up last.
    failed |= apply_metadata(dest, &owned, true);

    if !coll.alltrue(rank, !failed) {
        return Err(ArchiveError::Failed("failed to extract all items".to_string()));
    }
    Ok(())
}

/// Scan an uncompressed archive, returning the byte offset of every entry's
/// header. Entry boundaries are reconstructed from each entry's data
/// position and padded size, so offsets include any pax blocks.
fn scan_entry_offsets(archive: &Path) -> Result<Vec<u64>, ArchiveError> {
    println!("[partar] Indexing archive");
    let file = File::open(archive).map_err(|e| io_err(e, archive))?;
    let mut ar = tar::Archive::new(file);
    let mut offsets = Vec::new();
    let mut pos = 0u64;
    for entry in ar.entries().map_err(format_err)? {
        let entry = entry.map_err(format_err)?;
        offsets.push(pos);
        pos = entry.raw_file_position() + crate::header::pad512(entry.size());
    }
    Ok(offsets)
}

/// Seek to `offset` and parse the single entry there.
fn parse_member_at(
    file: &mut File,
    offset: u64,
    global_idx: usize,
) -> Result<(MemberMeta, u64), ArchiveError> {
    file.seek(SeekFrom::Start(offset)).map_err(ArchiveError::from)?;
    let mut ar = tar::Archive::new(&mut *file);
    let mut entries = ar.entries().map_err(format_err)?;
    let mut entry = entries
        .next()
        .ok_or_else(|| {
            ArchiveError::Format(format!("unexpected end of archive at entry {}", global_idx))
        })?
        .map_err(format_err)?;
    let data_offset = offset + entry.raw_file_position();
    let meta = member_from_entry(&mut entry, global_idx)?;
    Ok((meta, data_offset))
}

fn member_from_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    global_idx: usize,
) -> Result<MemberMeta, ArchiveError> {
    let header = entry.header();
    let entry_type = header.entry_type();
    let kind = if entry_type.is_file() {
        EntryKind::File
    } else if entry_type.is_dir() {
        EntryKind::Dir
    } else if entry_type.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::Other
    };
    let mode = header.mode().map_err(format_err)?;
    let mtime = header.mtime().map_err(format_err)? as i64;
    let size = entry.size();
    let rel_path = entry.path().map_err(format_err)?.into_owned();

    let (rel_path, kind) = if safe_member_path(&rel_path) {
        (rel_path, kind)
    } else {
        eprintln!("[partar] Skipping entry with unsafe path '{}'", rel_path.display());
        (PathBuf::new(), EntryKind::Other)
    };
    Ok(MemberMeta { rel_path, kind, size, mode, mtime, global_idx })
}

/// Member names must be relative and free of parent-directory components.
fn safe_member_path(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Library-backed copy: seek to each owned entry and let the tar reader
/// stream its bytes to disk.
#[allow(clippy::too_many_arguments)]
fn copy_with_reader(
    file: &mut File,
    dest: &Path,
    opts: &ArchiveOpts,
    offsets: &[u64],
    members: &[MemberMeta],
    range: std::ops::Range<usize>,
    counters: &WorkerCounters,
    tracker: &ProgressTracker,
) -> bool {
    let mut failed = false;
    for idx in range {
        let meta = &members[idx];
        if meta.kind == EntryKind::Other {
            continue;
        }
        match unpack_at(file, offsets[idx], dest, opts) {
            Ok(bytes) => {
                counters.add_bytes(bytes);
                counters.add_item();
            }
            Err(e) => {
                eprintln!("[partar] {}", e);
                failed = true;
            }
        }
        tracker.maybe_emit();
    }
    failed
}

fn unpack_at(
    file: &mut File,
    offset: u64,
    dest: &Path,
    opts: &ArchiveOpts,
) -> Result<u64, ArchiveError> {
    file.seek(SeekFrom::Start(offset)).map_err(ArchiveError::from)?;
    let mut ar = tar::Archive::new(&mut *file);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(true);
    if opts.preserve {
        ar.set_unpack_xattrs(true);
    }
    let mut entries = ar.entries().map_err(format_err)?;
    let mut entry = entries
        .next()
        .ok_or_else(|| ArchiveError::Format(format!("unexpected end of archive at offset {}", offset)))?
        .map_err(format_err)?;
    let size = entry.size();
    if entry.header().entry_type().is_symlink() {
        remove_existing_link(dest, &entry);
    }
    entry.unpack_in(dest).map_err(format_err)?;
    Ok(size)
}

/// Replacing a symlink requires removing the old one first.
fn remove_existing_link<R: Read>(dest: &Path, entry: &tar::Entry<'_, R>) {
    if let Ok(rel) = entry.path() {
        let target = dest.join(rel);
        if target.symlink_metadata().is_ok() {
            let _ = fs::remove_file(&target);
        }
    }
}

/// Worker 0 pre-creates (and truncates) every regular file so chunk writes
/// from any worker land in an existing file.
fn precreate_files(dest: &Path, members: &[MemberMeta]) -> bool {
    let mut failed = false;
    for meta in members {
        if meta.kind != EntryKind::File {
            continue;
        }
        let path = dest.join(&meta.rel_path);
        if let Err(e) = File::create(&path) {
            eprintln!("[partar] Failed to create file '{}': {}", path.display(), e);
            failed = true;
        }
    }
    failed
}

/// Direct positional copy: every file is cut into chunks, each chunk is
/// owned round-robin by exactly one worker, and each chunk is one pread
/// from the archive plus one pwrite into the target file.
#[allow(clippy::too_many_arguments)]
fn copy_chunks(
    archive_file: &File,
    dest: &Path,
    opts: &ArchiveOpts,
    rank: usize,
    ranks: usize,
    members: &[MemberMeta],
    data_offsets: &[u64],
    counters: &WorkerCounters,
    tracker: &ProgressTracker,
) -> bool {
    let chunk_size = opts.chunk_size;
    let mut dst_cache = FdCache::new();
    let mut buf = vec![0u8; opts.buf_size.max(1)];
    let mut failed = false;
    let mut global_chunk = 0u64;

    for meta in members {
        if meta.kind != EntryKind::File || meta.size == 0 {
            continue;
        }
        let num_chunks = meta.size.div_ceil(chunk_size);
        for chunk_index in 0..num_chunks {
            let owned = global_chunk % ranks as u64 == rank as u64;
            global_chunk += 1;
            if !owned {
                continue;
            }
            let start = chunk_index * chunk_size;
            let want = chunk_size.min(meta.size - start);
            let path = dest.join(&meta.rel_path);
            let copied = dst_cache.open(&path, true).and_then(|dst| {
                copy_range(
                    archive_file,
                    dst,
                    data_offsets[meta.global_idx] + start,
                    start,
                    want,
                    &mut buf,
                )
                .map_err(|e| io_err(e, &path))
            });
            match copied {
                Ok(n) => {
                    counters.add_bytes(n);
                    if n < want {
                        eprintln!(
                            "[partar] Unexpected end of archive while extracting '{}'",
                            meta.rel_path.display()
                        );
                        failed = true;
                    }
                    if chunk_index == num_chunks - 1 {
                        counters.add_item();
                    }
                }
                Err(e) => {
                    eprintln!("[partar] {}", e);
                    failed = true;
                }
            }
            tracker.maybe_emit();
        }
    }
    failed
}

/// Symlink targets are not carried in the member table; parse each owned
/// symlink entry again to recover its target, then create the link.
fn create_symlinks(
    file: &mut File,
    dest: &Path,
    offsets: &[u64],
    members: &[MemberMeta],
    range: std::ops::Range<usize>,
) -> bool {
    let mut failed = false;
    for idx in range {
        let meta = &members[idx];
        if meta.kind != EntryKind::Symlink {
            continue;
        }
        match read_link_target(file, offsets[idx]) {
            Ok(target) => {
                let path = dest.join(&meta.rel_path);
                if path.symlink_metadata().is_ok() {
                    let _ = fs::remove_file(&path);
                }
                if let Err(e) = symlink(&target, &path) {
                    eprintln!("[partar] Failed to create symlink '{}': {}", path.display(), e);
                    failed = true;
                }
            }
            Err(e) => {
                eprintln!("[partar] {}", e);
                failed = true;
            }
        }
    }
    failed
}

/// Extended attributes travel as pax `SCHILY.xattr.*` records, which the
/// member table does not carry; re-parse each owned entry and apply them to
/// the extracted item.
fn restore_xattrs(
    file: &mut File,
    dest: &Path,
    offsets: &[u64],
    members: &[MemberMeta],
    range: std::ops::Range<usize>,
) -> bool {
    let mut failed = false;
    for idx in range {
        let meta = &members[idx];
        if !matches!(meta.kind, EntryKind::File | EntryKind::Dir) {
            continue;
        }
        match read_xattr_records(file, offsets[idx]) {
            Ok(records) => {
                let path = dest.join(&meta.rel_path);
                for (name, value) in records {
                    if let Err(e) = xattr::set(&path, &name, &value) {
                        eprintln!(
                            "[partar] Failed to set xattr '{}' on '{}': {}",
                            name,
                            path.display(),
                            e
                        );
                        failed = true;
                    }
                }
            }
            Err(e) => {
                eprintln!("[partar] {}", e);
                failed = true;
            }
        }
    }
    failed
}

fn read_xattr_records(
    file: &mut File,
    offset: u64,
) -> Result<Vec<(String, Vec<u8>)>, ArchiveError> {
    file.seek(SeekFrom::Start(offset)).map_err(ArchiveError::from)?;
    let mut ar = tar::Archive::new(&mut *file);
    let mut entries = ar.entries().map_err(format_err)?;
    let mut entry = entries
        .next()
        .ok_or_else(|| ArchiveError::Format(format!("unexpected end of archive at offset {}", offset)))?
        .map_err(format_err)?;
    let mut records = Vec::new();
    if let Ok(Some(exts)) = entry.pax_extensions() {
        for ext in exts.flatten() {
            if let Some(name) = ext.key().ok().and_then(|k| k.strip_prefix("SCHILY.xattr.")) {
                records.push((name.to_string(), ext.value_bytes().to_vec()));
            }
        }
    }
    Ok(records)
}

fn read_link_target(file: &mut File, offset: u64) -> Result<PathBuf, ArchiveError> {
    file.seek(SeekFrom::Start(offset)).map_err(ArchiveError::from)?;
    let mut ar = tar::Archive::new(&mut *file);
    let mut entries = ar.entries().map_err(format_err)?;
    let mut entry = entries
        .next()
        .ok_or_else(|| ArchiveError::Format(format!("unexpected end of archive at offset {}", offset)))?
        .map_err(format_err)?;

    // Long targets live in a pax `linkpath` record; short ones in the
    // header's link field.
    if let Ok(Some(exts)) = entry.pax_extensions() {
        for ext in exts.flatten() {
            if ext.key().ok() == Some("linkpath") {
                let bytes = ext.value_bytes();
                return Ok(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)));
            }
        }
    }
    match entry.link_name().map_err(format_err)? {
        Some(target) => Ok(target.into_owned()),
        None => Err(ArchiveError::Format(format!(
            "entry at offset {} is not a symlink as expected",
            offset
        ))),
    }
}

/// Restore permissions and timestamps. With `dirs_only`, touch just the
/// directories (the library-backed paths already set file metadata).
fn apply_metadata(dest: &Path, members: &[MemberMeta], dirs_only: bool) -> bool {
    let mut failed = false;
    for meta in members {
        let wanted = match meta.kind {
            EntryKind::Dir => true,
            EntryKind::File => !dirs_only,
            _ => false,
        };
        if !wanted {
            continue;
        }
        let path = dest.join(&meta.rel_path);
        if let Err(e) = fs::set_permissions(&path, Permissions::from_mode(meta.mode)) {
            eprintln!("[partar] Failed to set permissions on '{}': {}", path.display(), e);
            failed = true;
        }
        if let Err(e) = filetime::set_file_mtime(&path, FileTime::from_unix_time(meta.mtime, 0)) {
            eprintln!("[partar] Failed to set mtime on '{}': {}", path.display(), e);
            failed = true;
        }
    }
    failed
}

/// Open the archive for sequential reading, transparently decoding gzip.
fn stream_reader(archive: &Path) -> Result<Box<dyn Read>, ArchiveError> {
    let mut file = File::open(archive).map_err(|e| io_err(e, archive))?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic).map_err(|e| io_err(e, archive))?;
    file.seek(SeekFrom::Start(0)).map_err(|e| io_err(e, archive))?;
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn format_err(e: std::io::Error) -> ArchiveError {
    ArchiveError::Format(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_path_safety() {
        assert!(safe_member_path(Path::new("dir/file.txt")));
        assert!(safe_member_path(Path::new("./dir/file.txt")));
        assert!(!safe_member_path(Path::new("../escape")));
        assert!(!safe_member_path(Path::new("/absolute")));
        assert!(!safe_member_path(Path::new("dir/../../escape")));
        assert!(!safe_member_path(Path::new("")));
    }
}
