//! Archive creation.
//!
//! Phases (§ barrier between headers and data):
//!   1. plan the layout (header sizes, padded data sizes, global offsets)
//!   2. worker 0 removes any stale file, sizes the archive and preallocates
//!   3. every worker positional-writes its entries' headers
//!   4. file data is copied in parallel by one of two backends
//!   5. worker 0 writes the two 512-byte terminator blocks
//!   6. close, reduce errors, write the sidecar index
//!
//! The two data backends produce byte-identical archives: both honor the
//! offsets fixed at plan time, and the data region past each file's end is
//! already zero from the preallocation (the work-stealing backend also
//! writes the padding explicitly when it finishes a file's last chunk).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::collective::{run_team, Collective};
use crate::error::{io_err, ArchiveError};
use crate::fdcache::{copy_range, FdCache};
use crate::flist::{EntryKind, FileList};
use crate::header::pad512;
use crate::index;
use crate::layout::{plan, Layout};
use crate::options::{ArchiveOpts, CreateBackend};
use crate::progress::{ProgressTracker, WorkerCounters};
use crate::summary::OpTimer;
use crate::workitem::{OpCode, WorkItem};

/// Two 512-byte zero blocks mark the end of the archive.
const TERMINATOR_LEN: u64 = 1024;

/// Write all items of `flist` to a new archive at `archive`.
pub fn create_archive(
    flist: &FileList,
    archive: &Path,
    opts: &ArchiveOpts,
) -> Result<(), ArchiveError> {
    let backend = opts.resolved_create_backend();
    let ranks = opts.team_size();

    println!("[partar] Writing archive to {}", archive.display());
    let started = OpTimer::start();

    let total_data: u64 = flist
        .iter()
        .filter(|e| e.kind == EntryKind::File)
        .map(|e| pad512(e.size))
        .sum();
    let mut tracker = ProgressTracker::new("Tarred", ranks, opts.progress_interval);
    tracker.set_totals(flist.len() as u64, total_data);
    let tracker = &tracker;

    // Work queue shared by all workers in the stealing backend.
    let (tx, rx): (Sender<String>, Receiver<String>) = unbounded();
    let queue = (&tx, &rx);

    let results = run_team(ranks, |rank, coll| {
        worker_create(flist, archive, opts, backend, rank, coll, queue, tracker)
    });
    let archive_size = results.into_iter().collect::<Result<Vec<_>, _>>()?[0] + TERMINATOR_LEN;

    tracker.finish();
    started.finish(archive_size);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn worker_create(
    flist: &FileList,
    archive: &Path,
    opts: &ArchiveOpts,
    backend: CreateBackend,
    rank: usize,
    coll: &Collective,
    queue: (&Sender<String>, &Receiver<String>),
    tracker: &ProgressTracker,
) -> Result<u64, ArchiveError> {
    let counters = tracker.counters(rank);

    // Phase 1: layout.
    let layout = plan(flist, rank, coll, opts);
    if !coll.alltrue(rank, !layout.encode_failed) {
        return Err(ArchiveError::Failed("failed to encode entry headers".to_string()));
    }
    let final_size = layout.archive_body_size + TERMINATOR_LEN;

    // Phase 2: worker 0 sizes and preallocates the archive file.
    let mut ok = true;
    if rank == 0 {
        if let Err(e) = preallocate(archive, final_size) {
            eprintln!("[partar] {}", e);
            ok = false;
        }
    }
    if !coll.alltrue(rank, ok) {
        return Err(ArchiveError::Failed(format!(
            "failed to create archive '{}'",
            archive.display()
        )));
    }

    let out = OpenOptions::new().write(true).open(archive);
    if !coll.alltrue(rank, out.is_ok()) {
        return Err(ArchiveError::Failed(format!(
            "failed to open archive '{}'",
            archive.display()
        )));
    }
    let out = out.map_err(|e| io_err(e, archive))?;

    // Phase 3: headers. Writes land at disjoint offsets, so no coordination
    // is needed until the barrier below.
    let mut failed = false;
    for record in &layout.entries {
        if record.header_bytes.is_empty() {
            continue;
        }
        if let Err(e) = out.write_all_at(&record.header_bytes, record.global_offset) {
            eprintln!("[partar] Failed to write header at offset {}: {}", record.global_offset, e);
            failed = true;
        }
    }
    coll.barrier();

    // Phase 4: file data.
    let part = flist.partition(rank, coll.ranks());
    let data_failed = match backend {
        CreateBackend::WorkStealing => {
            data_phase_steal(flist, &layout, part.start, &out, opts, coll, queue, &counters, tracker)
        }
        CreateBackend::StaticChunk => {
            data_phase_chunk(flist, &layout, &out, opts, rank, coll, &counters, tracker)
        }
    };
    failed = failed || data_failed;

    // Phase 5: terminator.
    coll.barrier();
    if rank == 0 {
        let zeros = [0u8; TERMINATOR_LEN as usize];
        if let Err(e) = out.write_all_at(&zeros, layout.archive_body_size) {
            eprintln!("[partar] Failed to write archive terminator: {}", e);
            failed = true;
        }
    }

    // Phase 6: close, reduce, index.
    drop(out);
    let all_ok = coll.alltrue(rank, !failed);

    let offsets: Vec<u64> = layout.entries.iter().map(|r| r.global_offset).collect();
    index::write_index(archive, rank, coll, &offsets)?;

    if !all_ok {
        return Err(ArchiveError::Failed("one or more workers failed to write the archive".to_string()));
    }
    Ok(layout.archive_body_size)
}

/// Remove any existing file, then size and preallocate the new archive.
fn preallocate(archive: &Path, size: u64) -> Result<(), ArchiveError> {
    let _ = std::fs::remove_file(archive);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(archive)
        .map_err(|e| io_err(e, archive))?;
    file.set_len(size).map_err(|e| io_err(e, archive))?;
    if size > 0 {
        // Best effort; the file is already sized by set_len.
        let _ = nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, size as i64);
    }
    Ok(())
}

/// Work-stealing data phase: one queue item per chunk of every regular file
/// we own, then all workers drain the shared queue until it is empty.
#[allow(clippy::too_many_arguments)]
fn data_phase_steal(
    flist: &FileList,
    layout: &Layout,
    part_start: usize,
    out: &File,
    opts: &ArchiveOpts,
    coll: &Collective,
    (tx, rx): (&Sender<String>, &Receiver<String>),
    counters: &WorkerCounters,
    tracker: &ProgressTracker,
) -> bool {
    let chunk_size = opts.chunk_size;
    let mut failed = false;

    for (local_idx, record) in layout.entries.iter().enumerate() {
        let entry = flist.get(part_start + local_idx);
        if entry.kind != EntryKind::File || record.header_bytes.is_empty() {
            continue;
        }
        let item = WorkItem {
            file_size: entry.size,
            chunk_index: 0,
            data_offset: record.data_offset(),
            code: OpCode::CopyData,
            path: entry.path.clone(),
        };
        let num_chunks = entry.size / chunk_size;
        for chunk_index in 0..num_chunks {
            let encoded = WorkItem { chunk_index, ..item.clone() }.encode();
            match encoded {
                Ok(s) => {
                    let _ = tx.send(s);
                }
                Err(e) => {
                    eprintln!("[partar] {}", e);
                    failed = true;
                }
            }
        }
        // trailing partial chunk, or the single chunk of a short file
        if num_chunks * chunk_size < entry.size || num_chunks == 0 {
            match (WorkItem { chunk_index: num_chunks, ..item }).encode() {
                Ok(s) => {
                    let _ = tx.send(s);
                }
                Err(e) => {
                    eprintln!("[partar] {}", e);
                    failed = true;
                }
            }
        }
    }

    // All items are queued before anyone starts pulling, so an empty queue
    // below means the data phase is globally complete.
    coll.barrier();

    let mut src_cache = FdCache::new();
    let mut buf = vec![0u8; opts.buf_size.max(1)];
    while let Ok(encoded) = rx.try_recv() {
        match WorkItem::decode(&encoded) {
            Ok(item) => {
                if copy_work_item(&item, &mut src_cache, out, chunk_size, &mut buf, counters)
                    .is_err()
                {
                    failed = true;
                }
            }
            Err(e) => {
                // A corrupt queue cannot be recovered.
                eprintln!("[partar] {}", e);
                failed = true;
                break;
            }
        }
        tracker.maybe_emit();
    }
    failed
}

/// Copy one chunk of a source file into the archive, plus the zero padding
/// if this is the file's last chunk.
fn copy_work_item(
    item: &WorkItem,
    src_cache: &mut FdCache,
    out: &File,
    chunk_size: u64,
    buf: &mut [u8],
    counters: &WorkerCounters,
) -> Result<(), ArchiveError> {
    let src = src_cache.open(&item.path, false)?;

    let start = item.chunk_index * chunk_size;
    // The layout was fixed at plan time: never read past the planned size,
    // even if the source has grown since.
    let want = chunk_size.min(item.file_size.saturating_sub(start));
    let copied = copy_range(src, out, start, item.data_offset + start, want, buf)
        .map_err(|e| io_err(e, &item.path))?;
    counters.add_bytes(copied);
    if copied < want {
        eprintln!(
            "[partar] Failed to read all bytes of '{}' (source shorter than planned)",
            item.path.display()
        );
        return Err(ArchiveError::Failed("short read".to_string()));
    }

    let num_chunks = item.file_size / chunk_size;
    let rem = item.file_size - num_chunks * chunk_size;
    let last_chunk = if rem > 0 { num_chunks } else { num_chunks.max(1) - 1 };
    if item.chunk_index == last_chunk {
        let padding = 512 - (item.file_size % 512);
        if padding != 512 {
            let zeros = [0u8; 512];
            out.write_all_at(&zeros[..padding as usize], item.data_offset + item.file_size)
                .map_err(|e| io_err(e, &item.path))?;
        }
        counters.add_item();
    }
    Ok(())
}

/// Static-chunk data phase: a deterministic round-robin walk over the
/// global sequence of data chunks; each chunk has exactly one owner.
#[allow(clippy::too_many_arguments)]
fn data_phase_chunk(
    flist: &FileList,
    layout: &Layout,
    out: &File,
    opts: &ArchiveOpts,
    rank: usize,
    coll: &Collective,
    counters: &WorkerCounters,
    tracker: &ProgressTracker,
) -> bool {
    let ranks = coll.ranks();
    let chunk_size = opts.chunk_size;

    // Every worker needs the data offset of every file, not just its own.
    let local: Vec<u64> = layout.entries.iter().map(|r| r.data_offset()).collect();
    let data_offsets = coll.allgatherv(rank, &local);

    let mut src_cache = FdCache::new();
    let mut buf = vec![0u8; opts.buf_size.max(1)];
    let mut failed = false;
    let mut global_chunk = 0u64;

    for idx in 0..flist.len() {
        let entry = flist.get(idx);
        if entry.kind != EntryKind::File || entry.size == 0 {
            continue;
        }
        let num_chunks = entry.size.div_ceil(chunk_size);
        for chunk_index in 0..num_chunks {
            let owned = global_chunk % ranks as u64 == rank as u64;
            global_chunk += 1;
            if !owned {
                continue;
            }
            let start = chunk_index * chunk_size;
            let want = chunk_size.min(entry.size - start);
            let copied = src_cache
                .open(&entry.path, false)
                .and_then(|src| {
                    copy_range(src, out, start, data_offsets[idx] + start, want, &mut buf)
                        .map_err(|e| io_err(e, &entry.path))
                });
            match copied {
                Ok(n) => {
                    counters.add_bytes(n);
                    if n < want {
                        eprintln!(
                            "[partar] Failed to read all bytes of '{}' (source shorter than planned)",
                            entry.path.display()
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

