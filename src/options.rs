//! Options controlling archive creation and extraction.

use std::path::PathBuf;
use std::time::Duration;

/// Strategy used to parallelize the data phase of archive creation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CreateBackend {
    /// Cut the union of all file data regions into fixed-size chunks and
    /// assign each chunk to exactly one worker round-robin. Lowest
    /// coordination overhead.
    StaticChunk,
    /// Enqueue one work item per chunk into a shared queue that all workers
    /// drain. Handles skewed workloads (one very large file) better.
    WorkStealing,
}

/// Strategy used to copy file contents out of the archive when entry
/// offsets are known.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtractBackend {
    /// Positional reads from the archive into pre-created files, chunked
    /// round-robin across workers. Large files are split across workers.
    DirectPositional,
    /// Drive the tar reader at each entry offset and stream bytes to disk.
    /// One worker per entry; does not subdivide large files.
    TarReader,
}

/// Options for creating or extracting an archive.
#[derive(Clone, Debug)]
pub struct ArchiveOpts {
    /// Include extended attributes in headers on create, restore them on
    /// extract.
    pub preserve: bool,
    /// Granularity of parallel data units in bytes. Also the preallocation
    /// stripe width hint.
    pub chunk_size: u64,
    /// Size of each worker's I/O buffer in bytes.
    pub buf_size: usize,
    /// Which create backend to use. Overridden by `MFU_FLIST_ARCHIVE_CREATE`.
    pub create_backend: CreateBackend,
    /// Which extract backend to use when entry offsets are available.
    pub extract_backend: ExtractBackend,
    /// Destination archive path (create) or extraction anchor (extract).
    pub dest_path: Option<PathBuf>,
    /// Number of workers; 0 means one per CPU core.
    pub workers: usize,
    /// Interval between progress lines; `None` disables progress output.
    pub progress_interval: Option<Duration>,
}

impl Default for ArchiveOpts {
    fn default() -> Self {
        Self {
            preserve: false,
            chunk_size: 1024 * 1024,
            buf_size: 1024 * 1024,
            create_backend: CreateBackend::StaticChunk,
            extract_backend: ExtractBackend::DirectPositional,
            dest_path: None,
            workers: 0,
            progress_interval: None,
        }
    }
}

impl ArchiveOpts {
    /// Resolve the create backend, honoring the `MFU_FLIST_ARCHIVE_CREATE`
    /// environment variable: `LIBCIRCLE` selects work stealing, `CHUNK`
    /// selects static chunks. Unknown values are reported and ignored.
    pub fn resolved_create_backend(&self) -> CreateBackend {
        match std::env::var("MFU_FLIST_ARCHIVE_CREATE") {
            Ok(v) if v == "LIBCIRCLE" => CreateBackend::WorkStealing,
            Ok(v) if v == "CHUNK" => CreateBackend::StaticChunk,
            Ok(v) => {
                eprintln!("[partar] MFU_FLIST_ARCHIVE_CREATE: unknown value: {}", v);
                self.create_backend
            }
            Err(_) => self.create_backend,
        }
    }

    /// Number of worker threads to spawn.
    pub fn team_size(&self) -> usize {
        if self.workers == 0 { num_cpus::get() } else { self.workers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = ArchiveOpts::default();
        assert_eq!(opts.chunk_size, 1024 * 1024);
        assert_eq!(opts.create_backend, CreateBackend::StaticChunk);
        assert_eq!(opts.extract_backend, ExtractBackend::DirectPositional);
        assert!(!opts.preserve);
    }
}
