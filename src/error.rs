use std::path::PathBuf;

/// The primary error type for all operations in the `partar` crate.
#[derive(Debug)]
pub enum ArchiveError {
    /// A positional read, write, seek, or sync failed. `path` names the
    /// file the descriptor was opened on — a source file, the archive
    /// itself, or the sidecar index.
    Io { source: std::io::Error, path: PathBuf },

    /// Failed to encode a pax header for an entry, e.g. because the encoded
    /// header would exceed the header buffer cap.
    Encode { path: PathBuf, reason: String },

    /// A malformed tar header or truncated archive was encountered while
    /// scanning or extracting.
    Format(String),

    /// A work item pulled from the copy queue could not be parsed. This
    /// indicates a corrupt queue and is not recoverable.
    WorkItem(String),

    /// One or more workers reported a failure at the close reduction.
    Failed(String),

    /// An error from a helper crate that has no dedicated variant.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Io { source, path } if path.as_os_str().is_empty() => {
                write!(f, "I/O failed: {}", source)
            }
            ArchiveError::Io { source, path } => {
                write!(f, "I/O failed on '{}': {}", path.display(), source)
            }
            ArchiveError::Encode { path, reason } => {
                write!(f, "Failed to encode header for '{}': {}", path.display(), reason)
            }
            ArchiveError::Format(msg) => write!(f, "Archive format error: {}", msg),
            ArchiveError::WorkItem(msg) => write!(f, "Corrupt work item: {}", msg),
            ArchiveError::Failed(msg) => write!(f, "Operation failed: {}", msg),
            ArchiveError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArchiveError::Io { source, .. } => Some(source),
            ArchiveError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// For call sites where no file path is in play (seeks on an already-open
/// descriptor); everything touching a named file goes through [`io_err`].
impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io { source: err, path: PathBuf::new() }
    }
}

/// Attach a path to a bare `io::Error`.
pub(crate) fn io_err(source: std::io::Error, path: &std::path::Path) -> ArchiveError {
    ArchiveError::Io { source, path: path.to_path_buf() }
}
