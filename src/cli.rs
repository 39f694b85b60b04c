use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::options::{ArchiveOpts, CreateBackend, ExtractBackend};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create a new archive from specified files and directories.
    #[command(alias = "c")]
    Create {
        /// One or more input files or directories to add to the archive.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// The path for the output archive file (e.g. tree.tar).
        #[arg(short, long)]
        output: PathBuf,

        /// Number of parallel workers. [0 = one per CPU core]
        #[arg(long, default_value_t = 0)]
        workers: usize,

        /// Size in bytes of each parallel data unit.
        #[arg(long, default_value_t = 1024 * 1024)]
        chunk_size: u64,

        /// Distribute data copies through a shared work queue instead of a
        /// static chunk assignment.
        #[arg(long)]
        steal: bool,

        /// Record extended attributes in entry headers.
        #[arg(long)]
        preserve: bool,

        /// Print periodic progress lines.
        #[arg(long)]
        progress: bool,
    },

    /// Extract files from an archive.
    #[command(alias = "x")]
    Extract {
        /// The archive file to extract.
        #[arg(required = true)]
        archive: PathBuf,

        /// The directory to extract into. Defaults to the current directory.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of parallel workers. [0 = one per CPU core]
        #[arg(long, default_value_t = 0)]
        workers: usize,

        /// Drive the tar reader per entry instead of copying data regions
        /// directly. Useful when entries should be restored one at a time.
        #[arg(long)]
        reader: bool,

        /// Restore extended attributes recorded in entry headers.
        #[arg(long)]
        preserve: bool,

        /// Print periodic progress lines.
        #[arg(long)]
        progress: bool,
    },

    /// List the contents of an archive without extracting it.
    #[command(alias = "l")]
    List {
        /// The archive file to list.
        #[arg(required = true)]
        archive: PathBuf,
    },
}

impl Commands {
    /// Map parsed flags onto an options structure.
    pub fn to_opts(&self) -> ArchiveOpts {
        let mut opts = ArchiveOpts::default();
        match self {
            Commands::Create { output, workers, chunk_size, steal, preserve, progress, .. } => {
                opts.dest_path = Some(output.clone());
                opts.workers = *workers;
                opts.chunk_size = (*chunk_size).max(512);
                if *steal {
                    opts.create_backend = CreateBackend::WorkStealing;
                }
                opts.preserve = *preserve;
                if *progress {
                    opts.progress_interval = Some(Duration::from_secs(1));
                }
            }
            Commands::Extract { output, workers, reader, preserve, progress, .. } => {
                opts.dest_path = output.clone();
                opts.workers = *workers;
                if *reader {
                    opts.extract_backend = ExtractBackend::TarReader;
                }
                opts.preserve = *preserve;
                if *progress {
                    opts.progress_interval = Some(Duration::from_secs(1));
                }
            }
            Commands::List { .. } => {}
        }
        opts
    }
}
