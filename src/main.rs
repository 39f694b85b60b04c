//! Main entry point for the partar CLI.

use std::path::PathBuf;

use clap::Parser;

use partar::cli::{Args, Commands};
use partar::{create, extract, flist};

fn main() -> std::process::ExitCode {
    if let Err(e) = run_app() {
        eprintln!("Error: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let opts = args.command.to_opts();

    match &args.command {
        Commands::Create { inputs, output, .. } => {
            flist::check_archive_paths(inputs, output)?;
            let anchor = common_anchor(inputs);
            let list = flist::FileList::walk(inputs, &anchor)?;
            create::create_archive(&list, output, &opts)?;
        }
        Commands::Extract { archive, output, .. } => {
            let dest = match output {
                Some(path) => path.clone(),
                None => std::env::current_dir()?,
            };
            extract::extract_archive(archive, &dest, &opts)?;
        }
        Commands::List { archive } => {
            extract::list_archive(archive)?;
        }
    }
    Ok(())
}

/// Longest common ancestor directory of the inputs; member names in the
/// archive are relative to this.
fn common_anchor(inputs: &[PathBuf]) -> PathBuf {
    let mut prefix: Option<PathBuf> = None;
    for input in inputs {
        let dir = if input.is_dir() {
            input.parent().unwrap_or(input).to_path_buf()
        } else {
            input.parent().map(|p| p.to_path_buf()).unwrap_or_default()
        };
        prefix = Some(match prefix {
            None => dir,
            Some(current) => {
                let mut shared = PathBuf::new();
                for (a, b) in current.components().zip(dir.components()) {
                    if a == b {
                        shared.push(a.as_os_str());
                    } else {
                        break;
                    }
                }
                shared
            }
        });
    }
    prefix.unwrap_or_default()
}
