//! objstore CLI - deduplicating object store command line interface

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use objstore::ops::{fsck, stats};
use objstore::{Handle, ObjectStore};

#[derive(Parser)]
#[command(name = "objstore")]
#[command(about = "deduplicating object store with reusable integer handles")]
#[command(version)]
struct Cli {
    /// store path
    #[arg(short, long, default_value = ".", env = "OBJSTORE_PATH")]
    store: PathBuf,

    /// enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// store a file (or stdin with "-") and print its handle
    Put {
        /// file to store
        file: PathBuf,
    },

    /// write the content of a handle to stdout or a file
    Get {
        handle: Handle,

        /// output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// delete a handle
    Delete { handle: Handle },

    /// show store statistics
    Stats,

    /// verify store integrity
    Fsck,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> objstore::Result<ExitCode> {
    let store = ObjectStore::open(&cli.store)?;
    let code = execute(&store, cli.command)?;
    store.close()?;
    Ok(code)
}

fn execute(store: &ObjectStore, command: Commands) -> objstore::Result<ExitCode> {
    match command {
        Commands::Put { file } => {
            let handle = if file.as_os_str() == "-" {
                store.put_reader(&mut io::stdin().lock())?
            } else {
                let mut input = File::open(&file).map_err(|source| objstore::Error::Io {
                    path: file.clone(),
                    source,
                })?;
                store.put_reader(&mut input)?
            };
            println!("{}", handle);
        }

        Commands::Get { handle, output } => {
            if !write_content(store, handle, output.as_deref())? {
                eprintln!("handle {} not found", handle);
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Delete { handle } => {
            if !store.delete(handle)? {
                eprintln!("handle {} not found", handle);
            }
        }

        Commands::Stats => {
            println!("{}", stats(store)?);
        }

        Commands::Fsck => {
            let report = fsck(store)?;
            for problem in &report.problems {
                println!("{}", problem);
            }
            println!(
                "checked {} links, {} content files: {}",
                report.links_checked,
                report.content_checked,
                if report.is_ok() { "ok" } else { "problems found" }
            );
            if !report.is_ok() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// copy a handle's content to `output` (or stdout); false if not live
///
/// the handle is resolved before `output` is touched, so a missing handle
/// leaves no file behind.
fn write_content(
    store: &ObjectStore,
    handle: Handle,
    output: Option<&Path>,
) -> objstore::Result<bool> {
    let Some(reader) = store.reader(handle)? else {
        return Ok(false);
    };

    match output {
        Some(path) => {
            let mut out = File::create(path).map_err(|source| objstore::Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
            reader.copy_to(&mut out)?;
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            reader.copy_to(&mut out)?;
            out.flush().map_err(|source| objstore::Error::Io {
                path: PathBuf::from("<stdout>"),
                source,
            })?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore::{Config, PersistMode};
    use tempfile::tempdir;

    fn test_store(dir: &tempfile::TempDir) -> ObjectStore {
        let config = Config {
            fsync: false,
            persist: PersistMode::Close,
        };
        ObjectStore::open_with_config(&dir.path().join("store"), config).unwrap()
    }

    #[test]
    fn test_get_missing_handle_creates_no_file() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        let out = dir.path().join("out.bin");

        let found = write_content(&store, Handle::from_raw(1), Some(&out)).unwrap();
        assert!(!found);
        assert!(!out.exists());
    }

    #[test]
    fn test_get_writes_output_file() {
        let dir = tempdir().unwrap();
        let store = test_store(&dir);
        let handle = store.put(b"cli payload").unwrap();
        let out = dir.path().join("out.bin");

        assert!(write_content(&store, handle, Some(&out)).unwrap());
        assert_eq!(std::fs::read(&out).unwrap(), b"cli payload");
    }
}
