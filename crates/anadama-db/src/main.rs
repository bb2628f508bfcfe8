//! Operational CLI for the fingerprint store: inspect what the engine
//! has recorded and surgically forget keys to force reruns.

use std::io::{BufRead, Write};
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use anadama_backend::{discover_data_directory, Backend};

#[derive(Parser)]
#[command(name = "anadama-db", about = "Inspect and edit the anadama fingerprint store")]
struct Cli {
    /// Store directory; defaults to the discovery chain
    /// ($ANADAMA_BACKEND_DIR, ~/.config/anadama/db, ./.anadama/db).
    #[arg(short, long)]
    db: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every key and its stored fingerprint as JSON lines.
    Dump,
    /// Remove keys, either given as arguments or read from stdin.
    Remove {
        keys: Vec<String>,
        /// Read newline-separated keys from stdin.
        #[arg(long)]
        stdin: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("anadama-db: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let dir = cli.db.unwrap_or_else(discover_data_directory);
    let backend = Backend::open(&dir)?;

    match cli.command {
        Command::Dump => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for (key, atoms) in backend.dump()? {
                writeln!(out, "{key}\t{}", serde_json::to_string(&atoms)?)?;
            }
        }
        Command::Remove { mut keys, stdin } => {
            if stdin {
                for line in std::io::stdin().lock().lines() {
                    let line = line?;
                    let line = line.trim();
                    if !line.is_empty() {
                        keys.push(line.to_owned());
                    }
                }
            }
            backend.delete_many(&keys)?;
        }
    }
    Ok(())
}
