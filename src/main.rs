use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use fatwipe::SecureDelete;

#[derive(Parser)]
#[command(name = "fatwipe", version)]
#[command(about = "Securely remove files from a mounted FAT32 volume")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remove a file, or a directory and everything below it
    #[command(alias = "r")]
    Remove {
        /// Absolute path of the file or directory to remove
        path: PathBuf,
    },
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Remove { path } => {
            if !path.is_absolute() {
                bail!("{} is not an absolute path", path.display());
            }
            let mut session = SecureDelete::open(&path)?;
            session
                .remove(&path)
                .with_context(|| format!("removing {}", path.display()))
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();

    // Raw volume access needs elevated privileges on every supported host.
    #[cfg(unix)]
    {
        if !nix::unistd::geteuid().is_root() {
            log::warn!("not running as root; opening the raw volume will likely fail");
        }
    }

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
