mod backup;
mod cli;
mod config;
mod engine;
mod imap;
mod logging;
mod mailbox;
mod pop3;
mod resolver;
mod run;
mod transport;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use config::Config;
use run::RunMode;

/// Bulk-deletes or archives old mail from a POP3 or IMAP mailbox.
///
/// Without --delete or --backup only the survey is shown.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Config file, defaults to $XDG_CONFIG_HOME/mailsweep/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only show what would be affected.
    #[arg(long, conflicts_with_all = ["delete", "backup", "unhinged"])]
    preview: bool,

    /// Delete the selected messages.
    #[arg(long)]
    delete: bool,

    /// Archive the selected messages into monthly zip files in OUTPUT_DIR.
    /// Combined with --delete every batch is deleted once archived.
    #[arg(long, value_name = "OUTPUT_DIR")]
    backup: Option<PathBuf>,

    /// Delete without asking for confirmation.
    #[arg(long)]
    unhinged: bool,
}

impl Args {
    fn mode(&self) -> RunMode {
        let delete = self.delete || self.unhinged;
        match (&self.backup, delete) {
            _ if self.preview => RunMode::PreviewOnly,
            (Some(dir), true) => RunMode::BackupThenDelete(dir.clone()),
            (Some(dir), false) => RunMode::BackupOnly(dir.clone()),
            (None, true) => RunMode::DeleteOnly,
            (None, false) => RunMode::PreviewOnly,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init();

    let config = Config::load_from_file(args.config.clone())?;
    cli::sweep(&args, &config)
}
