//! mailkeep: incremental IMAP mailbox mirror with an audit ledger.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;

use mailkeep_core::{SqliteLedger, log_debug};
use mailkeep_mail::Mirror;

mod config;

#[derive(Parser, Debug)]
#[command(name = "mailkeep", version, about = "Incremental IMAP mailbox mirror")]
struct Cli {
    /// Configuration file (defaults to ./mailkeep.toml, then
    /// ~/.config/mailkeep/mailkeep.toml).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref())?;

    let password = rpassword::prompt_password("Password: ")?;

    let runtime = Arc::new(tokio::runtime::Runtime::new()?);
    let ledger = runtime.block_on(SqliteLedger::connect(&config.database))?;
    runtime.block_on(ledger.init())?;

    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let interrupt = interrupt.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received, stopping after the current message");
                interrupt.store(true, Ordering::Relaxed);
            }
        });
    }

    log_debug("mirror run starting");
    let mirror = Mirror::new(config.mirror, Arc::new(ledger), runtime, interrupt);
    mirror.run(&password)
}
