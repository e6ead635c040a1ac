//! edgewall - CDN edge-node whitelisting for Linux hosts
//!
//! Keeps selected ports reachable only from the published edge-node list.

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use edgewall::cli::{Action, Cli};
use edgewall::commands;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // usage errors exit 1, help exits 0
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let log_level = if cli.debug {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let Some(action) = cli.action() else {
        let _ = Cli::command().print_help();
        eprintln!();
        eprintln!("error: one of --add, --delete, --list, --test, --update-interval, --disable-update, --cron or --restore is required");
        std::process::exit(1);
    };

    match action {
        Action::Add(port) => commands::add::run(port, cli.family, cli.area, &cli.config).await,
        Action::Delete(port) => commands::delete::run(port, &cli.config).await,
        Action::List => commands::list::run(&cli.config).await,
        Action::UpdateInterval(days) => commands::schedule::set_interval(days, &cli.config).await,
        Action::DisableUpdate => commands::schedule::disable(&cli.config).await,
        Action::Cron => commands::cron::run(&cli.config).await,
        Action::Restore => commands::restore::run(&cli.config).await,
        Action::DryRun(port) => commands::dry_run::run(port, cli.family, cli.area, &cli.config).await,
    }
}
