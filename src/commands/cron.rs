//! Scheduled resync, invoked by the daily timer.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use super::{now_epoch, Runtime};
use crate::enforcer::{check_dependencies, check_root};
use crate::error::SyncError;
use crate::fetcher::HttpSource;
use crate::sync::Syncer;

/// Run the cron entry point
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;
    let rt = Runtime::load(config_path)?;

    let store = rt.store();
    let record = store.load()?;
    if record.protected_ports.is_empty() {
        info!("No protected ports, nothing to resync");
        return Ok(());
    }
    check_dependencies(&rt.executor, &record.families())?;

    let source = HttpSource::from_config(&rt.config)?;
    let syncer = Syncer::new(&source, rt.installed_tables(), rt.layout(), rt.cache())
        .with_fallback_prefixes(rt.config.fallback_prefixes.clone());

    let outcome = syncer.resync_due(record, now_epoch()).await;
    if !outcome.due {
        return Ok(());
    }

    let mut failed_ports = Vec::new();
    for (entry, result) in &outcome.ports {
        match result {
            Ok(port_outcome) => {
                println!(
                    "[{}] port {}: {} degraded, {} failed",
                    if port_outcome.is_converged() { "OK" } else { "WARN" },
                    entry.port,
                    port_outcome.degraded(),
                    port_outcome.failed()
                );
                if !port_outcome.is_converged() {
                    failed_ports.push(entry.port);
                }
            }
            Err(e) => {
                println!("[WARN] port {}: {:#}", entry.port, e);
                failed_ports.push(entry.port);
            }
        }
    }

    store.save(&outcome.record)?;
    rt.persist();

    if !failed_ports.is_empty() {
        let ports: Vec<String> = failed_ports.iter().map(u16::to_string).collect();
        return Err(SyncError::Backend(format!(
            "resync incomplete for port(s) {}; will retry on the next run",
            ports.join(", ")
        ))
        .into());
    }
    Ok(())
}
