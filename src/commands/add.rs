//! Add command: protect one port.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use super::{now_epoch, Runtime};
use crate::enforcer::{check_dependencies, check_root};
use crate::error::SyncError;
use crate::fetcher::HttpSource;
use crate::prefix::{Area, FamilyFilter};
use crate::scheduler::RecurringTrigger;
use crate::state::ProtectedPort;
use crate::sync::{PortOutcome, Syncer};

/// Run the add command
pub async fn run(port: u16, family: FamilyFilter, area: Area, config_path: &Path) -> Result<()> {
    check_root()?;
    let rt = Runtime::load(config_path)?;
    check_dependencies(&rt.executor, &family.families())?;

    // read before touching rules so a corrupt record stops us early
    let store = rt.store();
    let record = store.load()?;

    info!("Protecting port {} ({}, {})...", port, family, area);
    let source = HttpSource::from_config(&rt.config)?;
    // every installed table, so a narrowed filter can release the other family
    let syncer = Syncer::new(&source, rt.installed_tables(), rt.layout(), rt.cache())
        .with_fallback_prefixes(rt.config.fallback_prefixes.clone());

    let entry = ProtectedPort::new(port, family, area);
    let outcome = syncer.sync_port(&entry).await?;
    print_outcome(&outcome);

    if !outcome.reports.iter().any(|r| r.is_converged()) {
        return Err(SyncError::Backend(format!(
            "port {} could not be protected in any address family",
            port
        ))
        .into());
    }

    let record = record.add_protected_port(entry, now_epoch());
    store.save(&record)?;
    rt.persist();

    if record.auto_update {
        let timer = rt.timer();
        if !timer.is_registered() {
            match rt.config.daily_time().and_then(|at| timer.register(&at)) {
                Ok(()) => println!("[OK] Daily resync check enabled at {}", rt.config.sync_time),
                Err(e) => warn!("Could not install the resync timer: {:#}", e),
            }
        }
    }

    Ok(())
}

pub(crate) fn print_outcome(outcome: &PortOutcome) {
    let port = outcome.entry.port;
    for report in &outcome.reports {
        let tag = if report.is_converged() { "[OK]" } else { "[WARN]" };
        println!(
            "{} {} port {}: {} prefixes accepted, {} degraded, {} failed ({})",
            tag,
            report.family,
            port,
            report.applied,
            report.degraded.len(),
            report.failed.len(),
            report.state
        );
    }
    for family in &outcome.skipped {
        println!("[WARN] {} port {}: list has no {} prefixes, not protected", family, port, family);
    }
    for (family, e) in &outcome.errors {
        println!("[WARN] {} port {}: {:#}", family, port, e);
    }
    for family in &outcome.released {
        println!("[OK] {} port {}: no longer restricted, DROP removed", family, port);
    }
}
