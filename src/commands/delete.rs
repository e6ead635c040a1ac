//! Delete command: stop protecting one port.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use super::Runtime;
use crate::enforcer::{check_dependencies, check_root};
use crate::prefix::FamilyFilter;
use crate::scheduler::RecurringTrigger;
use crate::sync::unprotect;

/// Run the delete command
pub async fn run(port: u16, config_path: &Path) -> Result<()> {
    check_root()?;
    let rt = Runtime::load(config_path)?;

    let store = rt.store();
    let record = store.load()?;
    // the recorded family may be narrower than what an earlier add installed
    let required = match record.find(port) {
        Some(entry) => entry.family.families(),
        None => Vec::new(),
    };
    check_dependencies(&rt.executor, &required)?;
    let tables = rt.installed_tables();
    if tables.is_empty() {
        check_dependencies(&rt.executor, &FamilyFilter::Both.families())?;
    }

    info!("Removing protection from port {}...", port);
    let layout = rt.layout();
    let removed = unprotect(&tables, &layout, port)?;

    let record = record.remove_protected_port(port);
    store.save(&record)?;

    if removed {
        println!("[OK] Port {} is no longer restricted to edge nodes", port);
        println!(
            "     Whitelist chain {} was left in place and has no effect",
            layout.chain_for(port)
        );
    } else {
        println!("[OK] Port {} was not protected", port);
    }
    rt.persist();

    if record.protected_ports.is_empty() {
        let timer = rt.timer();
        if timer.is_registered() {
            match timer.unregister() {
                Ok(()) => println!("[OK] No protected ports left, daily resync disabled"),
                Err(e) => warn!("Could not remove the resync timer: {:#}", e),
            }
        }
    }

    Ok(())
}
