//! List command: protected ports, schedule and live rules.

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use std::path::Path;
use tracing::debug;

use super::Runtime;
use crate::enforcer::check_root;
use crate::reconciler::inspect;
use crate::scheduler::{next_due, RecurringTrigger};

fn format_epoch(epoch: i64) -> String {
    if epoch <= 0 {
        return "never".to_string();
    }
    DateTime::<Utc>::from_timestamp(epoch, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

/// Run the list command
pub async fn run(config_path: &Path) -> Result<()> {
    let rt = Runtime::load(config_path)?;
    let record = rt.store().load()?;
    let live = check_root().is_ok();

    println!();
    if record.protected_ports.is_empty() {
        println!(" No protected ports.");
    } else {
        println!(" PORT   FAMILY  AREA            LIVE");
        println!(" ────── ─────── ─────────────── ──────────────────────────────");
        let layout = rt.layout();
        for entry in &record.protected_ports {
            let mut status = Vec::new();
            if live {
                for table in rt.tables(entry.family) {
                    match inspect(table, &layout, entry.port) {
                        Ok(s) => status.push(format!(
                            "{} {} accept{}",
                            table.family(),
                            s.accept_rules,
                            if s.drop_installed { " +drop" } else { ", NO DROP" }
                        )),
                        Err(e) => debug!("Cannot read {} rules: {:#}", table.family(), e),
                    }
                }
            }
            let status = if live { status.join("; ") } else { "(run as root)".to_string() };
            println!(
                " {:<6} {:<7} {:<15} {}",
                entry.port, entry.family, entry.area, status
            );
        }
    }

    println!();
    println!(" Update interval: {} day(s)", record.update_interval_days);
    println!(" Last sync:       {}", format_epoch(record.last_sync_epoch));
    println!(" Next due:        {}", format_epoch(next_due(&record)));
    let timer = if rt.timer().is_registered() { "installed" } else { "not installed" };
    println!(
        " Auto update:     {} (daily check at {}, timer {})",
        if record.auto_update { "on" } else { "off" },
        rt.config.sync_time,
        timer
    );
    println!(" State file:      {}", rt.store().path().display());
    println!();
    Ok(())
}
