//! Update-interval and disable-update commands.

use anyhow::Result;
use std::path::Path;

use super::Runtime;
use crate::enforcer::check_root;
use crate::scheduler::RecurringTrigger;

/// Set the resync interval and make sure the daily check is installed
pub async fn set_interval(days: u32, config_path: &Path) -> Result<()> {
    check_root()?;
    let rt = Runtime::load(config_path)?;
    let at = rt.config.daily_time()?;

    let store = rt.store();
    let record = store.load()?.with_update_interval(days)?;
    store.save(&record)?;

    rt.timer().register(&at)?;

    println!("[OK] Resync every {} day(s), checked daily at {}", days, at);
    Ok(())
}

/// Remove the daily check; rules stay as they are
pub async fn disable(config_path: &Path) -> Result<()> {
    check_root()?;
    let rt = Runtime::load(config_path)?;

    let store = rt.store();
    let record = store.load()?.with_auto_update(false);
    store.save(&record)?;

    rt.timer().unregister()?;

    println!("[OK] Automatic resync disabled");
    println!("     Protected ports keep their current whitelist until the next --add");
    Ok(())
}
