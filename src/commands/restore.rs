//! Restore command: re-apply the rules saved under the state directory.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use super::Runtime;
use crate::enforcer::{check_dependencies, check_root};
use crate::persistence::restore_local_dump;
use crate::prefix::FamilyFilter;

/// Run the restore command
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;
    let rt = Runtime::load(config_path)?;
    check_dependencies(&rt.executor, &FamilyFilter::Both.families())?;

    let paths = rt.persist_paths();
    info!("Restoring rules from {}...", paths.state_dir.display());
    let restored = restore_local_dump(&rt.tables(FamilyFilter::Both), &paths)?;

    for family in restored {
        println!("[OK] {} rules restored from {}", family, paths.local_dump(family).display());
    }
    Ok(())
}
