//! Dry run: fetch and normalize, print what an add would install.

use anyhow::Result;
use std::path::Path;

use super::Runtime;
use crate::fetcher::{HttpSource, SourceQuery};
use crate::prefix::{Area, FamilyFilter};
use crate::sync::Syncer;

/// Run the dry-run command. Never touches rules, state or cache.
pub async fn run(port: Option<u16>, family: FamilyFilter, area: Area, config_path: &Path) -> Result<()> {
    let rt = Runtime::load(config_path)?;
    let source = HttpSource::from_config(&rt.config)?;
    // no tables: resolve only
    let syncer = Syncer::new(&source, Vec::new(), rt.layout(), rt.cache())
        .with_fallback_prefixes(rt.config.fallback_prefixes.clone());

    let resolved = syncer.resolve(&SourceQuery::new(family, area)).await?;
    let normalized = &resolved.normalized;

    println!();
    println!("Source:    {}", match &resolved.fallback {
        Some(origin) => origin.to_string(),
        None => rt.config.endpoint.clone(),
    });
    println!("Parsed as: {}", normalized.method.as_str());
    for f in family.families() {
        println!("{}:        {} prefixes", f, normalized.count(f));
    }
    println!("Dropped:   {} malformed, {} other family", normalized.dropped, normalized.filtered);

    if let Some(port) = port {
        let chain = syncer.layout().chain_for(port);
        println!();
        for f in family.families() {
            let count = normalized.count(f);
            if count == 0 {
                println!("[WARN] {}: nothing to accept, port {} would stay open", f, port);
            } else {
                println!(
                    "[OK] {}: {} ACCEPT rules in {}, then DROP {} port {}",
                    f, count, chain, rt.config.protocol, port
                );
            }
        }
    }

    println!();
    println!("[OK] Dry run: no changes made");
    Ok(())
}
