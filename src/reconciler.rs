//! Converges one port's whitelist in one family's filter table.
//!
//! Layout per protected port `P`:
//!
//! ```text
//! INPUT:           -j EDGEWALL-P                  (position 1, exactly once)
//!                  ...
//!                  -p tcp --dport P -j DROP       (sentinel, after the jump)
//! EDGEWALL-P:      -s <prefix> -p tcp --dport P -j ACCEPT   (one per prefix)
//! ```
//!
//! Whitelisted packets are accepted inside the dedicated chain before control
//! returns to the parent and reaches the sentinel.

use anyhow::{Context, Result};
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::enforcer::{MatchSpec, Rule, RuleTable, Verdict};
use crate::error::SyncError;
use crate::prefix::{Family, NetworkPrefix};
use crate::translator::{match_attempts, SourceMatch};

/// Names and protocol shared by every port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLayout {
    pub chain_name: String,
    pub parent: String,
    pub protocol: String,
}

impl ChainLayout {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chain_name: config.chain_name.clone(),
            parent: config.parent_chain.clone(),
            protocol: config.protocol.clone(),
        }
    }

    /// Dedicated chain for `port`, e.g. `EDGEWALL-80`.
    pub fn chain_for(&self, port: u16) -> String {
        format!("{}-{}", self.chain_name, port)
    }

    fn port_spec(&self, port: u16) -> MatchSpec {
        MatchSpec::port(&self.protocol, port)
    }
}

impl Default for ChainLayout {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Progress of one (port, family) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtectionState {
    Unprotected,
    ChainReady,
    RulesApplied,
    DropInstalled,
}

impl fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtectionState::Unprotected => "unprotected",
            ProtectionState::ChainReady => "chain ready",
            ProtectionState::RulesApplied => "rules applied",
            ProtectionState::DropInstalled => "drop installed",
        })
    }
}

/// A prefix installed through a fallback match form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedMatch {
    pub prefix: NetworkPrefix,
    pub installed: SourceMatch,
    /// The installed matcher covers fewer addresses than the prefix.
    pub lossy: bool,
}

#[derive(Debug)]
pub struct ReconcileReport {
    pub family: Family,
    pub port: u16,
    pub state: ProtectionState,
    /// ACCEPT entries present for the target set after the run.
    pub applied: usize,
    pub degraded: Vec<DegradedMatch>,
    /// Prefixes every match form failed for.
    pub failed: Vec<SyncError>,
    /// The dedicated chain already matched the target and was left alone.
    pub unchanged: bool,
}

impl ReconcileReport {
    fn new(family: Family, port: u16) -> Self {
        Self {
            family,
            port,
            state: ProtectionState::Unprotected,
            applied: 0,
            degraded: Vec::new(),
            failed: Vec::new(),
            unchanged: false,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.state == ProtectionState::DropInstalled
    }
}

/// Live protection of one port in one family, for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortStatus {
    pub accept_rules: usize,
    pub referenced: bool,
    pub drop_installed: bool,
}

/// Bring `port` to "accept `prefixes`, drop the rest" in `table`.
///
/// Insertion failures are counted, not propagated; an `Err` means the chain
/// itself could not be prepared. With nothing accepted no sentinel is
/// installed, and a stale one is removed.
pub fn converge(
    table: &dyn RuleTable,
    layout: &ChainLayout,
    port: u16,
    prefixes: &[NetworkPrefix],
) -> Result<ReconcileReport> {
    let family = table.family();
    let chain = layout.chain_for(port);
    let mut report = ReconcileReport::new(family, port);

    let targets: Vec<NetworkPrefix> = prefixes
        .iter()
        .filter(|p| p.family() == family)
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    if targets.is_empty() {
        warn!("No {} prefixes for port {}, leaving {} untouched", family, port, chain);
        return Ok(report);
    }

    // UNPROTECTED -> CHAIN_READY
    if table.chain_exists(&chain)? {
        let current = table
            .list_rules(&chain)
            .with_context(|| format!("Failed to read {}", chain))?;
        if holds_exactly(&current, &layout.port_spec(port), &targets) {
            debug!("{} {} already holds the target set", family, chain);
            report.unchanged = true;
        } else {
            debug!("{} flushing {} ({} stale rules)", family, chain, current.len());
            table.flush_chain(&chain)?;
        }
    } else {
        debug!("{} creating {}", family, chain);
        table.create_chain(&chain)?;
    }

    if !table.chain_referenced(&layout.parent, &chain)? {
        debug!("{} referencing {} from {}", family, chain, layout.parent);
        table.insert_chain_reference(&layout.parent, &chain)?;
    }
    report.state = ProtectionState::ChainReady;

    // CHAIN_READY -> RULES_APPLIED
    if report.unchanged {
        report.applied = targets.len();
    } else {
        for prefix in &targets {
            apply_prefix(table, layout, &chain, port, prefix, &mut report);
        }
    }

    if report.applied == 0 {
        warn!(
            "No {} rule could be installed for port {}; not installing DROP",
            family, port
        );
        remove_sentinels(table, layout, port)?;
        return Ok(report);
    }
    report.state = ProtectionState::RulesApplied;

    // RULES_APPLIED -> DROP_INSTALLED
    ensure_sentinel(table, layout, &chain, port)?;
    report.state = ProtectionState::DropInstalled;

    info!(
        "{} port {}: {} prefixes accepted{}",
        family,
        port,
        report.applied,
        if report.unchanged { " (unchanged)" } else { "" }
    );
    Ok(report)
}

/// Remove the DROP sentinel for `port`. The dedicated chain and its ACCEPT
/// entries stay; without the sentinel they have no effect.
///
/// Returns whether a sentinel was removed.
pub fn remove_protection(table: &dyn RuleTable, layout: &ChainLayout, port: u16) -> Result<bool> {
    let removed = remove_sentinels(table, layout, port)?;
    if removed {
        info!("{} port {}: DROP removed", table.family(), port);
    } else {
        debug!("{} port {}: no DROP to remove", table.family(), port);
    }
    Ok(removed)
}

/// Read-only view of `port`'s rules.
pub fn inspect(table: &dyn RuleTable, layout: &ChainLayout, port: u16) -> Result<PortStatus> {
    let chain = layout.chain_for(port);
    let mut status = PortStatus::default();

    if table.chain_exists(&chain)? {
        status.accept_rules = table
            .list_rules(&chain)?
            .iter()
            .filter(|r| r.verdict == Verdict::Accept)
            .count();
        status.referenced = table.chain_referenced(&layout.parent, &chain)?;
    }

    status.drop_installed = table.rule_exists(&layout.parent, &layout.port_spec(port), &Verdict::Drop)?;
    Ok(status)
}

fn apply_prefix(
    table: &dyn RuleTable,
    layout: &ChainLayout,
    chain: &str,
    port: u16,
    prefix: &NetworkPrefix,
    report: &mut ReconcileReport,
) {
    let mut last_error = None;

    for (i, attempt) in match_attempts(prefix).into_iter().enumerate() {
        let spec = layout.port_spec(port).with_source(attempt.source);
        match table.append_rule(chain, &spec, &Verdict::Accept) {
            Ok(()) => {
                report.applied += 1;
                if i > 0 {
                    warn!(
                        "Degraded match for {}: installed as {} ({}{})",
                        prefix,
                        attempt.source,
                        attempt.source.form().as_str(),
                        if attempt.lossy { ", narrower than the prefix" } else { "" }
                    );
                    report.degraded.push(DegradedMatch {
                        prefix: *prefix,
                        installed: attempt.source,
                        lossy: attempt.lossy,
                    });
                }
                return;
            }
            Err(e) => {
                debug!("{} rejected as {}: {:#}", prefix, attempt.source.form().as_str(), e);
                last_error = Some(e);
            }
        }
    }

    let reason = last_error.map(|e| format!("{:#}", e)).unwrap_or_default();
    warn!("Could not install {} for port {}: {}", prefix, port, reason);
    report.failed.push(SyncError::BackendInsertion {
        prefix: prefix.to_string(),
        port,
        reason,
    });
}

/// Whether `rules` are exactly one ACCEPT per target, matching `port_spec`.
fn holds_exactly(rules: &[Rule], port_spec: &MatchSpec, targets: &[NetworkPrefix]) -> bool {
    if rules.len() != targets.len() {
        return false;
    }

    let mut installed = BTreeSet::new();
    for rule in rules {
        let same_port = rule.spec.protocol == port_spec.protocol
            && rule.spec.dport == port_spec.dport
            && rule.spec.extra.is_empty();
        let network = rule.spec.source.as_ref().and_then(SourceMatch::network);
        match network {
            Some(net) if same_port && rule.verdict == Verdict::Accept => {
                installed.insert(net);
            }
            _ => return false,
        }
    }

    let wanted: BTreeSet<IpNet> = targets.iter().map(NetworkPrefix::as_ipnet).collect();
    installed == wanted
}

fn is_sentinel(rule: &Rule, sentinel: &MatchSpec) -> bool {
    rule.verdict == Verdict::Drop && &rule.spec == sentinel
}

/// Append the sentinel unless one already follows the chain reference.
fn ensure_sentinel(table: &dyn RuleTable, layout: &ChainLayout, chain: &str, port: u16) -> Result<()> {
    let sentinel = layout.port_spec(port);
    let jump = Verdict::Jump(chain.to_string());
    let rules = table.list_rules(&layout.parent)?;

    let reference = rules
        .iter()
        .position(|r| r.spec.is_empty() && r.verdict == jump);
    let positions: Vec<usize> = rules
        .iter()
        .enumerate()
        .filter(|(_, r)| is_sentinel(r, &sentinel))
        .map(|(i, _)| i)
        .collect();

    let well_placed = match (reference, positions.as_slice()) {
        (Some(r), [s]) => *s > r,
        _ => false,
    };
    if well_placed {
        debug!("{} DROP for port {} already in place", table.family(), port);
        return Ok(());
    }

    if !positions.is_empty() {
        warn!(
            "{} DROP for port {} misplaced in {}, re-appending",
            table.family(),
            port,
            layout.parent
        );
        for _ in &positions {
            table.delete_rule(&layout.parent, &sentinel, &Verdict::Drop)?;
        }
    }

    debug!("{} appending DROP for port {}", table.family(), port);
    table
        .append_rule(&layout.parent, &sentinel, &Verdict::Drop)
        .with_context(|| format!("Failed to install DROP for port {}", port))
}

fn remove_sentinels(table: &dyn RuleTable, layout: &ChainLayout, port: u16) -> Result<bool> {
    let sentinel = layout.port_spec(port);
    let count = table
        .list_rules(&layout.parent)?
        .iter()
        .filter(|r| is_sentinel(r, &sentinel))
        .count();

    for _ in 0..count {
        table
            .delete_rule(&layout.parent, &sentinel, &Verdict::Drop)
            .with_context(|| format!("Failed to remove DROP for port {}", port))?;
    }
    Ok(count > 0)
}
