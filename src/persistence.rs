//! Saving converged rules so they survive a reboot.
//!
//! Strategies are tried in order and each outcome is recorded; the first
//! success ends the walk. Failure of all of them is reported, never fatal.

use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cmd_abstraction::{args_to_strings, run, CommandExecutor};
use crate::enforcer::{restore_program, RuleTable};
use crate::error::SyncError;
use crate::prefix::Family;

const DEBIAN_RULES_DIR: &str = "/etc/iptables";
const RHEL_RULES_DIR: &str = "/etc/sysconfig";
const RESTORE_SCRIPT: &str = "restore.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStrategy {
    /// `netfilter-persistent save`
    NetfilterPersistent,
    /// Distribution rules file plus a service restart.
    DistroRulesFile,
    /// Dump and restore script under the state directory.
    LocalDump,
}

impl PersistStrategy {
    pub const ORDER: [PersistStrategy; 3] = [
        PersistStrategy::NetfilterPersistent,
        PersistStrategy::DistroRulesFile,
        PersistStrategy::LocalDump,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PersistStrategy::NetfilterPersistent => "netfilter-persistent",
            PersistStrategy::DistroRulesFile => "distribution rules file",
            PersistStrategy::LocalDump => "local dump",
        }
    }
}

impl fmt::Display for PersistStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct PersistAttempt {
    pub strategy: PersistStrategy,
    /// What was written on success, why it failed otherwise.
    pub outcome: std::result::Result<String, String>,
}

#[derive(Debug, Default)]
pub struct PersistReport {
    pub attempts: Vec<PersistAttempt>,
}

impl PersistReport {
    /// The attempt that succeeded, if any.
    pub fn success(&self) -> Option<&PersistAttempt> {
        self.attempts.iter().find(|a| a.outcome.is_ok())
    }

    pub fn into_result(self) -> std::result::Result<PersistAttempt, SyncError> {
        let summary = self
            .attempts
            .iter()
            .filter_map(|a| a.outcome.as_ref().err().map(|e| format!("{}: {}", a.strategy, e)))
            .collect::<Vec<_>>()
            .join("; ");
        self.attempts
            .into_iter()
            .find(|a| a.outcome.is_ok())
            .ok_or(SyncError::Persistence(summary))
    }
}

/// Locations the strategies write to.
#[derive(Debug, Clone)]
pub struct PersistPaths {
    pub debian_dir: PathBuf,
    pub rhel_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl PersistPaths {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            debian_dir: PathBuf::from(DEBIAN_RULES_DIR),
            rhel_dir: PathBuf::from(RHEL_RULES_DIR),
            state_dir: state_dir.to_path_buf(),
        }
    }

    pub fn local_dump(&self, family: Family) -> PathBuf {
        self.state_dir.join(format!("rules.{}", family.as_str()))
    }

    pub fn restore_script(&self) -> PathBuf {
        self.state_dir.join(RESTORE_SCRIPT)
    }
}

pub struct Persister<'a> {
    executor: &'a dyn CommandExecutor,
    tables: Vec<&'a dyn RuleTable>,
    paths: PersistPaths,
}

impl<'a> Persister<'a> {
    pub fn new(executor: &'a dyn CommandExecutor, tables: Vec<&'a dyn RuleTable>, paths: PersistPaths) -> Self {
        Self {
            executor,
            tables,
            paths,
        }
    }

    /// Walk the strategies until one succeeds.
    pub fn persist(&self) -> PersistReport {
        let mut report = PersistReport::default();

        for strategy in PersistStrategy::ORDER {
            let outcome = match strategy {
                PersistStrategy::NetfilterPersistent => self.netfilter_persistent(),
                PersistStrategy::DistroRulesFile => self.distro_rules_file(),
                PersistStrategy::LocalDump => self.local_dump(),
            };

            match outcome {
                Ok(detail) => {
                    info!("Rules persisted via {} ({})", strategy, detail);
                    report.attempts.push(PersistAttempt {
                        strategy,
                        outcome: Ok(detail),
                    });
                    break;
                }
                Err(e) => {
                    let reason = format!("{:#}", e);
                    if strategy == PersistStrategy::LocalDump {
                        warn!("Persisting via {} failed: {}", strategy, reason);
                    } else {
                        debug!("Persisting via {} unavailable: {}", strategy, reason);
                    }
                    report.attempts.push(PersistAttempt {
                        strategy,
                        outcome: Err(reason),
                    });
                }
            }
        }

        if report.success().is_none() {
            warn!("Rules are live but were not saved; they will be lost on reboot");
        }
        report
    }

    fn netfilter_persistent(&self) -> Result<String> {
        let output = self
            .executor
            .execute("netfilter-persistent", &args_to_strings(&["save"]))?;
        output.into_result("netfilter-persistent")?;
        Ok("netfilter-persistent save".to_string())
    }

    fn distro_rules_file(&self) -> Result<String> {
        let (dir, debian) = if self.paths.debian_dir.is_dir() {
            (&self.paths.debian_dir, true)
        } else if self.paths.rhel_dir.is_dir() {
            (&self.paths.rhel_dir, false)
        } else {
            anyhow::bail!(
                "neither {} nor {} exists",
                self.paths.debian_dir.display(),
                self.paths.rhel_dir.display()
            );
        };

        let mut written = Vec::new();
        for table in &self.tables {
            let family = table.family();
            let file = match (debian, family) {
                (true, Family::V4) => "rules.v4",
                (true, Family::V6) => "rules.v6",
                (false, Family::V4) => "iptables",
                (false, Family::V6) => "ip6tables",
            };
            let path = dir.join(file);
            fs::write(&path, table.dump_all()?).with_context(|| format!("Failed to write {:?}", path))?;
            written.push(path.display().to_string());

            let unit = match family {
                Family::V4 => "iptables",
                Family::V6 => "ip6tables",
            };
            if self.unit_exists(unit) {
                run(self.executor, "systemctl", &["restart", unit])
                    .with_context(|| format!("Failed to restart {}", unit))?;
            }
        }
        Ok(written.join(", "))
    }

    fn unit_exists(&self, unit: &str) -> bool {
        self.executor
            .execute("systemctl", &args_to_strings(&["cat", &format!("{}.service", unit)]))
            .map(|o| o.success)
            .unwrap_or(false)
    }

    fn local_dump(&self) -> Result<String> {
        let dir = &self.paths.state_dir;
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

        let mut script = String::from("#!/bin/sh\n# Re-apply edgewall rules saved by `edgewall`.\nset -e\n");
        for table in &self.tables {
            let path = self.paths.local_dump(table.family());
            fs::write(&path, table.dump_all()?).with_context(|| format!("Failed to write {:?}", path))?;
            script.push_str(&format!(
                "{} < {}\n",
                restore_program(table.family()),
                path.display()
            ));
        }

        let script_path = self.paths.restore_script();
        fs::write(&script_path, script).with_context(|| format!("Failed to write {:?}", script_path))?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;

        Ok(format!(
            "run {} at boot to restore the rules",
            script_path.display()
        ))
    }
}

/// Feed the local dumps back into the tables. Returns the families restored.
pub fn restore_local_dump(tables: &[&dyn RuleTable], paths: &PersistPaths) -> Result<Vec<Family>> {
    let mut restored = Vec::new();
    for table in tables {
        let path = paths.local_dump(table.family());
        if !path.exists() {
            debug!("No local dump at {:?}", path);
            continue;
        }
        let dump = fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        table
            .restore_all(&dump)
            .with_context(|| format!("Failed to restore {:?}", path))?;
        restored.push(table.family());
    }

    if restored.is_empty() {
        return Err(SyncError::Persistence(format!(
            "no saved rules under {}",
            paths.state_dir.display()
        ))
        .into());
    }
    Ok(restored)
}
