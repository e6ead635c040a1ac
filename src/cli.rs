//! CLI argument parsing with clap.

use clap::{ArgGroup, Parser};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::prefix::{Area, FamilyFilter};

#[derive(Parser, Debug)]
#[command(name = "edgewall")]
#[command(about = "Whitelist CDN edge nodes on selected ports, drop everyone else")]
#[command(disable_version_flag = true)]
#[command(group(
    ArgGroup::new("action")
        .args(["add", "delete", "list", "update_interval", "disable_update", "cron", "restore"])
        .multiple(false)
))]
pub struct Cli {
    /// Protect PORT: accept only edge-node addresses, drop the rest
    #[arg(long, value_name = "PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub add: Option<u16>,

    /// Stop protecting PORT
    #[arg(long, value_name = "PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub delete: Option<u16>,

    /// Show protected ports, schedule and live rule counts
    #[arg(long)]
    pub list: bool,

    /// Address family to whitelist (v4, v6; both when omitted)
    #[arg(long = "version", value_name = "FAMILY", default_value = "both")]
    pub family: FamilyFilter,

    /// Edge-node area (global, mainland-china, overseas)
    #[arg(long, default_value = "global")]
    pub area: Area,

    /// Debug output
    #[arg(long)]
    pub debug: bool,

    /// Errors only (used by the daily timer)
    #[arg(long)]
    pub quiet: bool,

    /// Dry run: fetch and normalize, report counts, change nothing
    #[arg(
        long,
        conflicts_with_all = ["delete", "list", "update_interval", "disable_update", "cron", "restore"]
    )]
    pub test: bool,

    /// Resync every DAYS days
    #[arg(long, value_name = "DAYS", value_parser = clap::value_parser!(u32).range(1..))]
    pub update_interval: Option<u32>,

    /// Remove the daily resync timer
    #[arg(long)]
    pub disable_update: bool,

    /// Scheduled entry point: resync all protected ports when due
    #[arg(long)]
    pub cron: bool,

    /// Re-apply rules saved under the state directory
    #[arg(long)]
    pub restore: bool,

    /// Config file path
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

/// The single thing one invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add(u16),
    Delete(u16),
    List,
    UpdateInterval(u32),
    DisableUpdate,
    Cron,
    Restore,
    /// `--test`, optionally previewing an add.
    DryRun(Option<u16>),
}

impl Cli {
    /// `None` when no action flag was given.
    pub fn action(&self) -> Option<Action> {
        if self.test {
            return Some(Action::DryRun(self.add));
        }
        if let Some(port) = self.add {
            return Some(Action::Add(port));
        }
        if let Some(port) = self.delete {
            return Some(Action::Delete(port));
        }
        if let Some(days) = self.update_interval {
            return Some(Action::UpdateInterval(days));
        }
        if self.list {
            Some(Action::List)
        } else if self.disable_update {
            Some(Action::DisableUpdate)
        } else if self.cron {
            Some(Action::Cron)
        } else if self.restore {
            Some(Action::Restore)
        } else {
            None
        }
    }
}
