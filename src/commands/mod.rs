//! CLI command implementations.

pub mod add;
pub mod cron;
pub mod delete;
pub mod dry_run;
pub mod list;
pub mod restore;
pub mod schedule;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::Config;
use crate::enforcer::{available_families, create_tables, IptablesTable, RuleTable};
use crate::fetcher::PayloadCache;
use crate::persistence::{PersistPaths, Persister};
use crate::prefix::{Family, FamilyFilter};
use crate::reconciler::ChainLayout;
use crate::scheduler::SystemdTimer;
use crate::state::StateStore;

/// Everything a command needs on a real host.
pub struct Runtime {
    pub config: Config,
    pub config_path: PathBuf,
    pub executor: RealCommandExecutor,
    v4: IptablesTable<RealCommandExecutor>,
    v6: IptablesTable<RealCommandExecutor>,
}

impl Runtime {
    pub fn load(config_path: &Path) -> Result<Self> {
        let config = Config::load_or_default(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?;
        let executor = RealCommandExecutor::new();
        let (v4, v6) = create_tables(executor);
        Ok(Self {
            config,
            config_path: config_path.to_path_buf(),
            executor,
            v4,
            v6,
        })
    }

    /// Tables for the families in `filter`, v4 first.
    pub fn tables(&self, filter: FamilyFilter) -> Vec<&dyn RuleTable> {
        self.tables_in(&filter.families())
    }

    pub fn tables_in(&self, families: &[Family]) -> Vec<&dyn RuleTable> {
        let mut tables: Vec<&dyn RuleTable> = Vec::new();
        if families.contains(&self.v4.family()) {
            tables.push(&self.v4);
        }
        if families.contains(&self.v6.family()) {
            tables.push(&self.v6);
        }
        tables
    }

    /// Tables whose rule tool is installed on this host.
    pub fn installed_tables(&self) -> Vec<&dyn RuleTable> {
        self.tables_in(&available_families(&self.executor))
    }

    pub fn layout(&self) -> ChainLayout {
        ChainLayout::from_config(&self.config)
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.config.state_file(), self.config.default_update_interval_days)
    }

    pub fn cache(&self) -> PayloadCache {
        PayloadCache::new(self.config.cache_dir())
    }

    pub fn timer(&self) -> SystemdTimer<'_> {
        SystemdTimer::new(&self.executor, &self.config.binary_path, &self.config_path)
    }

    pub fn persist_paths(&self) -> PersistPaths {
        PersistPaths::new(&self.config.state_dir)
    }

    /// Save the live rules of every installed family and print where they went.
    pub fn persist(&self) {
        let persister = Persister::new(&self.executor, self.installed_tables(), self.persist_paths());
        match persister.persist().into_result() {
            Ok(attempt) => {
                let detail = attempt.outcome.unwrap_or_default();
                println!("[OK] Rules saved via {} ({})", attempt.strategy, detail);
            }
            Err(e) => println!("[WARN] {}", e),
        }
    }
}

/// Current Unix time in seconds.
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
