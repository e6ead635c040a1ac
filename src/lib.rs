//! # edgewall - CDN edge-node whitelisting for Linux hosts
//!
//! Restricts selected inbound ports to the published address list of a CDN's
//! edge nodes and keeps that whitelist in sync as the list changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        edgewall                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── --add, --delete, --list, --test, --cron, ...         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Fetcher (reqwest + rustls)                                 │
//! │    └── endpoint → cached payload → configured → built-in    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Normalizer (serde_json, regex) → Translator (ipnet)        │
//! │    └── JSON array / bracketed text / free text → prefixes   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Reconciler                                                 │
//! │    └── per port: chain, ACCEPT per prefix, DROP sentinel    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Enforcer (RuleTable trait)                                 │
//! │    └── IptablesTable (iptables / ip6tables)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  State (JSON) · Scheduler (systemd timer) · Persistence     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use edgewall::cmd_abstraction::RealCommandExecutor;
//! use edgewall::config::Config;
//! use edgewall::enforcer::{check_root, create_tables, RuleTable};
//! use edgewall::fetcher::{HttpSource, PayloadCache};
//! use edgewall::prefix::{Area, FamilyFilter};
//! use edgewall::reconciler::ChainLayout;
//! use edgewall::state::ProtectedPort;
//! use edgewall::sync::Syncer;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     check_root()?;
//!
//!     let config = Config::load_or_default("/etc/edgewall/config.yaml")?;
//!     let (v4, v6) = create_tables(RealCommandExecutor::new());
//!     let source = HttpSource::from_config(&config)?;
//!
//!     let tables: Vec<&dyn RuleTable> = vec![&v4, &v6];
//!     let syncer = Syncer::new(
//!         &source,
//!         tables,
//!         ChainLayout::from_config(&config),
//!         PayloadCache::new(config.cache_dir()),
//!     );
//!
//!     let entry = ProtectedPort::new(443, FamilyFilter::Both, Area::Global);
//!     let outcome = syncer.sync_port(&entry).await?;
//!     println!("converged: {}", outcome.is_converged());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - External command execution seam
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`enforcer`] - Rule-table abstraction and the iptables backend
//! - [`error`] - Error taxonomy
//! - [`fetcher`] - Address-list client and fallbacks
//! - [`normalizer`] - Payload parsing into prefixes
//! - [`persistence`] - Saving rules across reboots
//! - [`prefix`] - Network prefixes, families and areas
//! - [`reconciler`] - Per-port chain convergence
//! - [`scheduler`] - Due check and the daily timer
//! - [`state`] - Sync record persistence
//! - [`sync`] - The end-to-end pipeline
//! - [`translator`] - Prefix to source-matcher translation

pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod fetcher;
pub mod normalizer;
pub mod persistence;
pub mod prefix;
pub mod reconciler;
pub mod scheduler;
pub mod state;
pub mod sync;
pub mod translator;

pub use cli::{Action, Cli};
pub use config::Config;
pub use error::SyncError;
