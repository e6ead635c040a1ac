//! The sync pipeline: fetch, normalize, converge, per protected port.

use anyhow::Result;
use tracing::{error, info, warn};

use crate::enforcer::RuleTable;
use crate::error::SyncError;
use crate::fetcher::{fallback_payload, AddressSource, FallbackOrigin, PayloadCache, SourceQuery};
use crate::normalizer::{normalize, Normalized};
use crate::prefix::Family;
use crate::reconciler::{converge, remove_protection, ChainLayout, ReconcileReport};
use crate::scheduler::is_due;
use crate::state::{ProtectedPort, SyncRecord};

/// A normalized prefix set and where its payload came from.
#[derive(Debug)]
pub struct Resolved {
    pub query: SourceQuery,
    pub normalized: Normalized,
    pub payload: String,
    /// `None` when the payload came from the endpoint.
    pub fallback: Option<FallbackOrigin>,
}

/// Result of protecting one port across its families.
#[derive(Debug)]
pub struct PortOutcome {
    pub entry: ProtectedPort,
    pub reports: Vec<ReconcileReport>,
    /// Families the payload held no prefix for.
    pub skipped: Vec<Family>,
    /// Tables that could not be prepared.
    pub errors: Vec<(Family, anyhow::Error)>,
    /// Families outside the entry's filter whose leftover DROP was removed.
    pub released: Vec<Family>,
}

impl PortOutcome {
    /// Every family with prefixes ended with its DROP sentinel in place.
    pub fn is_converged(&self) -> bool {
        self.errors.is_empty()
            && !self.reports.is_empty()
            && self.reports.iter().all(ReconcileReport::is_converged)
    }

    pub fn degraded(&self) -> usize {
        self.reports.iter().map(|r| r.degraded.len()).sum()
    }

    pub fn failed(&self) -> usize {
        self.reports.iter().map(|r| r.failed.len()).sum()
    }
}

/// Remove the DROP sentinel for `port` from every table. Returns whether
/// any table held one.
pub fn unprotect(tables: &[&dyn RuleTable], layout: &ChainLayout, port: u16) -> Result<bool> {
    let mut removed = false;
    for table in tables {
        removed |= remove_protection(*table, layout, port)?;
    }
    Ok(removed)
}

/// Outcome of a scheduled resync pass.
#[derive(Debug)]
pub struct ResyncOutcome {
    pub due: bool,
    pub ports: Vec<(ProtectedPort, Result<PortOutcome>)>,
    pub record: SyncRecord,
}

impl ResyncOutcome {
    pub fn all_converged(&self) -> bool {
        self.ports
            .iter()
            .all(|(_, r)| matches!(r, Ok(outcome) if outcome.is_converged()))
    }
}

pub struct Syncer<'a> {
    source: &'a dyn AddressSource,
    tables: Vec<&'a dyn RuleTable>,
    layout: ChainLayout,
    cache: PayloadCache,
    fallback_prefixes: Vec<String>,
}

impl<'a> Syncer<'a> {
    pub fn new(
        source: &'a dyn AddressSource,
        tables: Vec<&'a dyn RuleTable>,
        layout: ChainLayout,
        cache: PayloadCache,
    ) -> Self {
        Self {
            source,
            tables,
            layout,
            cache,
            fallback_prefixes: Vec::new(),
        }
    }

    pub fn with_fallback_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.fallback_prefixes = prefixes;
        self
    }

    pub fn layout(&self) -> &ChainLayout {
        &self.layout
    }

    /// Fetch and normalize the list for `query`, substituting a fallback
    /// payload when the endpoint is unreachable.
    pub async fn resolve(&self, query: &SourceQuery) -> Result<Resolved, SyncError> {
        let (payload, fallback) = match self.source.fetch(query).await {
            Ok(payload) => (payload, None),
            Err(e) if !e.is_fatal() => {
                warn!("{}", e);
                let (origin, payload) = fallback_payload(&self.cache, query, &self.fallback_prefixes);
                warn!("Using {}", origin);
                (payload, Some(origin))
            }
            Err(e) => return Err(e),
        };

        let normalized = normalize(payload.as_bytes(), query.family)?;
        info!(
            "{} IPv4 and {} IPv6 prefixes ({} via {})",
            normalized.count(Family::V4),
            normalized.count(Family::V6),
            match &fallback {
                Some(origin) => origin.to_string(),
                None => "endpoint".to_string(),
            },
            normalized.method.as_str()
        );

        Ok(Resolved {
            query: *query,
            normalized,
            payload,
            fallback,
        })
    }

    /// Converge every table covered by `entry` to the resolved set.
    pub fn protect(&self, entry: &ProtectedPort, resolved: &Resolved) -> PortOutcome {
        let mut outcome = PortOutcome {
            entry: *entry,
            reports: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            released: Vec::new(),
        };

        // a narrowed filter must not leave the other family's DROP behind
        for table in self.tables.iter().filter(|t| !entry.family.includes(t.family())) {
            match remove_protection(*table, &self.layout, entry.port) {
                Ok(true) => outcome.released.push(table.family()),
                Ok(false) => {}
                Err(e) => warn!(
                    "{} port {}: could not check for a leftover DROP: {:#}",
                    table.family(),
                    entry.port,
                    e
                ),
            }
        }

        for table in self.tables.iter().filter(|t| entry.family.includes(t.family())) {
            let family = table.family();
            let prefixes = resolved.normalized.of_family(family);
            if prefixes.is_empty() {
                warn!("No {} prefixes in the list, port {} stays open over {}", family, entry.port, family);
                outcome.skipped.push(family);
                continue;
            }

            match converge(*table, &self.layout, entry.port, &prefixes) {
                Ok(report) => outcome.reports.push(report),
                Err(e) => {
                    error!("{} port {}: {:#}", family, entry.port, e);
                    outcome.errors.push((family, e));
                }
            }
        }

        if outcome.is_converged() && resolved.fallback.is_none() {
            if let Err(e) = self.cache.store(&resolved.query, &resolved.payload) {
                warn!("Failed to cache address list: {:#}", e);
            }
        }
        outcome
    }

    /// Resolve the list for `entry` and protect it.
    pub async fn sync_port(&self, entry: &ProtectedPort) -> Result<PortOutcome> {
        let resolved = self.resolve(&SourceQuery::new(entry.family, entry.area)).await?;
        Ok(self.protect(entry, &resolved))
    }

    /// Resync every protected port when the record is due.
    ///
    /// A failing port does not stop the others; the last-sync timestamp only
    /// moves when all ports converged.
    pub async fn resync_due(&self, record: SyncRecord, now: i64) -> ResyncOutcome {
        if !is_due(&record, now) {
            info!("Resync not due yet");
            return ResyncOutcome {
                due: false,
                ports: Vec::new(),
                record,
            };
        }

        let mut ports = Vec::new();
        for entry in &record.protected_ports {
            info!("Resyncing port {} ({}, {})", entry.port, entry.family, entry.area);
            let result = self.sync_port(entry).await;
            match &result {
                Ok(outcome) if outcome.is_converged() => {}
                Ok(_) => warn!("Port {} did not fully converge", entry.port),
                Err(e) => error!("Port {} resync failed: {:#}", entry.port, e),
            }
            ports.push((*entry, result));
        }

        let mut outcome = ResyncOutcome {
            due: true,
            ports,
            record,
        };
        if outcome.all_converged() {
            outcome.record = outcome.record.mark_synced(now);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::mock::MemoryTable;
    use crate::enforcer::Verdict;
    use crate::prefix::{Area, FamilyFilter};
    use crate::scheduler::SECONDS_PER_DAY;
    use crate::translator::MatchForm;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serves a fixed payload, or reports the endpoint as down.
    struct StubSource {
        payload: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn serving(payload: &'static str) -> Self {
            Self {
                payload: Some(payload),
                calls: AtomicUsize::new(0),
            }
        }

        fn down() -> Self {
            Self {
                payload: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AddressSource for StubSource {
        async fn fetch(&self, _query: &SourceQuery) -> Result<String, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.payload
                .map(str::to_string)
                .ok_or_else(|| SyncError::SourceUnavailable("connection refused".into()))
        }
    }

    struct Fixture {
        v4: MemoryTable,
        v6: MemoryTable,
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                v4: MemoryTable::new(Family::V4),
                v6: MemoryTable::new(Family::V6),
                dir: TempDir::new().unwrap(),
            }
        }

        fn syncer<'a>(&'a self, source: &'a StubSource) -> Syncer<'a> {
            Syncer::new(
                source,
                vec![&self.v4, &self.v6],
                ChainLayout::default(),
                PayloadCache::new(self.dir.path().join("cache")),
            )
        }
    }

    fn port80() -> ProtectedPort {
        ProtectedPort::new(80, FamilyFilter::Both, Area::Global)
    }

    #[tokio::test]
    async fn test_add_port_80_end_to_end() {
        let fx = Fixture::new();
        let source = StubSource::serving(r#"["203.0.113.0/24","2001:db8::/32"]"#);
        let syncer = fx.syncer(&source);

        let outcome = syncer.sync_port(&port80()).await.unwrap();
        assert!(outcome.is_converged());

        let v4 = fx.v4.rules("EDGEWALL-80");
        assert_eq!(v4.len(), 1);
        assert_eq!(v4[0].to_string(), "-s 203.0.113.0/255.255.255.0 -p tcp --dport 80 -j ACCEPT");
        let v6 = fx.v6.rules("EDGEWALL-80");
        assert_eq!(v6.len(), 1);
        assert_eq!(v6[0].to_string(), "-s 2001:db8::/32 -p tcp --dport 80 -j ACCEPT");

        for table in [&fx.v4, &fx.v6] {
            let input = table.rules("INPUT");
            let jump = input.iter().position(|r| r.verdict == Verdict::Jump("EDGEWALL-80".into()));
            let drop = input.iter().position(|r| r.verdict == Verdict::Drop && r.spec.dport == Some(80));
            assert!(drop.unwrap() > jump.unwrap());
        }

        let record = SyncRecord::new(7).add_protected_port(outcome.entry, 1_700_000_000);
        assert_eq!(record.find(80).unwrap().area, Area::Global);
        assert_eq!(record.last_sync_epoch, 1_700_000_000);
    }

    #[tokio::test]
    async fn test_adding_twice_changes_nothing() {
        let fx = Fixture::new();
        let source = StubSource::serving(r#"["203.0.113.0/24","2001:db8::/32"]"#);
        let syncer = fx.syncer(&source);

        syncer.sync_port(&port80()).await.unwrap();
        let v4_input = fx.v4.rules("INPUT");
        let v4_chain = fx.v4.rules("EDGEWALL-80");

        let second = syncer.sync_port(&port80()).await.unwrap();
        assert!(second.is_converged());
        assert!(second.reports.iter().all(|r| r.unchanged));
        assert_eq!(fx.v4.rules("INPUT"), v4_input);
        assert_eq!(fx.v4.rules("EDGEWALL-80"), v4_chain);
    }

    #[tokio::test]
    async fn test_empty_payload_never_reaches_tables() {
        let fx = Fixture::new();
        let source = StubSource::serving(r#"["not-an-ip", "999.1.1.1/8"]"#);
        let syncer = fx.syncer(&source);

        let err = syncer.sync_port(&port80()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::EmptyResultSet { dropped: 2 })
        ));
        assert!(!fx.v4.has_chain("EDGEWALL-80"));
        assert_eq!(fx.v4.op_count("append"), 0);
    }

    #[tokio::test]
    async fn test_source_down_uses_cached_payload() {
        let fx = Fixture::new();
        let live = StubSource::serving("203.0.113.0/24\n198.51.100.0/24\n");
        fx.syncer(&live).sync_port(&port80()).await.unwrap();

        let down = StubSource::down();
        let syncer = fx.syncer(&down);
        let resolved = syncer
            .resolve(&SourceQuery::new(FamilyFilter::Both, Area::Global))
            .await
            .unwrap();
        assert!(matches!(resolved.fallback, Some(FallbackOrigin::Cache(_))));
        assert_eq!(resolved.normalized.count(Family::V4), 2);
    }

    #[tokio::test]
    async fn test_source_down_uses_embedded_list() {
        let fx = Fixture::new();
        let down = StubSource::down();
        let outcome = fx.syncer(&down).sync_port(&port80()).await.unwrap();
        assert!(outcome.is_converged());
        assert!(!fx.v4.rules("EDGEWALL-80").is_empty());
        assert!(!fx.v6.rules("EDGEWALL-80").is_empty());
        assert!(!fx.dir.path().join("cache/both-global.txt").exists());

        let resolved = fx
            .syncer(&down)
            .resolve(&SourceQuery::new(FamilyFilter::Both, Area::Global))
            .await
            .unwrap();
        assert_eq!(resolved.fallback, Some(FallbackOrigin::Embedded));
    }

    #[tokio::test]
    async fn test_source_down_uses_configured_prefixes() {
        let fx = Fixture::new();
        let down = StubSource::down();
        let syncer = fx.syncer(&down).with_fallback_prefixes(vec!["192.0.2.0/24".to_string()]);

        let outcome = syncer.sync_port(&port80()).await.unwrap();
        assert_eq!(outcome.skipped, vec![Family::V6]);
        assert!(outcome.is_converged());
        // fallback payloads are never written back to the cache
        assert!(!fx.dir.path().join("cache/both-global.txt").exists());
    }

    #[tokio::test]
    async fn test_family_filter_limits_tables() {
        let fx = Fixture::new();
        let source = StubSource::serving(r#"["203.0.113.0/24","2001:db8::/32"]"#);
        let entry = ProtectedPort::new(443, FamilyFilter::V6, Area::Overseas);

        let outcome = fx.syncer(&source).sync_port(&entry).await.unwrap();
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].family, Family::V6);
        assert!(!fx.v4.has_chain("EDGEWALL-443"));
    }

    #[tokio::test]
    async fn test_delete_leaves_inert_accepts() {
        let fx = Fixture::new();
        let source = StubSource::serving(r#"["203.0.113.0/24","2001:db8::/32"]"#);
        let syncer = fx.syncer(&source);
        syncer.sync_port(&port80()).await.unwrap();

        assert!(unprotect(&syncer.tables, syncer.layout(), 80).unwrap());
        for table in [&fx.v4, &fx.v6] {
            assert!(!table.rules("INPUT").iter().any(|r| r.verdict == Verdict::Drop));
            assert_eq!(table.rules("EDGEWALL-80").len(), 1);
        }

        let record = SyncRecord::new(7)
            .add_protected_port(port80(), 1)
            .remove_protected_port(80);
        assert!(record.protected_ports.is_empty());
    }

    fn drop_count(table: &MemoryTable, port: u16) -> usize {
        table
            .rules("INPUT")
            .iter()
            .filter(|r| r.verdict == Verdict::Drop && r.spec.dport == Some(port))
            .count()
    }

    #[tokio::test]
    async fn test_narrowing_family_releases_other_drop() {
        let fx = Fixture::new();
        let source = StubSource::serving(r#"["203.0.113.0/24","2001:db8::/32"]"#);
        let syncer = fx.syncer(&source);

        syncer.sync_port(&port80()).await.unwrap();
        assert_eq!(drop_count(&fx.v6, 80), 1);

        let narrowed = ProtectedPort::new(80, FamilyFilter::V4, Area::Global);
        let outcome = syncer.sync_port(&narrowed).await.unwrap();
        assert!(outcome.is_converged());
        assert_eq!(outcome.released, vec![Family::V6]);
        assert_eq!(drop_count(&fx.v4, 80), 1);
        assert_eq!(drop_count(&fx.v6, 80), 0);

        let record = SyncRecord::new(7)
            .add_protected_port(port80(), 1)
            .add_protected_port(narrowed, 2);
        assert_eq!(record.find(80).unwrap().family, FamilyFilter::V4);

        assert!(unprotect(&syncer.tables, syncer.layout(), 80).unwrap());
        assert_eq!(drop_count(&fx.v4, 80), 0);
        assert_eq!(drop_count(&fx.v6, 80), 0);
    }

    #[tokio::test]
    async fn test_resync_not_due_does_nothing() {
        let fx = Fixture::new();
        let source = StubSource::serving("203.0.113.0/24");
        let record = SyncRecord::new(7).add_protected_port(port80(), 1_000);

        let outcome = fx.syncer(&source).resync_due(record.clone(), 1_000 + SECONDS_PER_DAY).await;
        assert!(!outcome.due);
        assert_eq!(outcome.record, record);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resync_continues_past_failing_port() {
        let fx = Fixture::new();
        let source = StubSource::serving("203.0.113.0/24");
        fx.v4.reject_form(MatchForm::DottedMask);
        fx.v4.reject_form(MatchForm::Cidr);
        fx.v4.reject_form(MatchForm::SingleHost);

        let record = SyncRecord::new(1)
            .add_protected_port(ProtectedPort::new(80, FamilyFilter::V4, Area::Global), 0)
            .add_protected_port(ProtectedPort::new(443, FamilyFilter::V4, Area::Global), 0);
        let now = 2 * SECONDS_PER_DAY;

        let outcome = fx.syncer(&source).resync_due(record, now).await;
        assert!(outcome.due);
        assert_eq!(outcome.ports.len(), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(!outcome.all_converged());
        assert_eq!(outcome.record.last_sync_epoch, 0);
    }

    #[tokio::test]
    async fn test_resync_marks_synced_when_all_converge() {
        let fx = Fixture::new();
        let source = StubSource::serving(r#"["203.0.113.0/24","2001:db8::/32"]"#);
        let record = SyncRecord::new(1)
            .add_protected_port(port80(), 0)
            .add_protected_port(ProtectedPort::new(8443, FamilyFilter::V4, Area::Global), 0);
        let now = SECONDS_PER_DAY;

        let outcome = fx.syncer(&source).resync_due(record, now).await;
        assert!(outcome.all_converged());
        assert_eq!(outcome.record.last_sync_epoch, now);
        assert_eq!(fx.v4.rules("EDGEWALL-8443").len(), 1);
        assert!(fx.v6.rules("EDGEWALL-8443").is_empty());
    }
}
