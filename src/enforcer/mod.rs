//! Firewall rule-table abstraction and host checks.

mod iptables;

use anyhow::Result;
use std::fmt;

pub use iptables::IptablesTable;

use crate::cmd_abstraction::{is_available, CommandExecutor};
use crate::error::SyncError;
use crate::prefix::Family;
use crate::translator::SourceMatch;

/// What a rule does with a matching packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    Drop,
    /// Jump to a user chain.
    Jump(String),
}

impl Verdict {
    pub fn target(&self) -> &str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
            Verdict::Jump(chain) => chain,
        }
    }

    pub fn from_target(target: &str) -> Self {
        match target {
            "ACCEPT" => Verdict::Accept,
            "DROP" => Verdict::Drop,
            other => Verdict::Jump(other.to_string()),
        }
    }
}

/// Packet matchers of one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatchSpec {
    pub source: Option<SourceMatch>,
    pub protocol: Option<String>,
    pub dport: Option<u16>,
    /// Matchers this tool never writes (interfaces, negations, ...), kept
    /// verbatim so foreign rules are never mistaken for ours.
    pub extra: Vec<String>,
}

impl MatchSpec {
    /// `-p <protocol> --dport <port>`, optionally restricted to a source.
    pub fn port(protocol: &str, port: u16) -> Self {
        Self {
            source: None,
            protocol: Some(protocol.to_string()),
            dport: Some(port),
            extra: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: SourceMatch) -> Self {
        self.source = Some(source);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.protocol.is_none() && self.dport.is_none() && self.extra.is_empty()
    }

    /// Command-line arguments for this matcher, without chain or target.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(source) = &self.source {
            args.push("-s".to_string());
            args.push(source.to_string());
        }
        if let Some(protocol) = &self.protocol {
            args.push("-p".to_string());
            args.push(protocol.clone());
        }
        if let Some(port) = self.dport {
            args.push("--dport".to_string());
            args.push(port.to_string());
        }
        args.extend(self.extra.iter().cloned());
        args
    }
}

/// One entry of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub spec: MatchSpec,
    pub verdict: Verdict,
}

impl Rule {
    pub fn new(spec: MatchSpec, verdict: Verdict) -> Self {
        Self { spec, verdict }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = self.spec.to_args();
        parts.push("-j".to_string());
        parts.push(self.verdict.target().to_string());
        f.write_str(&parts.join(" "))
    }
}

/// Mutation interface of one family's filter table.
///
/// Implementations are synchronous; callers serialize invocations per host.
pub trait RuleTable: Send + Sync {
    fn family(&self) -> Family;

    fn chain_exists(&self, chain: &str) -> Result<bool>;

    fn create_chain(&self, chain: &str) -> Result<()>;

    fn flush_chain(&self, chain: &str) -> Result<()>;

    /// Whether `parent` holds an unconditional jump to `chain`.
    fn chain_referenced(&self, parent: &str, chain: &str) -> Result<bool>;

    /// Insert an unconditional jump to `chain` at the top of `parent`.
    fn insert_chain_reference(&self, parent: &str, chain: &str) -> Result<()>;

    fn append_rule(&self, chain: &str, spec: &MatchSpec, verdict: &Verdict) -> Result<()>;

    /// Delete the first rule equal to `spec -j verdict`.
    fn delete_rule(&self, chain: &str, spec: &MatchSpec, verdict: &Verdict) -> Result<()>;

    fn list_rules(&self, chain: &str) -> Result<Vec<Rule>>;

    fn rule_exists(&self, chain: &str, spec: &MatchSpec, verdict: &Verdict) -> Result<bool> {
        Ok(self
            .list_rules(chain)?
            .iter()
            .any(|r| &r.spec == spec && &r.verdict == verdict))
    }

    /// Serialized form of the whole table, in the backend's save format.
    fn dump_all(&self) -> Result<String>;

    fn restore_all(&self, dump: &str) -> Result<()>;
}

/// Create the iptables-backed tables for both families.
pub fn create_tables<E>(executor: E) -> (IptablesTable<E>, IptablesTable<E>)
where
    E: CommandExecutor + Clone,
{
    (
        IptablesTable::new(Family::V4, executor.clone()),
        IptablesTable::new(Family::V6, executor),
    )
}

/// `iptables-restore` / `ip6tables-restore`.
pub fn restore_program(family: Family) -> &'static str {
    iptables::programs(family).restore
}

/// Check if running as root (effective UID == 0).
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        return Err(SyncError::Privilege(
            "this operation modifies firewall rules and requires root. Please run with sudo."
                .to_string(),
        )
        .into());
    }
    Ok(())
}

/// Check that the rule tools for every family in use are installed.
pub fn check_dependencies(executor: &dyn CommandExecutor, families: &[Family]) -> Result<()> {
    let missing: Vec<&str> = families
        .iter()
        .map(|f| iptables::programs(*f).cli)
        .filter(|program| !is_available(executor, program))
        .collect();

    if !missing.is_empty() {
        return Err(SyncError::MissingDependency(format!(
            "{} not found. Install the iptables package.",
            missing.join(", ")
        ))
        .into());
    }
    Ok(())
}

/// Families whose rule tool answers on this host, v4 first.
pub fn available_families(executor: &dyn CommandExecutor) -> Vec<Family> {
    [Family::V4, Family::V6]
        .into_iter()
        .filter(|f| is_available(executor, iptables::programs(*f).cli))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::{CommandOutput, MockCommandExecutor};

    #[test]
    fn test_rule_display() {
        let rule = Rule::new(
            MatchSpec::port("tcp", 80).with_source(SourceMatch::parse("203.0.113.0/255.255.255.0").unwrap()),
            Verdict::Accept,
        );
        assert_eq!(rule.to_string(), "-s 203.0.113.0/255.255.255.0 -p tcp --dport 80 -j ACCEPT");
    }

    #[test]
    fn test_verdict_round_trip_targets() {
        assert_eq!(Verdict::from_target("DROP"), Verdict::Drop);
        assert_eq!(Verdict::from_target("EDGEWALL-80"), Verdict::Jump("EDGEWALL-80".into()));
        assert_eq!(Verdict::Jump("EDGEWALL-80".into()).target(), "EDGEWALL-80");
    }

    #[test]
    fn test_check_dependencies_reports_missing() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, _| cmd == "iptables")
            .returning(|_, _| {
                Ok(CommandOutput {
                    success: true,
                    ..Default::default()
                })
            });
        mock.expect_execute()
            .withf(|cmd, _| cmd == "ip6tables")
            .returning(|_, _| Err(anyhow::anyhow!("not found")));

        assert!(check_dependencies(&mock, &[Family::V4]).is_ok());

        assert_eq!(available_families(&mock), vec![Family::V4]);

        let err = check_dependencies(&mock, &[Family::V4, Family::V6]).unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::MissingDependency(msg)) => assert!(msg.contains("ip6tables")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
