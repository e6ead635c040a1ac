//! iptables / ip6tables backend.

use anyhow::{Context, Result};
use tracing::debug;

use super::{MatchSpec, Rule, RuleTable, Verdict};
use crate::cmd_abstraction::{args_to_strings, run, CommandExecutor};
use crate::prefix::Family;
use crate::translator::SourceMatch;

/// Tool names for one family.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Programs {
    pub cli: &'static str,
    pub save: &'static str,
    pub restore: &'static str,
}

pub(crate) fn programs(family: Family) -> Programs {
    match family {
        Family::V4 => Programs {
            cli: "iptables",
            save: "iptables-save",
            restore: "iptables-restore",
        },
        Family::V6 => Programs {
            cli: "ip6tables",
            save: "ip6tables-save",
            restore: "ip6tables-restore",
        },
    }
}

/// Filter table of one family, driven through the iptables CLI.
pub struct IptablesTable<E: CommandExecutor> {
    family: Family,
    executor: E,
}

impl<E: CommandExecutor> IptablesTable<E> {
    pub fn new(family: Family, executor: E) -> Self {
        Self { family, executor }
    }

    fn cli(&self) -> &'static str {
        programs(self.family).cli
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!("{} {}", self.cli(), args.join(" "));
        run(&self.executor, self.cli(), args)
    }

    /// Exit status of a check command (`-C`, `-S`), errors only when the
    /// program could not be started.
    fn check(&self, args: &[String]) -> Result<bool> {
        Ok(self.executor.execute(self.cli(), args)?.success)
    }

    fn rule_args(op: &str, chain: &str, spec: &MatchSpec, verdict: &Verdict) -> Vec<String> {
        let mut args = vec![op.to_string(), chain.to_string()];
        args.extend(spec.to_args());
        args.push("-j".to_string());
        args.push(verdict.target().to_string());
        args
    }

    fn run_owned(&self, args: Vec<String>) -> Result<()> {
        debug!("{} {}", self.cli(), args.join(" "));
        self.executor
            .execute(self.cli(), &args)?
            .into_result(self.cli())
            .map(|_| ())
    }
}

impl<E: CommandExecutor> RuleTable for IptablesTable<E> {
    fn family(&self) -> Family {
        self.family
    }

    fn chain_exists(&self, chain: &str) -> Result<bool> {
        self.check(&args_to_strings(&["-S", chain]))
    }

    fn create_chain(&self, chain: &str) -> Result<()> {
        self.run(&["-N", chain])
            .with_context(|| format!("Failed to create chain {}", chain))
            .map(|_| ())
    }

    fn flush_chain(&self, chain: &str) -> Result<()> {
        self.run(&["-F", chain])
            .with_context(|| format!("Failed to flush chain {}", chain))
            .map(|_| ())
    }

    fn chain_referenced(&self, parent: &str, chain: &str) -> Result<bool> {
        self.check(&args_to_strings(&["-C", parent, "-j", chain]))
    }

    fn insert_chain_reference(&self, parent: &str, chain: &str) -> Result<()> {
        self.run(&["-I", parent, "1", "-j", chain])
            .with_context(|| format!("Failed to reference {} from {}", chain, parent))
            .map(|_| ())
    }

    fn append_rule(&self, chain: &str, spec: &MatchSpec, verdict: &Verdict) -> Result<()> {
        self.run_owned(Self::rule_args("-A", chain, spec, verdict))
    }

    fn delete_rule(&self, chain: &str, spec: &MatchSpec, verdict: &Verdict) -> Result<()> {
        self.run_owned(Self::rule_args("-D", chain, spec, verdict))
    }

    fn rule_exists(&self, chain: &str, spec: &MatchSpec, verdict: &Verdict) -> Result<bool> {
        self.check(&Self::rule_args("-C", chain, spec, verdict))
    }

    fn list_rules(&self, chain: &str) -> Result<Vec<Rule>> {
        let output = self
            .run(&["-S", chain])
            .with_context(|| format!("Failed to list chain {}", chain))?;

        Ok(output
            .lines()
            .filter_map(parse_rule_line)
            .filter(|(owner, _)| owner == chain)
            .map(|(_, rule)| rule)
            .collect())
    }

    fn dump_all(&self) -> Result<String> {
        let save = programs(self.family).save;
        run(&self.executor, save, &[]).with_context(|| format!("Failed to dump rules with {}", save))
    }

    fn restore_all(&self, dump: &str) -> Result<()> {
        let restore = programs(self.family).restore;
        self.executor
            .execute_with_stdin(restore, &[], dump)?
            .into_result(restore)
            .map(|_| ())
    }
}

/// Parse one `-A CHAIN ...` line of `iptables -S` / `iptables-save` output.
pub(crate) fn parse_rule_line(line: &str) -> Option<(String, Rule)> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "-A" {
        return None;
    }
    let chain = tokens.next()?.to_string();

    let mut spec = MatchSpec::default();
    let mut target = None;

    while let Some(token) = tokens.next() {
        match token {
            "-s" | "--source" => {
                let value = tokens.next()?;
                match SourceMatch::parse(value) {
                    Some(source) => spec.source = Some(source),
                    None => spec.extra.extend([token.to_string(), value.to_string()]),
                }
            }
            "-p" | "--protocol" => spec.protocol = Some(tokens.next()?.to_string()),
            "-m" | "--match" => {
                let module = tokens.next()?;
                // the protocol match module iptables adds implicitly
                if spec.protocol.as_deref() != Some(module) {
                    spec.extra.extend([token.to_string(), module.to_string()]);
                }
            }
            "--dport" | "--destination-port" => {
                let value = tokens.next()?;
                match value.parse::<u16>() {
                    Ok(port) => spec.dport = Some(port),
                    Err(_) => spec.extra.extend([token.to_string(), value.to_string()]),
                }
            }
            "-j" | "--jump" => target = Some(tokens.next()?.to_string()),
            other => spec.extra.push(other.to_string()),
        }
    }

    Some((chain, Rule::new(spec, Verdict::from_target(&target?))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::{CommandOutput, MockCommandExecutor};

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    fn exit(code: i32) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: "iptables: Bad rule (does a matching rule exist in that chain?).".to_string(),
            success: false,
            code: Some(code),
        }
    }

    #[test]
    fn test_parse_accept_line() {
        let (chain, rule) =
            parse_rule_line("-A EDGEWALL-80 -s 203.0.113.0/24 -p tcp -m tcp --dport 80 -j ACCEPT").unwrap();
        assert_eq!(chain, "EDGEWALL-80");
        assert_eq!(rule.verdict, Verdict::Accept);
        assert_eq!(rule.spec.dport, Some(80));
        assert_eq!(rule.spec.protocol.as_deref(), Some("tcp"));
        assert!(rule.spec.extra.is_empty());
        assert_eq!(
            rule.spec.source.and_then(|s| s.network()),
            Some("203.0.113.0/24".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_jump_and_foreign_matchers() {
        let (_, jump) = parse_rule_line("-A INPUT -j EDGEWALL-80").unwrap();
        assert!(jump.spec.is_empty());
        assert_eq!(jump.verdict, Verdict::Jump("EDGEWALL-80".into()));

        let (_, foreign) = parse_rule_line("-A INPUT -i lo -j EDGEWALL-80").unwrap();
        assert_eq!(foreign.spec.extra, vec!["-i", "lo"]);
        assert!(!foreign.spec.is_empty());
    }

    #[test]
    fn test_parse_skips_policy_and_chain_lines() {
        assert!(parse_rule_line("-P INPUT ACCEPT").is_none());
        assert!(parse_rule_line("-N EDGEWALL-80").is_none());
        assert!(parse_rule_line("-A INPUT -p tcp --dport 22").is_none());
    }

    #[test]
    fn test_append_rule_arguments() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| {
                cmd == "iptables"
                    && args
                        == args_to_strings(&[
                            "-A",
                            "EDGEWALL-443",
                            "-s",
                            "198.51.100.0/255.255.255.0",
                            "-p",
                            "tcp",
                            "--dport",
                            "443",
                            "-j",
                            "ACCEPT",
                        ])
                        .as_slice()
            })
            .times(1)
            .returning(|_, _| Ok(ok("")));

        let table = IptablesTable::new(Family::V4, mock);
        let spec = MatchSpec::port("tcp", 443)
            .with_source(SourceMatch::parse("198.51.100.0/255.255.255.0").unwrap());
        table.append_rule("EDGEWALL-443", &spec, &Verdict::Accept).unwrap();
    }

    #[test]
    fn test_append_rule_rejection_is_error() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute().returning(|_, _| Ok(exit(2)));

        let table = IptablesTable::new(Family::V6, mock);
        let spec = MatchSpec::port("tcp", 80).with_source(SourceMatch::parse("2001:db8::/32").unwrap());
        let err = table.append_rule("EDGEWALL-80", &spec, &Verdict::Accept).unwrap_err();
        assert!(err.to_string().starts_with("ip6tables failed"));
    }

    #[test]
    fn test_chain_referenced_uses_check() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| cmd == "iptables" && args == args_to_strings(&["-C", "INPUT", "-j", "EDGEWALL-80"]).as_slice())
            .times(1)
            .returning(|_, _| Ok(exit(1)));

        let table = IptablesTable::new(Family::V4, mock);
        assert!(!table.chain_referenced("INPUT", "EDGEWALL-80").unwrap());
    }

    #[test]
    fn test_rule_exists_checks_sentinel() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, args| {
                cmd == "ip6tables"
                    && args == args_to_strings(&["-C", "INPUT", "-p", "tcp", "--dport", "80", "-j", "DROP"]).as_slice()
            })
            .times(1)
            .returning(|_, _| Ok(ok("")));

        let table = IptablesTable::new(Family::V6, mock);
        assert!(table
            .rule_exists("INPUT", &MatchSpec::port("tcp", 80), &Verdict::Drop)
            .unwrap());
    }

    #[test]
    fn test_insert_reference_at_top() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| args == args_to_strings(&["-I", "INPUT", "1", "-j", "EDGEWALL-80"]).as_slice())
            .times(1)
            .returning(|_, _| Ok(ok("")));

        let table = IptablesTable::new(Family::V4, mock);
        table.insert_chain_reference("INPUT", "EDGEWALL-80").unwrap();
    }

    #[test]
    fn test_list_rules_filters_chain() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute().returning(|_, _| {
            Ok(ok("-N EDGEWALL-80\n\
                   -A EDGEWALL-80 -s 203.0.113.0/24 -p tcp -m tcp --dport 80 -j ACCEPT\n\
                   -A EDGEWALL-80 -s 198.51.100.0/24 -p tcp -m tcp --dport 80 -j ACCEPT\n"))
        });

        let table = IptablesTable::new(Family::V4, mock);
        let rules = table.list_rules("EDGEWALL-80").unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.verdict == Verdict::Accept));
    }

    #[test]
    fn test_dump_and_restore_use_save_tools() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|cmd, _| cmd == "ip6tables-save")
            .times(1)
            .returning(|_, _| Ok(ok("*filter\nCOMMIT\n")));
        mock.expect_execute_with_stdin()
            .withf(|cmd, _, stdin| cmd == "ip6tables-restore" && stdin == "*filter\nCOMMIT\n")
            .times(1)
            .returning(|_, _, _| Ok(ok("")));

        let table = IptablesTable::new(Family::V6, mock);
        let dump = table.dump_all().unwrap();
        table.restore_all(&dump).unwrap();
    }
}
