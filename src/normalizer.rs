//! Address-list normalization.
//!
//! The endpoint answers either with a JSON array of prefix strings or with
//! loosely formatted text. The payload is classified first, then parsed by an
//! ordered list of attempts; the first attempt yielding at least one valid
//! prefix wins. Malformed tokens are dropped and counted, never fatal.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::prefix::{Family, FamilyFilter, NetworkPrefix};

/// Runs of characters that can make up an address literal, optionally
/// followed by a prefix length.
static CANDIDATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9A-Fa-f:.]+(?:/[0-9]+)?").expect("Invalid regex"));

/// Shape of a raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Array-shaped payload. `strict` is true when it was valid JSON.
    Structured { tokens: Vec<String>, strict: bool },
    /// Anything else that is not blank; scanned for literals.
    FreeText,
    /// Blank payload.
    Invalid,
}

impl Payload {
    pub fn classify(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Payload::Invalid;
        }

        if trimmed.contains('[') && trimmed.contains(']') {
            return match serde_json::from_str::<Vec<String>>(trimmed) {
                Ok(tokens) => Payload::Structured {
                    tokens,
                    strict: true,
                },
                Err(e) => {
                    debug!("Payload is array-shaped but not a JSON string array: {}", e);
                    Payload::Structured {
                        tokens: tolerant_split(trimmed),
                        strict: false,
                    }
                }
            };
        }

        Payload::FreeText
    }
}

/// How the winning token list was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMethod {
    StrictJson,
    TolerantSplit,
    PatternScan,
}

impl ParseMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseMethod::StrictJson => "json",
            ParseMethod::TolerantSplit => "bracketed text",
            ParseMethod::PatternScan => "text scan",
        }
    }
}

/// Result of normalizing one payload.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub prefixes: BTreeSet<NetworkPrefix>,
    /// Tokens that failed validation.
    pub dropped: usize,
    /// Valid prefixes excluded by the family filter.
    pub filtered: usize,
    pub method: ParseMethod,
}

impl Normalized {
    pub fn of_family(&self, family: Family) -> Vec<NetworkPrefix> {
        self.prefixes
            .iter()
            .filter(|p| p.family() == family)
            .copied()
            .collect()
    }

    pub fn count(&self, family: Family) -> usize {
        self.prefixes.iter().filter(|p| p.family() == family).count()
    }
}

/// Normalize a raw payload into a deduplicated prefix set.
///
/// Returns [`SyncError::EmptyResultSet`] when no attempt yields a prefix of
/// the requested families.
pub fn normalize(raw: &[u8], filter: FamilyFilter) -> Result<Normalized, SyncError> {
    let text = String::from_utf8_lossy(raw);

    let attempts: Vec<(ParseMethod, Vec<String>)> = match Payload::classify(&text) {
        Payload::Structured { tokens, strict } => {
            let first = if strict {
                ParseMethod::StrictJson
            } else {
                ParseMethod::TolerantSplit
            };
            vec![
                (first, tokens),
                (ParseMethod::PatternScan, scan_candidates(&text)),
            ]
        }
        Payload::FreeText => vec![(ParseMethod::PatternScan, scan_candidates(&text))],
        Payload::Invalid => Vec::new(),
    };

    let mut dropped = 0;
    for (method, tokens) in attempts {
        let outcome = validate_tokens(method, &tokens, filter);
        if !outcome.prefixes.is_empty() {
            if outcome.dropped > 0 {
                warn!(
                    "Dropped {} malformed entries from address list ({})",
                    outcome.dropped,
                    method.as_str()
                );
            }
            debug!(
                "Normalized {} prefixes via {} ({} filtered by family)",
                outcome.prefixes.len(),
                method.as_str(),
                outcome.filtered
            );
            return Ok(outcome);
        }
        debug!("Parse attempt '{}' yielded no prefixes", method.as_str());
        dropped = dropped.max(outcome.dropped);
    }

    Err(SyncError::EmptyResultSet { dropped })
}

fn validate_tokens(method: ParseMethod, tokens: &[String], filter: FamilyFilter) -> Normalized {
    let mut prefixes = BTreeSet::new();
    let mut dropped = 0;
    let mut filtered = 0;

    for token in tokens {
        match token.parse::<NetworkPrefix>() {
            Ok(prefix) if filter.includes(prefix.family()) => {
                prefixes.insert(prefix);
            }
            Ok(_) => filtered += 1,
            Err(e) => {
                debug!("Dropping entry: {}", e);
                dropped += 1;
            }
        }
    }

    Normalized {
        prefixes,
        dropped,
        filtered,
        method,
    }
}

/// Strip array and quote punctuation, then split on whitespace.
fn tolerant_split(text: &str) -> Vec<String> {
    text.chars()
        .map(|c| match c {
            '[' | ']' | '"' | '\'' | ',' => ' ',
            other => other,
        })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Find prefix-shaped literals anywhere in the text.
///
/// Literals embedded in other text need an explicit prefix length, so
/// version strings and timestamps never become host prefixes. A line that
/// holds nothing but an address is taken as that host.
fn scan_candidates(text: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.parse::<IpAddr>().is_ok() {
            candidates.push(line.to_string());
            continue;
        }
        candidates.extend(CANDIDATE_RE.find_iter(line).filter_map(|m| scan_literal(m.as_str())));
    }
    candidates
}

fn scan_literal(raw: &str) -> Option<String> {
    let (addr, len) = raw.trim_end_matches('.').split_once('/')?;

    if addr.contains('.') {
        // "key:192.0.2.0/24" glues a label onto the literal
        let v4 = addr.rsplit(':').next().unwrap_or(addr);
        return (v4.matches('.').count() == 3).then(|| format!("{}/{}", v4, len));
    }

    (addr.matches(':').count() >= 2).then(|| format!("{}/{}", addr, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(prefixes: &BTreeSet<NetworkPrefix>) -> Vec<String> {
        prefixes.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_classify_shapes() {
        assert_eq!(Payload::classify("   \n"), Payload::Invalid);
        assert_eq!(Payload::classify("192.0.2.0/24\n"), Payload::FreeText);
        assert_eq!(
            Payload::classify(r#"["192.0.2.0/24"]"#),
            Payload::Structured {
                tokens: vec!["192.0.2.0/24".to_string()],
                strict: true
            }
        );
        assert_eq!(
            Payload::classify("[192.0.2.0/24, 198.51.100.0/24]"),
            Payload::Structured {
                tokens: vec!["192.0.2.0/24".to_string(), "198.51.100.0/24".to_string()],
                strict: false
            }
        );
    }

    #[test]
    fn test_json_array() {
        let out = normalize(br#"["203.0.113.0/24","2001:db8::/32"]"#, FamilyFilter::Both).unwrap();
        assert_eq!(out.method, ParseMethod::StrictJson);
        assert_eq!(strings(&out.prefixes), vec!["203.0.113.0/24", "2001:db8::/32"]);
        assert_eq!(out.dropped, 0);
    }

    #[test]
    fn test_json_invalid_tokens_dropped_and_counted() {
        let payload = br#"["203.0.113.0/24", "not-a-prefix", "300.1.1.1/8", "198.51.100.0/24"]"#;
        let out = normalize(payload, FamilyFilter::Both).unwrap();
        assert_eq!(out.prefixes.len(), 2);
        assert_eq!(out.dropped, 2);
    }

    #[test]
    fn test_json_duplicates_collapse_after_normalization() {
        let payload = br#"["203.0.113.0/24", "203.0.113.9/24", "2001:DB8::/32", "2001:db8:0::/32"]"#;
        let out = normalize(payload, FamilyFilter::Both).unwrap();
        assert_eq!(strings(&out.prefixes), vec!["203.0.113.0/24", "2001:db8::/32"]);
    }

    #[test]
    fn test_bracketed_text_uses_tolerant_split() {
        let out = normalize(b"[203.0.113.0/24 198.51.100.0/24, 2001:db8::/32]", FamilyFilter::Both).unwrap();
        assert_eq!(out.method, ParseMethod::TolerantSplit);
        assert_eq!(out.prefixes.len(), 3);
    }

    #[test]
    fn test_newline_text() {
        let out = normalize(b"203.0.113.0/24\n198.51.100.0/24\n\n2001:db8::/32\n", FamilyFilter::Both).unwrap();
        assert_eq!(out.method, ParseMethod::PatternScan);
        assert_eq!(out.prefixes.len(), 3);
    }

    #[test]
    fn test_text_with_noise() {
        let payload = b"edge nodes (updated 2024-01-01): 203.0.113.0/24; also 2001:db8:1::/48.\n\
                        contact: ops@example.com cafe beef";
        let out = normalize(payload, FamilyFilter::Both).unwrap();
        assert_eq!(strings(&out.prefixes), vec!["203.0.113.0/24", "2001:db8:1::/48"]);
        assert_eq!(out.dropped, 0);
    }

    #[test]
    fn test_dotted_versions_in_text_are_not_hosts() {
        let out = normalize(b"edge list generator v1.2.3.4\n203.0.113.0/24\n", FamilyFilter::Both).unwrap();
        assert_eq!(strings(&out.prefixes), vec!["203.0.113.0/24"]);

        let out = normalize(b"build 10.0.0.1 at 12:30:45.100\n2001:db8::/32\n", FamilyFilter::Both).unwrap();
        assert_eq!(strings(&out.prefixes), vec!["2001:db8::/32"]);
    }

    #[test]
    fn test_address_alone_on_a_line_is_a_host() {
        let out = normalize(b"203.0.113.7\n  2001:db8::1  \n198.51.100.0/24\n", FamilyFilter::Both).unwrap();
        assert_eq!(
            strings(&out.prefixes),
            vec!["198.51.100.0/24", "203.0.113.7/32", "2001:db8::1/128"]
        );
    }

    #[test]
    fn test_array_shaped_object_keeps_usable_tokens() {
        let payload = br#"{"v4":["203.0.113.0/24"],"v6":["2001:db8::/32"]}"#;
        let out = normalize(payload, FamilyFilter::Both).unwrap();
        assert_eq!(out.method, ParseMethod::TolerantSplit);
        assert_eq!(out.prefixes.len(), 2);
    }

    #[test]
    fn test_nested_objects_fall_back_to_scan() {
        let payload = b"[{cidr:203.0.113.0/24}]";
        let out = normalize(payload, FamilyFilter::Both).unwrap();
        assert_eq!(out.method, ParseMethod::PatternScan);
        assert_eq!(strings(&out.prefixes), vec!["203.0.113.0/24"]);
    }

    #[test]
    fn test_family_filter() {
        let payload = br#"["203.0.113.0/24","2001:db8::/32"]"#;
        let out = normalize(payload, FamilyFilter::V6).unwrap();
        assert_eq!(strings(&out.prefixes), vec!["2001:db8::/32"]);
        assert_eq!(out.filtered, 1);
        assert_eq!(out.count(Family::V4), 0);
    }

    #[test]
    fn test_empty_result_is_error() {
        assert!(matches!(
            normalize(b"", FamilyFilter::Both),
            Err(SyncError::EmptyResultSet { dropped: 0 })
        ));
        assert!(matches!(
            normalize(b"[]", FamilyFilter::Both),
            Err(SyncError::EmptyResultSet { .. })
        ));
        assert!(matches!(
            normalize(br#"["bogus", "999.0.0.0/8"]"#, FamilyFilter::Both),
            Err(SyncError::EmptyResultSet { dropped: 2 })
        ));
    }

    #[test]
    fn test_filter_leaving_nothing_is_error() {
        let payload = br#"["203.0.113.0/24"]"#;
        assert!(matches!(
            normalize(payload, FamilyFilter::V6),
            Err(SyncError::EmptyResultSet { .. })
        ));
    }
}
