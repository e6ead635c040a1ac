//! Network prefixes and the tags used to request them.
//!
//! A [`NetworkPrefix`] is always stored in canonical form: host bits cleared,
//! IPv4 octets without leading zeros, IPv6 in compressed lowercase. Two
//! prefixes compare equal exactly when their canonical forms do.

use anyhow::{bail, Context, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family of a prefix or of a firewall table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::V4 => "v4",
            Family::V6 => "v6",
        }
    }

    /// Longest valid prefix length for this family.
    pub fn max_prefix_len(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which families a protected port whitelists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyFilter {
    V4,
    V6,
    #[default]
    Both,
}

impl FamilyFilter {
    pub fn includes(self, family: Family) -> bool {
        match self {
            FamilyFilter::V4 => family == Family::V4,
            FamilyFilter::V6 => family == Family::V6,
            FamilyFilter::Both => true,
        }
    }

    /// Families covered by this filter, v4 first.
    pub fn families(self) -> Vec<Family> {
        [Family::V4, Family::V6]
            .into_iter()
            .filter(|f| self.includes(*f))
            .collect()
    }

    /// Value of the `version` query parameter, if any.
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            FamilyFilter::V4 => Some("v4"),
            FamilyFilter::V6 => Some("v6"),
            FamilyFilter::Both => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FamilyFilter::V4 => "v4",
            FamilyFilter::V6 => "v6",
            FamilyFilter::Both => "both",
        }
    }
}

impl fmt::Display for FamilyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FamilyFilter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v4" | "ipv4" | "4" => Ok(FamilyFilter::V4),
            "v6" | "ipv6" | "6" => Ok(FamilyFilter::V6),
            "both" | "all" => Ok(FamilyFilter::Both),
            other => Err(format!("Invalid address family '{}'. Valid values: v4, v6", other)),
        }
    }
}

/// Partition of the published edge-node list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Area {
    #[default]
    Global,
    MainlandChina,
    Overseas,
}

impl Area {
    pub fn as_str(self) -> &'static str {
        match self {
            Area::Global => "global",
            Area::MainlandChina => "mainland-china",
            Area::Overseas => "overseas",
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Area {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Area::Global),
            "mainland-china" | "mainland_china" | "mainland" => Ok(Area::MainlandChina),
            "overseas" => Ok(Area::Overseas),
            other => Err(format!(
                "Invalid area '{}'. Valid values: global, mainland-china, overseas",
                other
            )),
        }
    }
}

/// A validated, canonical network prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkPrefix(IpNet);

impl NetworkPrefix {
    /// Build from any `IpNet`; host bits are cleared.
    pub fn new(net: IpNet) -> Self {
        Self(net.trunc())
    }

    pub fn family(&self) -> Family {
        match self.0 {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }

    /// Base (network) address.
    pub fn address(&self) -> IpAddr {
        self.0.network()
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    pub fn as_ipnet(&self) -> IpNet {
        self.0
    }

    /// True for /32 and /128 prefixes.
    pub fn is_host(&self) -> bool {
        self.prefix_len() == self.family().max_prefix_len()
    }
}

impl fmt::Display for NetworkPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<IpNet> for NetworkPrefix {
    fn from(net: IpNet) -> Self {
        Self::new(net)
    }
}

impl FromStr for NetworkPrefix {
    type Err = anyhow::Error;

    /// Parse `addr` or `addr/len`. A bare address becomes a host prefix.
    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim();
        let (addr_part, len_part) = match token.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (token, None),
        };

        let prefix_len = match len_part {
            Some(len) => {
                if len.is_empty() || len.len() > 3 || !len.bytes().all(|b| b.is_ascii_digit()) {
                    bail!("Invalid prefix length in '{}'", token);
                }
                Some(len.parse::<u8>().with_context(|| format!("Invalid prefix length in '{}'", token))?)
            }
            None => None,
        };

        let net = if let Some(v4) = parse_ipv4_lenient(addr_part) {
            let len = prefix_len.unwrap_or(32);
            IpNet::V4(Ipv4Net::new(v4, len).with_context(|| format!("Invalid IPv4 prefix '{}'", token))?)
        } else if let Ok(v6) = addr_part.parse::<Ipv6Addr>() {
            let len = prefix_len.unwrap_or(128);
            IpNet::V6(Ipv6Net::new(v6, len).with_context(|| format!("Invalid IPv6 prefix '{}'", token))?)
        } else {
            bail!("Invalid address '{}'", token);
        };

        Ok(Self::new(net))
    }
}

/// Parse a dotted quad, tolerating leading zeros in octets (`010.0.0.1`).
fn parse_ipv4_lenient(s: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in s.split('.') {
        if count == 4 || part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value: u16 = part.parse().ok()?;
        octets[count] = u8::try_from(value).ok()?;
        count += 1;
    }
    (count == 4).then(|| Ipv4Addr::from(octets))
}
