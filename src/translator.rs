//! Prefix-to-rule translation.
//!
//! Produces the ordered list of source matchers to try for one prefix. The
//! reconciler installs the first one the backend accepts; anything past the
//! first is a degraded match and gets logged as such.

use ipnet::{IpNet, Ipv4Net};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::prefix::NetworkPrefix;

/// Source-address matcher as passed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceMatch {
    /// `addr/len`
    Cidr(IpNet),
    /// `addr/a.b.c.d`
    Masked { addr: Ipv4Addr, mask: Ipv4Addr },
    /// Bare address.
    Host(IpAddr),
}

impl SourceMatch {
    pub fn form(&self) -> MatchForm {
        match self {
            SourceMatch::Cidr(_) => MatchForm::Cidr,
            SourceMatch::Masked { .. } => MatchForm::DottedMask,
            SourceMatch::Host(_) => MatchForm::SingleHost,
        }
    }

    /// The network this matcher covers, if it is a contiguous prefix.
    pub fn network(&self) -> Option<IpNet> {
        match *self {
            SourceMatch::Cidr(net) => Some(net.trunc()),
            SourceMatch::Masked { addr, mask } => {
                let len = mask_to_prefix_len(mask)?;
                Ipv4Net::new(addr, len).ok().map(|n| IpNet::V4(n.trunc()))
            }
            SourceMatch::Host(addr) => Some(IpNet::from(addr)),
        }
    }

    /// Parse the `-s` argument as printed by the backend.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((addr, rest)) if rest.contains('.') => Some(SourceMatch::Masked {
                addr: addr.parse().ok()?,
                mask: rest.parse().ok()?,
            }),
            Some(_) => s.parse().ok().map(SourceMatch::Cidr),
            None => s.parse().ok().map(SourceMatch::Host),
        }
    }
}

impl fmt::Display for SourceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMatch::Cidr(net) => write!(f, "{}", net),
            SourceMatch::Masked { addr, mask } => write!(f, "{}/{}", addr, mask),
            SourceMatch::Host(addr) => write!(f, "{}", addr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchForm {
    Cidr,
    DottedMask,
    SingleHost,
}

impl MatchForm {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchForm::Cidr => "cidr",
            MatchForm::DottedMask => "dotted mask",
            MatchForm::SingleHost => "single host",
        }
    }
}

/// One insertion attempt for a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchAttempt {
    pub source: SourceMatch,
    /// Accepting this attempt matches fewer addresses than the prefix.
    pub lossy: bool,
}

/// Ordered insertion attempts for `prefix`.
///
/// IPv4: dotted mask, then CIDR, then the base address alone. IPv6: CIDR,
/// then the base address alone. Host prefixes need no fallback.
pub fn match_attempts(prefix: &NetworkPrefix) -> Vec<MatchAttempt> {
    let exact = |source| MatchAttempt {
        source,
        lossy: false,
    };

    let mut attempts = match prefix.as_ipnet() {
        IpNet::V4(net) => vec![
            exact(SourceMatch::Masked {
                addr: net.network(),
                mask: prefix_len_to_mask(net.prefix_len()),
            }),
            exact(SourceMatch::Cidr(prefix.as_ipnet())),
        ],
        IpNet::V6(_) => vec![exact(SourceMatch::Cidr(prefix.as_ipnet()))],
    };

    attempts.push(MatchAttempt {
        source: SourceMatch::Host(prefix.address()),
        lossy: !prefix.is_host(),
    });
    attempts
}

/// Expand an IPv4 prefix length into a dotted netmask.
///
/// Whole octets of 255 for `len / 8` octets, `256 - 2^(8 - len % 8)` for the
/// boundary octet, zeros after. Lengths above 32 saturate to /32.
pub fn prefix_len_to_mask(len: u8) -> Ipv4Addr {
    let len = len.min(32) as usize;
    let mut octets = [0u8; 4];
    for (i, octet) in octets.iter_mut().enumerate() {
        let start = i * 8;
        *octet = if len >= start + 8 {
            255
        } else if len > start {
            (256u16 - (1u16 << (8 - (len - start)))) as u8
        } else {
            0
        };
    }
    Ipv4Addr::from(octets)
}

/// Inverse of [`prefix_len_to_mask`]; `None` for non-contiguous masks.
pub fn mask_to_prefix_len(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let len = bits.leading_ones();
    (bits.checked_shl(len).unwrap_or(0) == 0).then_some(len as u8)
}
