//! File-backed denylist: domains, IP literals and CIDR blocks.

use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::Result;

/// A loaded, read-once denylist.
///
/// A target matches if `domain_set` contains its hostname **or** `ip_set` contains its ip **or**
/// any CIDR contains its ip. Testing an IPv6 address against an IPv4 CIDR (or vice versa) is
/// simply `false` — it must never error.
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    domains: HashSet<String>,
    ips: HashSet<IpAddr>,
    cidrs: Vec<IpNetwork>,
}

impl Denylist {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load and classify every non-empty line of a UTF-8 denylist file. Invalid lines are
    /// silently dropped (logged at `debug!`, never an error).
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::error::Error::Denylist(path.display().to_string(), e))?;
        Ok(Self::parse(&contents))
    }

    /// Classify every non-empty line of denylist text.
    pub fn parse(contents: &str) -> Self {
        let mut list = Self::default();
        for raw_line in contents.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(cidr) = parse_cidr(line) {
                list.cidrs.push(cidr);
            } else if let Ok(ip) = line.parse::<IpAddr>() {
                list.ips.insert(ip);
            } else if is_valid_domain(line) {
                list.domains.insert(line.to_ascii_lowercase());
            } else {
                debug!("denylist: dropping unparseable line {:?}", line);
            }
        }
        list
    }

    /// Whether a parsed target matches this denylist.
    pub fn matches(&self, hostname: Option<&str>, ip: Option<IpAddr>) -> bool {
        if let Some(host) = hostname {
            if self.domains.contains(&host.to_ascii_lowercase()) {
                return true;
            }
        }
        if let Some(ip) = ip {
            if self.ips.contains(&ip) {
                return true;
            }
            if self.cidrs.iter().any(|cidr| cidr_contains(cidr, ip)) {
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.domains.len() + self.ips.len() + self.cidrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `IpNetwork::contains` already returns `false` across address families rather than panicking,
/// but we route through here so that guarantee is asserted in one place and covered by a test.
fn cidr_contains(cidr: &IpNetwork, ip: IpAddr) -> bool {
    match (cidr, ip) {
        (IpNetwork::V4(net), IpAddr::V4(addr)) => net.contains(addr),
        (IpNetwork::V6(net), IpAddr::V6(addr)) => net.contains(addr),
        _ => false,
    }
}

fn parse_cidr(line: &str) -> Option<IpNetwork> {
    if !line.contains('/') {
        return None;
    }
    match line.parse::<IpNetwork>() {
        Ok(net) => Some(net),
        Err(e) => {
            warn!("denylist: {:?} looked like a CIDR but failed to parse: {e}", line);
            None
        }
    }
}

/// Loose RFC 1035/1123 label validation: dot-separated labels of 1-63 alphanumeric-or-hyphen
/// characters, not starting or ending with a hyphen, total length under 253.
fn is_valid_domain(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_domain_ip_and_cidr_lines() {
        let list = Denylist::parse("blocked.example.com\n192.0.2.5\n203.0.113.0/24\n# comment\n\n");
        assert_eq!(list.len(), 3);
        assert!(list.matches(Some("blocked.example.com"), None));
        assert!(list.matches(None, Some("192.0.2.5".parse().unwrap())));
        assert!(list.matches(None, Some("203.0.113.42".parse().unwrap())));
        assert!(!list.matches(None, Some("203.0.114.1".parse().unwrap())));
    }

    #[test]
    fn invalid_lines_are_silently_dropped() {
        let list = Denylist::parse("not a domain!!\n...\n/32\n");
        assert!(list.is_empty());
    }

    #[test]
    fn ipv6_against_ipv4_cidr_is_false_not_error() {
        let list = Denylist::parse("203.0.113.0/24\n");
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(!list.matches(None, Some(v6)));
    }

    #[test]
    fn domain_matching_is_case_insensitive() {
        let list = Denylist::parse("Blocked.Example.COM\n");
        assert!(list.matches(Some("blocked.example.com"), None));
    }
}
