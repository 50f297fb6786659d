//! Per-instance host allow/deny evaluation.
//!
//! Lists are comma-separated IP literals or CIDR blocks. Semantics are
//! set-based: any deny match rejects, an empty allow list accepts, any allow
//! match accepts, otherwise reject.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPattern {
    V4 { network: Ipv4Addr, prefix: u8 },
    V6 { network: Ipv6Addr, prefix: u8 },
}

impl HostPattern {
    /// Parses an IP literal or a CIDR block. Returns `None` for anything
    /// else; unparseable entries never match.
    pub fn parse(token: &str) -> Option<HostPattern> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        let (addr, prefix) = match token.split_once('/') {
            Some((addr, mask)) => (addr, Some(mask.parse::<u8>().ok()?)),
            None => (token, None),
        };
        if let Ok(v4) = addr.parse::<Ipv4Addr>() {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return None;
            }
            return Some(HostPattern::V4 {
                network: mask_v4(v4, prefix),
                prefix,
            });
        }
        if let Ok(v6) = addr.parse::<Ipv6Addr>() {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return None;
            }
            return Some(HostPattern::V6 {
                network: mask_v6(v6, prefix),
                prefix,
            });
        }
        None
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (HostPattern::V4 { network, prefix }, IpAddr::V4(candidate)) => {
                mask_v4(candidate, *prefix) == *network
            }
            (HostPattern::V6 { network, prefix }, IpAddr::V6(candidate)) => {
                mask_v6(candidate, *prefix) == *network
            }
            _ => false,
        }
    }
}

fn mask_v4(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    if prefix == 0 {
        return Ipv4Addr::UNSPECIFIED;
    }
    let shift = 32 - u32::from(prefix);
    let mask = u32::MAX.checked_shl(shift).unwrap_or(0);
    Ipv4Addr::from(u32::from(addr) & mask)
}

fn mask_v6(addr: Ipv6Addr, prefix: u8) -> Ipv6Addr {
    if prefix == 0 {
        return Ipv6Addr::UNSPECIFIED;
    }
    let shift = 128 - u32::from(prefix);
    let mask = u128::MAX.checked_shl(shift).unwrap_or(0);
    Ipv6Addr::from(u128::from(addr) & mask)
}

fn parse_list(list: &str) -> Vec<HostPattern> {
    list.split(',').filter_map(HostPattern::parse).collect()
}

pub fn check_access(addr: IpAddr, allow: &str, deny: &str) -> bool {
    if parse_list(deny).iter().any(|p| p.matches(addr)) {
        return false;
    }
    let allows = parse_list(allow);
    if allows.is_empty() {
        return true;
    }
    allows.iter().any(|p| p.matches(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_lists_accept_everyone() {
        assert!(check_access(ip("203.0.113.9"), "", ""));
    }

    #[test]
    fn deny_wins_over_allow() {
        assert!(!check_access(ip("10.1.2.3"), "10.0.0.0/8", "10.1.2.3"));
    }

    #[test]
    fn non_empty_allow_defaults_to_reject() {
        assert!(check_access(ip("10.1.2.3"), "10.0.0.0/8", ""));
        assert!(!check_access(ip("192.168.1.1"), "10.0.0.0/8", ""));
    }

    #[test]
    fn exact_literal_matches_one_host() {
        assert!(check_access(ip("192.168.1.7"), "192.168.1.7", ""));
        assert!(!check_access(ip("192.168.1.8"), "192.168.1.7", ""));
    }

    #[test]
    fn cidr_boundaries() {
        let pat = HostPattern::parse("192.168.4.0/22").unwrap();
        assert!(pat.matches(ip("192.168.4.1")));
        assert!(pat.matches(ip("192.168.7.255")));
        assert!(!pat.matches(ip("192.168.8.0")));
    }

    #[test]
    fn zero_prefix_matches_all_of_family() {
        let pat = HostPattern::parse("0.0.0.0/0").unwrap();
        assert!(pat.matches(ip("8.8.8.8")));
        assert!(!pat.matches(ip("::1")));
    }

    #[test]
    fn ipv6_literals_and_blocks() {
        assert!(check_access(ip("fd00::1"), "fd00::/8", ""));
        assert!(!check_access(ip("2001:db8::1"), "fd00::/8", ""));
    }

    #[test]
    fn unparseable_entries_never_match() {
        assert!(HostPattern::parse("not-an-ip").is_none());
        assert!(HostPattern::parse("10.0.0.0/99").is_none());
        // Garbage in the deny list does not lock anyone out.
        assert!(check_access(ip("10.0.0.1"), "", "bogus,entries"));
    }

    #[test]
    fn whitespace_around_entries_tolerated() {
        assert!(check_access(ip("10.0.0.1"), " 10.0.0.0/8 , 172.16.0.0/12 ", ""));
    }
}
