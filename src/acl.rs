use std::fmt;
use std::net::{IpAddr, SocketAddr};

use http::HeaderMap;
use tracing::warn;

/// Prefix carried by IPv4 addresses reported through a dual-stack socket
const MAPPED_IPV4_PREFIX: &str = "::ffff:";

/// Header consulted before the transport peer address
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// One segment of a wildcard pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Octet(u8),
    Any,
}

/// A single allow-list entry
///
/// Supported forms:
/// - `10.1.2.3` - Exact address match
/// - `192.168.1.*` - Per-octet wildcard, `*` stands for any octet 0-255
/// - `10.0.0.0/8` - CIDR range
///
/// Entries that cannot be parsed become [`AccessPattern::Invalid`] and never
/// match, so a typo can neither widen access nor empty the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPattern {
    Exact(String),
    Wildcard(Vec<Segment>),
    Cidr { network: u32, prefix_len: u8 },
    Invalid(String),
}

impl AccessPattern {
    /// Parse one trimmed configuration entry
    pub fn parse(text: &str) -> Self {
        let text = strip_mapped_prefix(text.trim());

        if let Some((network, prefix)) = text.split_once('/') {
            let network = parse_ipv4(network);
            let prefix_len = parse_prefix_len(prefix);
            return match (network, prefix_len) {
                (Some(network), Some(prefix_len)) => AccessPattern::Cidr {
                    network,
                    prefix_len,
                },
                _ => AccessPattern::Invalid(text.to_string()),
            };
        }

        if text.contains('*') {
            let segments: Option<Vec<Segment>> = text
                .split('.')
                .map(|segment| match segment {
                    "*" => Some(Segment::Any),
                    literal => parse_octet(literal).map(Segment::Octet),
                })
                .collect();
            return match segments {
                Some(segments) => AccessPattern::Wildcard(segments),
                None => AccessPattern::Invalid(text.to_string()),
            };
        }

        AccessPattern::Exact(text.to_string())
    }

    /// Check whether `ip` satisfies this pattern
    ///
    /// Never fails: anything that does not parse as an address is a no-match.
    pub fn matches(&self, ip: &str) -> bool {
        let ip = strip_mapped_prefix(ip.trim());
        match self {
            AccessPattern::Exact(expected) => ip == expected,
            AccessPattern::Wildcard(segments) => wildcard_matches(segments, ip),
            AccessPattern::Cidr {
                network,
                prefix_len,
            } => match parse_ipv4(ip) {
                Some(addr) => {
                    let (first, last) = cidr_bounds(*network, *prefix_len);
                    (first..=last).contains(&addr)
                }
                None => false,
            },
            AccessPattern::Invalid(_) => false,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, AccessPattern::Invalid(_))
    }
}

impl fmt::Display for AccessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessPattern::Exact(ip) => f.write_str(ip),
            AccessPattern::Wildcard(segments) => {
                for (i, segment) in segments.iter().enumerate() {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    match segment {
                        Segment::Octet(octet) => write!(f, "{}", octet)?,
                        Segment::Any => f.write_str("*")?,
                    }
                }
                Ok(())
            }
            AccessPattern::Cidr {
                network,
                prefix_len,
            } => write!(f, "{}/{}", std::net::Ipv4Addr::from(*network), prefix_len),
            AccessPattern::Invalid(text) => write!(f, "{} (invalid)", text),
        }
    }
}

fn wildcard_matches(segments: &[Segment], ip: &str) -> bool {
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != segments.len() {
        return false;
    }

    segments.iter().zip(octets).all(|(segment, octet)| {
        // Even a `*` position requires a well-formed octet
        match (segment, parse_octet(octet)) {
            (_, None) => false,
            (Segment::Any, Some(_)) => true,
            (Segment::Octet(expected), Some(actual)) => *expected == actual,
        }
    })
}

/// Inclusive `[first, last]` range covered by a CIDR block
fn cidr_bounds(network: u32, prefix_len: u8) -> (u32, u32) {
    let mask = match prefix_len {
        32 => u32::MAX,
        0 => 0,
        p => !((1u32 << (32 - u32::from(p))) - 1),
    };
    let first = network & mask;
    (first, first | !mask)
}

fn parse_octet(text: &str) -> Option<u8> {
    if text.is_empty() || text.len() > 3 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<u8>().ok()
}

fn parse_prefix_len(text: &str) -> Option<u8> {
    if text.is_empty() || text.len() > 2 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<u8>().ok().filter(|p| *p <= 32)
}

/// Convert a dotted-quad into a big-endian u32
fn parse_ipv4(text: &str) -> Option<u32> {
    let mut parts = text.split('.');
    let mut value = 0u32;
    for _ in 0..4 {
        let octet = parse_octet(parts.next()?)?;
        value = (value << 8) | u32::from(octet);
    }
    if parts.next().is_some() {
        return None;
    }
    Some(value)
}

/// Remove a leading `::ffff:` so dual-stack peers compare as plain IPv4
pub fn strip_mapped_prefix(ip: &str) -> &str {
    match ip.get(..MAPPED_IPV4_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(MAPPED_IPV4_PREFIX) => {
            &ip[MAPPED_IPV4_PREFIX.len()..]
        }
        _ => ip,
    }
}

/// Ordered allow-list built once from configuration
#[derive(Debug, Clone, Default)]
pub struct AccessControlList {
    patterns: Vec<AccessPattern>,
}

impl AccessControlList {
    pub fn new(patterns: Vec<AccessPattern>) -> Self {
        Self { patterns }
    }

    /// Build the list from a comma-separated `allowed_ips` string
    ///
    /// Blank entries are skipped. Unparseable entries are kept as never-matching
    /// patterns and reported once here.
    pub fn from_config(allowed_ips: &str) -> Self {
        let patterns: Vec<AccessPattern> = allowed_ips
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(AccessPattern::parse)
            .collect();

        for pattern in patterns.iter().filter(|p| !p.is_valid()) {
            warn!("Ignoring malformed allow-list entry: {}", pattern);
        }

        Self { patterns }
    }

    /// An empty list means the proxy is open to every client
    pub fn is_allowed(&self, ip: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[AccessPattern] {
        &self.patterns
    }
}

/// Determine the address the ACL is evaluated against
///
/// The first `X-Forwarded-For` entry wins over the socket peer. That header
/// is supplied by the client, so anyone able to set it can claim any address;
/// only deploy behind a proxy that overwrites it if that matters.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty());

    match forwarded {
        Some(first) => first.to_string(),
        None => peer_ip(peer),
    }
}

/// Peer address as text, with IPv4-mapped IPv6 collapsed to IPv4
pub fn peer_ip(peer: SocketAddr) -> String {
    match peer.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_parse_pattern_kinds() {
        assert_eq!(
            AccessPattern::parse("10.0.0.1"),
            AccessPattern::Exact("10.0.0.1".to_string())
        );
        assert_eq!(
            AccessPattern::parse("192.168.*.1"),
            AccessPattern::Wildcard(vec![
                Segment::Octet(192),
                Segment::Octet(168),
                Segment::Any,
                Segment::Octet(1),
            ])
        );
        assert_eq!(
            AccessPattern::parse("10.0.0.0/24"),
            AccessPattern::Cidr {
                network: 0x0a00_0000,
                prefix_len: 24
            }
        );
        assert!(!AccessPattern::parse("10.0.0.0/33").is_valid());
        assert!(!AccessPattern::parse("10.0.300.0/8").is_valid());
        assert!(!AccessPattern::parse("1.2.999.*").is_valid());
    }

    #[test]
    fn test_exact_match_is_not_substring() {
        let pattern = AccessPattern::parse("1.2.3.4");

        assert!(pattern.matches("1.2.3.4"));
        assert!(!pattern.matches("1.2.3.44"));
        assert!(!pattern.matches("11.2.3.4"));
    }

    #[test]
    fn test_exact_match_strips_mapped_prefix() {
        let pattern = AccessPattern::parse("127.0.0.1");
        assert!(pattern.matches("::ffff:127.0.0.1"));
        assert!(pattern.matches("::FFFF:127.0.0.1"));

        let mapped_pattern = AccessPattern::parse("::ffff:10.0.0.9");
        assert!(mapped_pattern.matches("10.0.0.9"));
    }

    #[test]
    fn test_wildcard_covers_last_octet() {
        let pattern = AccessPattern::parse("192.168.1.*");

        for last in 0..=255u16 {
            assert!(pattern.matches(&format!("192.168.1.{}", last)));
        }
        assert!(!pattern.matches("192.168.2.1"));
        assert!(!pattern.matches("10.168.1.1"));
        assert!(!pattern.matches("192.169.1.1"));
    }

    #[test]
    fn test_wildcard_rejects_invalid_octets() {
        let pattern = AccessPattern::parse("192.168.1.*");

        assert!(!pattern.matches("192.168.1.256"));
        assert!(!pattern.matches("192.168.1."));
        assert!(!pattern.matches("192.168.1.abc"));
        assert!(!pattern.matches("192.168.1.1.5"));
        assert!(!pattern.matches("192.168.1"));
    }

    #[test]
    fn test_cidr_ranges() {
        let pattern = AccessPattern::parse("10.0.0.0/24");

        assert!(pattern.matches("10.0.0.1"));
        assert!(pattern.matches("10.0.0.0"));
        assert!(pattern.matches("10.0.0.255"));
        assert!(!pattern.matches("10.0.1.1"));
        assert!(!pattern.matches("9.255.255.255"));
    }

    #[test]
    fn test_cidr_host_bits_are_masked() {
        let pattern = AccessPattern::parse("10.0.0.77/24");
        assert!(pattern.matches("10.0.0.1"));
        assert!(!pattern.matches("10.0.1.77"));
    }

    #[test]
    fn test_cidr_single_address_and_whole_space() {
        let single = AccessPattern::parse("172.16.5.4/32");
        assert!(single.matches("172.16.5.4"));
        assert!(!single.matches("172.16.5.5"));
        assert!(!single.matches("172.16.5.3"));

        let everything = AccessPattern::parse("0.0.0.0/0");
        assert!(everything.matches("8.8.8.8"));
        assert!(everything.matches("255.255.255.255"));
        assert!(!everything.matches("not-an-ip"));
    }

    #[test]
    fn test_malformed_cidr_never_matches() {
        for text in ["10.0.0.0/33", "10.0.0.0/", "10.0.0/8", "10.0.0.0/-1", "a.b.c.d/8"] {
            let pattern = AccessPattern::parse(text);
            assert!(!pattern.matches("10.0.0.1"), "{} should not match", text);
        }
    }

    #[test]
    fn test_cidr_rejects_garbage_ip() {
        let pattern = AccessPattern::parse("10.0.0.0/8");
        assert!(!pattern.matches(""));
        assert!(!pattern.matches("10.0.0"));
        assert!(!pattern.matches("10.0.0.1000"));
        assert!(!pattern.matches("fe80::1"));
    }

    #[test]
    fn test_empty_list_allows_anything() {
        let acl = AccessControlList::from_config("");

        assert!(acl.is_empty());
        assert!(acl.is_allowed("10.0.0.1"));
        assert!(acl.is_allowed("definitely not an ip"));
        assert!(acl.is_allowed(""));
    }

    #[test]
    fn test_blank_entries_are_skipped() {
        let acl = AccessControlList::from_config(" , ,10.0.0.1 ,");
        assert_eq!(acl.patterns().len(), 1);
        assert!(acl.is_allowed("10.0.0.1"));
        assert!(!acl.is_allowed("10.0.0.2"));
    }

    #[test]
    fn test_non_empty_list_rejects_unmatched() {
        let acl = AccessControlList::from_config("10.0.0.0/24, 192.168.1.*, 127.0.0.1");

        assert!(acl.is_allowed("10.0.0.5"));
        assert!(acl.is_allowed("192.168.1.77"));
        assert!(acl.is_allowed("127.0.0.1"));
        assert!(!acl.is_allowed("172.16.0.1"));
        assert!(!acl.is_allowed("garbage"));
    }

    #[test]
    fn test_invalid_entries_do_not_open_the_list() {
        let acl = AccessControlList::from_config("10.0.0.0/33");

        assert!(!acl.is_empty());
        assert!(!acl.is_allowed("10.0.0.1"));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static(" 10.0.0.5 , 172.16.0.1"),
        );
        let peer = SocketAddr::from((Ipv4Addr::new(172, 16, 0, 1), 40000));

        assert_eq!(client_ip(&headers, peer), "10.0.0.5");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let headers = HeaderMap::new();
        let mapped = Ipv4Addr::new(10, 0, 0, 9).to_ipv6_mapped();
        let peer = SocketAddr::from((mapped, 40000));
        assert_eq!(client_ip(&headers, peer), "10.0.0.9");

        let v6 = SocketAddr::from((Ipv6Addr::LOCALHOST, 40000));
        assert_eq!(client_ip(&headers, v6), "::1");

        let mut empty = HeaderMap::new();
        empty.insert(FORWARDED_FOR, HeaderValue::from_static("  "));
        let v4 = SocketAddr::from((Ipv4Addr::new(192, 168, 0, 2), 1));
        assert_eq!(client_ip(&empty, v4), "192.168.0.2");
    }

    #[test]
    fn test_display_round_trips_config_text() {
        assert_eq!(AccessPattern::parse("10.0.0.0/24").to_string(), "10.0.0.0/24");
        assert_eq!(AccessPattern::parse("192.168.*.*").to_string(), "192.168.*.*");
        assert_eq!(AccessPattern::parse("10.1.2.3").to_string(), "10.1.2.3");
    }
}
