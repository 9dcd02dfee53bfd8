//! Network eligibility: local IPv4 addresses against a configured allow-list
//!
//! An allow-list is a comma-separated list of patterns. Each pattern is
//! either a CIDR range (`10.0.0.0/24`) or a dotted address that may use `*`
//! wildcards (`192.168.1.*`, `10.0.*`, `172.16.1*`). The host is eligible
//! when any non-loopback IPv4 address matches any pattern.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// A CIDR range: base address plus prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    base: Ipv4Addr,
    prefix: u8,
}

impl CidrRange {
    /// Create a range, rejecting prefix lengths above 32
    pub fn new(base: Ipv4Addr, prefix: u8) -> Option<Self> {
        (prefix <= 32).then_some(Self { base, prefix })
    }

    /// Mask with the top `prefix` bits set
    pub fn mask(&self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p)),
        }
    }

    /// Whether `addr` shares the top `prefix` bits with the base address
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.mask();
        (u32::from(addr) & mask) == (u32::from(self.base) & mask)
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

/// One dotted segment of a wildcard pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Octet text must match exactly
    Exact(String),
    /// Octet text must start with the prefix (`1*`, or `*` for any)
    Prefix(String),
}

impl Segment {
    fn matches(&self, octet: &str) -> bool {
        match self {
            Segment::Exact(text) => octet == text,
            Segment::Prefix(prefix) => octet.starts_with(prefix.as_str()),
        }
    }
}

/// A dotted IPv4 pattern with optional `*` wildcards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl WildcardPattern {
    /// Whether `addr` matches the pattern octet by octet
    ///
    /// A pattern shorter than four segments must end in a wildcard, which
    /// then also swallows the remaining octets.
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        let octets: Vec<String> = addr.octets().iter().map(u8::to_string).collect();

        for (i, segment) in self.segments.iter().enumerate() {
            if !segment.matches(&octets[i]) {
                return false;
            }
        }

        self.segments.len() == 4 || matches!(self.segments.last(), Some(Segment::Prefix(_)))
    }
}

impl fmt::Display for WildcardPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One allow-list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowPattern {
    /// Exact or wildcard dotted address
    Wildcard(WildcardPattern),
    /// CIDR range
    Cidr(CidrRange),
}

impl AllowPattern {
    /// Whether `addr` is permitted by this entry
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        match self {
            AllowPattern::Wildcard(pattern) => pattern.matches(addr),
            AllowPattern::Cidr(range) => range.contains(addr),
        }
    }
}

impl fmt::Display for AllowPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowPattern::Wildcard(pattern) => fmt::Display::fmt(pattern, f),
            AllowPattern::Cidr(range) => fmt::Display::fmt(range, f),
        }
    }
}

/// Why an allow-list entry was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternError {
    pub pattern: String,
    pub reason: &'static str,
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid allow-list entry {:?}: {}", self.pattern, self.reason)
    }
}

impl std::error::Error for PatternError {}

impl FromStr for AllowPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let reject = |reason| PatternError {
            pattern: raw.to_string(),
            reason,
        };

        if raw.is_empty() {
            return Err(reject("empty entry"));
        }

        if let Some((base, bits)) = raw.split_once('/') {
            let base: Ipv4Addr = base.trim().parse().map_err(|_| reject("bad base address"))?;
            let prefix: u8 = bits
                .trim()
                .parse()
                .map_err(|_| reject("prefix length is not a number"))?;
            return CidrRange::new(base, prefix)
                .map(AllowPattern::Cidr)
                .ok_or_else(|| reject("prefix length out of range 0-32"));
        }

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() > 4 {
            return Err(reject("more than four segments"));
        }

        let mut segments = Vec::with_capacity(parts.len());
        for part in &parts {
            let (digits, wildcard) = match part.strip_suffix('*') {
                Some(prefix) => (prefix, true),
                None => (*part, false),
            };
            if !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(reject("segment is not numeric"));
            }
            if wildcard {
                segments.push(Segment::Prefix(digits.to_string()));
            } else {
                if digits.is_empty() || digits.parse::<u8>().is_err() {
                    return Err(reject("segment is not an octet"));
                }
                segments.push(Segment::Exact(digits.to_string()));
            }
        }

        if segments.len() < 4 && !matches!(segments.last(), Some(Segment::Prefix(_))) {
            return Err(reject("fewer than four segments without a trailing wildcard"));
        }

        Ok(AllowPattern::Wildcard(WildcardPattern {
            raw: raw.to_string(),
            segments,
        }))
    }
}

/// Parsed allow-list, in configuration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    patterns: Vec<AllowPattern>,
}

impl AllowList {
    /// Parse a comma-separated allow-list
    ///
    /// Malformed entries are logged and dropped; they never match and never
    /// invalidate the remaining entries.
    pub fn parse(raw: &str) -> Self {
        let patterns = raw
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .filter_map(|entry| match entry.parse::<AllowPattern>() {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!("Ignoring {}", e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Usable patterns
    pub fn patterns(&self) -> &[AllowPattern] {
        &self.patterns
    }

    /// Check if no usable pattern survived parsing
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First pattern permitting `addr`
    pub fn matching(&self, addr: Ipv4Addr) -> Option<&AllowPattern> {
        self.patterns.iter().find(|p| p.matches(addr))
    }

    /// First `(address, pattern)` pair that matches
    pub fn first_match<'a>(
        &'a self,
        addrs: &[Ipv4Addr],
    ) -> Option<(Ipv4Addr, &'a AllowPattern)> {
        addrs
            .iter()
            .find_map(|addr| self.matching(*addr).map(|p| (*addr, p)))
    }
}

/// Outcome of an eligibility check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    /// `address` matched `pattern`
    Eligible {
        address: Ipv4Addr,
        pattern: AllowPattern,
    },
    /// No local address matched; the addresses inspected are listed
    Ineligible { addresses: Vec<Ipv4Addr> },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible { .. })
    }
}

/// Evaluate the allow-list against a given set of addresses
pub fn evaluate(allow_list: &AllowList, addrs: &[Ipv4Addr]) -> Eligibility {
    match allow_list.first_match(addrs) {
        Some((address, pattern)) => Eligibility::Eligible {
            address,
            pattern: pattern.clone(),
        },
        None => Eligibility::Ineligible {
            addresses: addrs.to_vec(),
        },
    }
}

/// Evaluate the allow-list against this host's interfaces
pub fn check_eligibility(allow_list: &AllowList) -> Eligibility {
    let addrs = local_ipv4_addrs();
    tracing::debug!("Local IPv4 addresses: {:?}", addrs);
    evaluate(allow_list, &addrs)
}

/// IPv4 addresses bound to non-loopback interfaces
///
/// Enumeration failures are logged and yield an empty list.
#[cfg(unix)]
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut addrs = Vec::new();
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();

    unsafe {
        if libc::getifaddrs(&mut ifap) != 0 {
            tracing::warn!(
                "Failed to enumerate network interfaces: {}",
                std::io::Error::last_os_error()
            );
            return addrs;
        }

        let mut cursor = ifap;
        while let Some(ifa) = cursor.as_ref() {
            cursor = ifa.ifa_next;

            if ifa.ifa_addr.is_null()
                || i32::from((*ifa.ifa_addr).sa_family) != libc::AF_INET
                || ifa.ifa_flags & (libc::IFF_LOOPBACK as libc::c_uint) != 0
            {
                continue;
            }

            let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
            let addr = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            if !addr.is_loopback() && !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }

        libc::freeifaddrs(ifap);
    }

    addrs
}

/// IPv4 addresses bound to non-loopback adapters that are up
///
/// Enumeration failures are logged and yield an empty list.
#[cfg(windows)]
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    use windows_sys::Win32::Foundation::{ERROR_BUFFER_OVERFLOW, ERROR_SUCCESS};
    use windows_sys::Win32::NetworkManagement::IpHelper::{
        GetAdaptersAddresses, GAA_FLAG_SKIP_ANYCAST, GAA_FLAG_SKIP_DNS_SERVER,
        GAA_FLAG_SKIP_MULTICAST, IF_TYPE_SOFTWARE_LOOPBACK, IP_ADAPTER_ADDRESSES_LH,
    };
    use windows_sys::Win32::NetworkManagement::Ndis::IfOperStatusUp;
    use windows_sys::Win32::Networking::WinSock::{AF_INET, SOCKADDR_IN};

    let flags = GAA_FLAG_SKIP_ANYCAST | GAA_FLAG_SKIP_MULTICAST | GAA_FLAG_SKIP_DNS_SERVER;
    let mut addrs = Vec::new();

    // The required size can grow between calls when adapters change
    let mut size: u32 = 16 * 1024;
    let mut buffer: Vec<u64> = Vec::new();
    let mut result = ERROR_BUFFER_OVERFLOW;
    for _ in 0..3 {
        buffer = vec![0u64; (size as usize).div_ceil(8)];
        result = unsafe {
            GetAdaptersAddresses(
                u32::from(AF_INET),
                flags,
                std::ptr::null(),
                buffer.as_mut_ptr().cast::<IP_ADAPTER_ADDRESSES_LH>(),
                &mut size,
            )
        };
        if result != ERROR_BUFFER_OVERFLOW {
            break;
        }
    }

    if result != ERROR_SUCCESS {
        tracing::warn!(
            "Failed to enumerate network adapters: {}",
            std::io::Error::from_raw_os_error(result as i32)
        );
        return addrs;
    }

    unsafe {
        let mut adapter = buffer.as_ptr().cast::<IP_ADAPTER_ADDRESSES_LH>();
        while let Some(a) = adapter.as_ref() {
            adapter = a.Next;

            if a.IfType == IF_TYPE_SOFTWARE_LOOPBACK || a.OperStatus != IfOperStatusUp {
                continue;
            }

            let mut unicast = a.FirstUnicastAddress;
            while let Some(u) = unicast.as_ref() {
                unicast = u.Next;

                let sockaddr = u.Address.lpSockaddr;
                if sockaddr.is_null() || (*sockaddr).sa_family != AF_INET {
                    continue;
                }

                let sin = &*(sockaddr as *const SOCKADDR_IN);
                let addr = Ipv4Addr::from(sin.sin_addr.S_un.S_addr.to_ne_bytes());
                if !addr.is_loopback() && !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
    }

    addrs
}

#[cfg(not(any(unix, windows)))]
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    tracing::warn!("Interface enumeration is not supported on this platform");
    Vec::new()
}
