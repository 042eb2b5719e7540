use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// An immutable socket address, tagged by family, with v6 link-local scope
/// resolution baked into construction instead of left to the caller.
#[derive(Debug, Clone, Copy)]
pub enum Address {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl Address {
    /// Parses `text` as an IP literal and pairs it with `port`.
    ///
    /// A `:` anywhere in `text` is taken to mean IPv6 — there is no bracket
    /// notation and no attempt to disambiguate a bare IPv4 address from a
    /// malformed IPv6 one. If the resulting address is link-local
    /// (`fe80::/10`), the interface scope id is resolved by enumerating
    /// local interfaces and matching `text`'s numeric form against each
    /// interface's IPv6 address; the first match wins. No match leaves the
    /// scope id at 0.
    pub fn parse(text: &str, port: u16) -> eyre::Result<Self> {
        if text.contains(':') {
            let ip: Ipv6Addr = text
                .parse()
                .map_err(|e| eyre::eyre!("invalid IPv6 address {text:?}: {e}"))?;
            let scope = if is_linklocal(&ip) {
                resolve_v6_scope(&ip)
            } else {
                0
            };
            Ok(Address::V6(SocketAddrV6::new(ip, port, 0, scope)))
        } else {
            let ip: Ipv4Addr = text
                .parse()
                .map_err(|e| eyre::eyre!("invalid IPv4 address {text:?}: {e}"))?;
            Ok(Address::V4(SocketAddrV4::new(ip, port)))
        }
    }

    /// The wildcard address (`0.0.0.0` or `::0`, port 0) in the given family.
    pub fn unspecified(v6: bool) -> Self {
        if v6 {
            Address::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0))
        } else {
            Address::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        }
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, Address::V6(_))
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::V4(a) => a.port(),
            Address::V6(a) => a.port(),
        }
    }

    /// Canonical numeric text of the IP, with no interface suffix.
    pub fn ip_text(&self) -> String {
        match self {
            Address::V4(a) => a.ip().to_string(),
            Address::V6(a) => a.ip().to_string(),
        }
    }

    pub fn to_std(self) -> SocketAddr {
        self.into()
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => Address::V4(a),
            SocketAddr::V6(a) => Address::V6(a),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        match addr {
            Address::V4(a) => SocketAddr::V4(a),
            Address::V6(a) => SocketAddr::V6(a),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(a) => write!(f, "{a}"),
            Address::V6(a) => write!(f, "{}:{}", a.ip(), a.port()),
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Address::V4(a), Address::V4(b)) => a == b,
            (Address::V6(a), Address::V6(b)) => {
                a.ip() == b.ip() && a.port() == b.port() && a.scope_id() == b.scope_id()
            }
            _ => false,
        }
    }
}

impl Eq for Address {}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Address::V4(a) => {
                0u8.hash(state);
                a.ip().hash(state);
                a.port().hash(state);
            }
            Address::V6(a) => {
                1u8.hash(state);
                a.ip().hash(state);
                a.port().hash(state);
                a.scope_id().hash(state);
            }
        }
    }
}

/// Mirrors `IN6_IS_ADDR_LINKLOCAL`: high byte `0xfe`, next byte's top two bits `10`.
fn is_linklocal(ip: &Ipv6Addr) -> bool {
    let o = ip.octets();
    o[0] == 0xfe && (o[1] & 0xc0) == 0x80
}

/// Enumerates local interfaces looking for one whose IPv6 address matches
/// `ip`'s numeric text; returns its interface index, or 0 if none match.
fn resolve_v6_scope(ip: &Ipv6Addr) -> u32 {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return 0;
    };
    for iface in interfaces {
        if let std::net::IpAddr::V6(candidate) = iface.ip() {
            if &candidate == ip {
                return iface.index.unwrap_or(0);
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_v4_has_no_colon() {
        let a = Address::parse("127.0.0.1", 5000).unwrap();
        assert!(!a.is_v6());
        assert_eq!(a.port(), 5000);
        assert_eq!(a.ip_text(), "127.0.0.1");
    }

    #[test]
    fn parse_v6_discriminated_by_colon() {
        let a = Address::parse("::1", 5001).unwrap();
        assert!(a.is_v6());
        assert_eq!(a.port(), 5001);
    }

    #[test]
    fn loopback_v6_has_zero_scope() {
        let a = Address::parse("::1", 0).unwrap();
        match a {
            Address::V6(sa) => assert_eq!(sa.scope_id(), 0),
            Address::V4(_) => panic!("expected v6"),
        }
    }

    #[test]
    fn equality_ignores_nothing_for_v4() {
        let a = Address::parse("10.0.0.1", 1).unwrap();
        let b = Address::parse("10.0.0.1", 1).unwrap();
        let c = Address::parse("10.0.0.1", 2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unspecified_matches_family() {
        assert!(Address::unspecified(true).is_v6());
        assert!(!Address::unspecified(false).is_v6());
    }
}
