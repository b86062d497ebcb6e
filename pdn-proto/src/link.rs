use std::fmt;
use std::net::IpAddr;

/// Address families requested for a session
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Protocol {
    /// IPv4 only
    Ipv4,
    /// IPv6 only
    Ipv6,
    /// Dual stack, both families requested
    Ipv4v6,
}

impl Protocol {
    pub(crate) fn wants_v4(self) -> bool {
        matches!(self, Self::Ipv4 | Self::Ipv4v6)
    }

    pub(crate) fn wants_v6(self) -> bool {
        matches!(self, Self::Ipv6 | Self::Ipv4v6)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Ipv4 => "IP",
            Self::Ipv6 => "IPV6",
            Self::Ipv4v6 => "IPV4V6",
        })
    }
}

/// HTTP proxy configured locally for a session
///
/// The proxy is not part of transport-reported state; it survives
/// re-resolution by being copied from the prior snapshot.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HttpProxy {
    /// Proxy host name or literal address
    pub host: String,
    /// Proxy port
    pub port: u16,
}

/// Link configuration reported by the transport when a session comes up
#[derive(Debug, Clone, Default)]
pub struct LinkInfo {
    /// Network interface the session is bound to
    pub interface: String,
    /// Addresses assigned to the session
    pub addresses: Vec<IpAddr>,
    /// Gateway addresses
    pub gateways: Vec<IpAddr>,
    /// DNS servers, possibly empty or unusable
    pub dns: Vec<IpAddr>,
    /// Link MTU, if the transport reports one
    pub mtu: Option<u16>,
}

impl LinkInfo {
    /// Merge transport-reported configuration into a fresh link snapshot
    ///
    /// `fallback_dns` is used only when the transport supplied no usable DNS
    /// server. The HTTP proxy is carried over from `prior` because it is
    /// local configuration the transport knows nothing about.
    pub fn resolve(&self, fallback_dns: &[IpAddr], prior: &LinkProperties) -> LinkProperties {
        let mut dns: Vec<IpAddr> = self
            .dns
            .iter()
            .copied()
            .filter(|a| !a.is_unspecified())
            .collect();
        if dns.is_empty() {
            dns = fallback_dns.to_vec();
        }
        LinkProperties {
            interface: self.interface.clone(),
            addresses: self.addresses.clone(),
            routes: self.gateways.clone(),
            dns,
            http_proxy: prior.http_proxy.clone(),
            mtu: self.mtu,
        }
    }
}

/// Consistent snapshot of a session's link configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkProperties {
    /// Network interface the session is bound to
    pub interface: String,
    /// Addresses assigned to the session
    pub addresses: Vec<IpAddr>,
    /// Gateway addresses
    pub routes: Vec<IpAddr>,
    /// Resolved DNS servers
    pub dns: Vec<IpAddr>,
    /// Locally configured HTTP proxy, if any
    pub http_proxy: Option<HttpProxy>,
    /// Link MTU, if known
    pub mtu: Option<u16>,
}

impl LinkProperties {
    /// Whether any IPv4 address is present
    pub fn has_ipv4(&self) -> bool {
        self.addresses.iter().any(|a| a.is_ipv4())
    }

    /// Whether any IPv6 address is present
    pub fn has_ipv6(&self) -> bool {
        self.addresses.iter().any(|a| a.is_ipv6())
    }

    /// Whether the link carries any address at all
    pub fn has_address(&self) -> bool {
        !self.addresses.is_empty()
    }
}

/// Result of comparing obtained address families against the request
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DualStackOutcome {
    /// Every requested family is present
    Full,
    /// Exactly one of two requested families is present
    Partial {
        /// The family still missing, to be requested on the next retry
        pending: Protocol,
    },
    /// No requested family is present
    Neither,
}

impl DualStackOutcome {
    /// Classify the families present in `props` against `requested`
    ///
    /// Partial success only exists for dual-stack requests; a single-family
    /// request either got its family or it did not.
    pub fn evaluate(requested: Protocol, props: &LinkProperties) -> Self {
        let v4 = props.has_ipv4();
        let v6 = props.has_ipv6();
        match requested {
            Protocol::Ipv4v6 => match (v4, v6) {
                (true, true) => Self::Full,
                (true, false) => Self::Partial {
                    pending: Protocol::Ipv6,
                },
                (false, true) => Self::Partial {
                    pending: Protocol::Ipv4,
                },
                (false, false) => Self::Neither,
            },
            _ => {
                let got = (requested.wants_v4() && v4) || (requested.wants_v6() && v6);
                if got {
                    Self::Full
                } else {
                    Self::Neither
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn v6(last: u16) -> IpAddr {
        IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, last))
    }

    #[test]
    fn transport_dns_preferred_over_fallback() {
        let info = LinkInfo {
            interface: "rmnet0".into(),
            addresses: vec![v4(2)],
            gateways: vec![v4(1)],
            dns: vec![v4(53)],
            mtu: None,
        };
        let props = info.resolve(&[v4(8)], &LinkProperties::default());
        assert_eq!(props.dns, vec![v4(53)]);
    }

    #[test]
    fn fallback_dns_used_when_transport_dns_unusable() {
        let info = LinkInfo {
            dns: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            ..LinkInfo::default()
        };
        let props = info.resolve(&[v4(8), v4(9)], &LinkProperties::default());
        assert_eq!(props.dns, vec![v4(8), v4(9)]);
    }

    #[test]
    fn proxy_carried_over_from_prior_snapshot() {
        let prior = LinkProperties {
            http_proxy: Some(HttpProxy {
                host: "proxy.example".into(),
                port: 8080,
            }),
            ..LinkProperties::default()
        };
        let props = LinkInfo::default().resolve(&[], &prior);
        assert_eq!(props.http_proxy, prior.http_proxy);
    }

    #[test]
    fn dual_stack_partial_detection() {
        let mut props = LinkProperties {
            addresses: vec![v4(2)],
            ..LinkProperties::default()
        };
        assert_eq!(
            DualStackOutcome::evaluate(Protocol::Ipv4v6, &props),
            DualStackOutcome::Partial {
                pending: Protocol::Ipv6
            }
        );
        props.addresses.push(v6(1));
        assert_eq!(
            DualStackOutcome::evaluate(Protocol::Ipv4v6, &props),
            DualStackOutcome::Full
        );
        props.addresses.clear();
        assert_eq!(
            DualStackOutcome::evaluate(Protocol::Ipv4v6, &props),
            DualStackOutcome::Neither
        );
    }

    #[test]
    fn single_family_request_never_partial() {
        let props = LinkProperties {
            addresses: vec![v6(1)],
            ..LinkProperties::default()
        };
        assert_eq!(
            DualStackOutcome::evaluate(Protocol::Ipv6, &props),
            DualStackOutcome::Full
        );
        assert_eq!(
            DualStackOutcome::evaluate(Protocol::Ipv4, &props),
            DualStackOutcome::Neither
        );
    }
}
