//! Local address discovery for certificate SAN lists.
//!
//! The certificate issuer never talks to the operating system directly; it is
//! handed an [`AddressRegistry`] so tests can substitute a fixed address set.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// Source of host names and IP addresses that identify this machine.
pub trait AddressRegistry: Send + Sync {
    /// Returns every name or address clients may use to reach this host.
    fn local_addresses(&self) -> BTreeSet<String>;
}

/// Probe targets used to learn the primary outbound interface addresses.
///
/// Connecting a UDP socket sends no packets; it only selects a route.
const IPV4_PROBE: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9);
const IPV6_PROBE: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
    9,
);

/// Registry backed by the host's network configuration.
#[derive(Debug, Clone, Default)]
pub struct SystemAddressRegistry;

impl SystemAddressRegistry {
    /// Creates a new system registry.
    pub fn new() -> Self {
        Self
    }

    fn routed_address(bind: SocketAddr, probe: SocketAddr) -> Option<IpAddr> {
        let socket = UdpSocket::bind(bind).ok()?;
        socket.connect(probe).ok()?;
        let ip = socket.local_addr().ok()?.ip();
        (!ip.is_unspecified()).then_some(ip)
    }

    fn hostname() -> Option<String> {
        if let Ok(name) = std::env::var("HOSTNAME") {
            let name = name.trim().to_string();
            if !name.is_empty() {
                return Some(name);
            }
        }
        std::fs::read_to_string("/etc/hostname")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl AddressRegistry for SystemAddressRegistry {
    fn local_addresses(&self) -> BTreeSet<String> {
        let mut addresses: BTreeSet<String> = ["localhost", "127.0.0.1", "::1"]
            .into_iter()
            .map(String::from)
            .collect();

        let probes = [
            (SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), IPV4_PROBE),
            (SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)), IPV6_PROBE),
        ];
        for (bind, probe) in probes {
            if let Some(ip) = Self::routed_address(bind, probe) {
                addresses.insert(ip.to_string());
            }
        }

        if let Some(hostname) = Self::hostname() {
            addresses.insert(hostname);
        }

        tracing::debug!("Discovered local addresses: {:?}", addresses);
        addresses
    }
}

/// Registry returning a fixed set of addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressRegistry {
    addresses: BTreeSet<String>,
}

impl StaticAddressRegistry {
    /// Creates a registry that always reports `addresses`.
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }
}

impl AddressRegistry for StaticAddressRegistry {
    fn local_addresses(&self) -> BTreeSet<String> {
        self.addresses.clone()
    }
}

/// De-duplicated host/IP allow-list for HTTPS certificates.
///
/// Only ever grows: entries added during a server's lifetime are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedDomains {
    domains: BTreeSet<String>,
}

impl AllowedDomains {
    /// Creates an empty allow-list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds entries, ignoring blanks and normalising case.
    ///
    /// Returns true if the list grew.
    pub fn extend<I, S>(&mut self, entries: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let before = self.domains.len();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if !entry.is_empty() {
                self.domains.insert(entry.to_ascii_lowercase());
            }
        }
        self.domains.len() != before
    }

    /// Returns true if `domain` is in the list.
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(&domain.to_ascii_lowercase())
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Returns the entries in sorted order.
    pub fn to_vec(&self) -> Vec<String> {
        self.domains.iter().cloned().collect()
    }

    /// Iterates the entries in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.domains.iter()
    }
}
