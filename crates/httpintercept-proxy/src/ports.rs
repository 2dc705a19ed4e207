//! Port planning for dedicated and multiplexed listeners.
//!
//! A port present in both the HTTP and HTTPS sets is served by a multiplexer,
//! backed by two loopback-only shadow listeners:
//!
//! ```text
//! public :p ──► MultiplexListener ──┬─► 127.0.0.1:(p + http_offset)   HTTP
//!                                   └─► 127.0.0.1:(p + https_offset)  HTTPS
//! ```

use std::collections::{BTreeMap, BTreeSet};

use crate::config::InterceptConfig;
use crate::error::PortError;

/// Loopback backends of one multiplexed public port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowPorts {
    /// Loopback HTTP backend port.
    pub http: u16,
    /// Loopback HTTPS backend port.
    pub https: u16,
}

/// Which listeners must be bound for a configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortPlan {
    /// Public ports served directly by an HTTP listener.
    pub http: BTreeSet<u16>,
    /// Public ports served directly by an HTTPS listener.
    pub https: BTreeSet<u16>,
    /// Public multiplexed ports and their shadow backends.
    pub multiplexed: BTreeMap<u16, ShadowPorts>,
}

impl PortPlan {
    /// Computes and validates the plan for `config`.
    pub fn from_config(config: &InterceptConfig) -> Result<Self, PortError> {
        Self::compute(
            &config.http_ports,
            &config.https_ports,
            config.http_shadow_offset,
            config.https_shadow_offset,
        )
    }

    /// Splits the port sets into dedicated and multiplexed ports.
    pub fn compute(
        http_ports: &BTreeSet<u16>,
        https_ports: &BTreeSet<u16>,
        http_offset: u16,
        https_offset: u16,
    ) -> Result<Self, PortError> {
        if http_ports.is_empty() && https_ports.is_empty() {
            return Err(PortError::Empty);
        }
        if http_ports.contains(&0) || https_ports.contains(&0) {
            return Err(PortError::ZeroPort);
        }

        let shared: BTreeSet<u16> = http_ports.intersection(https_ports).copied().collect();
        if !shared.is_empty() && http_offset == https_offset {
            return Err(PortError::EqualOffsets(http_offset));
        }

        let mut multiplexed = BTreeMap::new();
        for &port in &shared {
            let shadow = |offset: u16| {
                port.checked_add(offset)
                    .ok_or(PortError::ShadowOverflow { port, offset })
            };
            multiplexed.insert(
                port,
                ShadowPorts {
                    http: shadow(http_offset)?,
                    https: shadow(https_offset)?,
                },
            );
        }

        let plan = Self {
            http: http_ports.difference(&shared).copied().collect(),
            https: https_ports.difference(&shared).copied().collect(),
            multiplexed,
        };
        plan.check_collisions()?;
        Ok(plan)
    }

    fn check_collisions(&self) -> Result<(), PortError> {
        let mut taken: BTreeSet<u16> = self.public_ports().collect();
        for (&port, shadow) in &self.multiplexed {
            for candidate in [shadow.http, shadow.https] {
                if !taken.insert(candidate) {
                    return Err(PortError::Collision {
                        port,
                        shadow: candidate,
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns true if any listener needs a server certificate.
    pub fn needs_tls(&self) -> bool {
        !self.https.is_empty() || !self.multiplexed.is_empty()
    }

    /// Iterates every port reachable from outside the host.
    pub fn public_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.http
            .iter()
            .chain(&self.https)
            .chain(self.multiplexed.keys())
            .copied()
    }

    /// Every port this plan binds, shadows included.
    pub fn all_ports(&self) -> BTreeSet<u16> {
        let mut ports: BTreeSet<u16> = self.public_ports().collect();
        for shadow in self.multiplexed.values() {
            ports.insert(shadow.http);
            ports.insert(shadow.https);
        }
        ports
    }
}

/// Fails if the process cannot bind some of `ports`.
pub fn check_port_privileges(ports: impl IntoIterator<Item = u16>) -> Result<(), PortError> {
    if is_privileged() {
        return Ok(());
    }

    let threshold = unprivileged_port_start();
    let denied: Vec<u16> = ports.into_iter().filter(|&p| p < threshold).collect();
    if denied.is_empty() {
        Ok(())
    } else {
        Err(PortError::InsufficientPrivileges { ports: denied })
    }
}

#[cfg(unix)]
fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_privileged() -> bool {
    true
}

/// Lowest port an unprivileged process may bind.
fn unprivileged_port_start() -> u16 {
    #[cfg(target_os = "linux")]
    {
        if let Some(start) = std::fs::read_to_string("/proc/sys/net/ipv4/ip_unprivileged_port_start")
            .ok()
            .and_then(|s| s.trim().parse::<u16>().ok())
        {
            return start;
        }
    }
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ports: &[u16]) -> BTreeSet<u16> {
        ports.iter().copied().collect()
    }

    #[test]
    fn shared_ports_are_multiplexed() {
        let plan = PortPlan::compute(&set(&[8080, 9000]), &set(&[8080]), 10000, 11000).unwrap();

        assert_eq!(plan.http, set(&[9000]));
        assert!(plan.https.is_empty());
        assert_eq!(
            plan.multiplexed.get(&8080),
            Some(&ShadowPorts {
                http: 18080,
                https: 19080
            })
        );
        assert_eq!(plan.all_ports(), set(&[8080, 9000, 18080, 19080]));
        assert!(plan.needs_tls());
    }

    #[test]
    fn every_shared_port_gets_exact_offsets() {
        let ports = set(&[1000, 2000, 3000, 4000]);
        let plan = PortPlan::compute(&ports, &ports, 10000, 11000).unwrap();
        for p in ports {
            let shadow = plan.multiplexed[&p];
            assert_eq!(shadow.http, p + 10000);
            assert_eq!(shadow.https, p + 11000);
            assert!(!plan.http.contains(&p));
            assert!(!plan.https.contains(&p));
        }
    }

    #[test]
    fn plain_http_needs_no_tls() {
        let plan = PortPlan::compute(&set(&[80]), &BTreeSet::new(), 10000, 11000).unwrap();
        assert!(!plan.needs_tls());
        assert!(plan.multiplexed.is_empty());
    }

    #[test]
    fn overflowing_shadow_rejected() {
        let err = PortPlan::compute(&set(&[60000]), &set(&[60000]), 10000, 11000).unwrap_err();
        assert_eq!(
            err,
            PortError::ShadowOverflow {
                port: 60000,
                offset: 10000
            }
        );
    }

    #[test]
    fn dedicated_port_overflow_is_fine() {
        // Only multiplexed ports get shadows.
        assert!(PortPlan::compute(&set(&[60000]), &set(&[443]), 10000, 11000).is_ok());
    }

    #[test]
    fn shadow_collision_with_public_port() {
        let err =
            PortPlan::compute(&set(&[8080, 18080]), &set(&[8080]), 10000, 11000).unwrap_err();
        assert_eq!(
            err,
            PortError::Collision {
                port: 8080,
                shadow: 18080
            }
        );
    }

    #[test]
    fn shadow_collision_between_multiplexed_ports() {
        // 9080 + 10000 == 8080 + 11000
        let ports = set(&[8080, 9080]);
        let err = PortPlan::compute(&ports, &ports, 10000, 11000).unwrap_err();
        assert!(matches!(err, PortError::Collision { .. }));
    }

    #[test]
    fn invalid_sets_rejected() {
        let empty = BTreeSet::new();
        assert_eq!(
            PortPlan::compute(&empty, &empty, 10000, 11000),
            Err(PortError::Empty)
        );
        assert_eq!(
            PortPlan::compute(&set(&[0]), &empty, 10000, 11000),
            Err(PortError::ZeroPort)
        );
        assert_eq!(
            PortPlan::compute(&set(&[80]), &set(&[80]), 500, 500),
            Err(PortError::EqualOffsets(500))
        );
    }

    #[test]
    fn high_ports_never_need_privileges() {
        assert!(check_port_privileges([1024, 8080, 65535]).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn low_ports_need_privileges_unless_root() {
        let result = check_port_privileges([80]);
        if is_privileged() || unprivileged_port_start() <= 80 {
            assert!(result.is_ok());
        } else {
            assert_eq!(
                result,
                Err(PortError::InsufficientPrivileges { ports: vec![80] })
            );
        }
    }
}
