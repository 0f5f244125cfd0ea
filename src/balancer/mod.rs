mod interfaces;

pub use interfaces::InterfaceBalancer;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::seq::SliceRandom;

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("no local address available (v4 usable: {v4}, v6 usable: {v6})")]
    Exhausted { v4: bool, v6: bool },
    #[error("enumerate interfaces: {0}")]
    Interfaces(#[from] io::Error),
}

/// Chooses the local address an outbound connection is bound to.
///
/// Called once per connection attempt, possibly from several runtime worker
/// threads at the same time.
pub trait Balancer: Sync + Send {
    /// `v4` and `v6` tell which families the destination can be reached on.
    fn next(&self, v4: bool, v6: bool) -> Result<IpAddr, BalancerError>;
}

/// Random pick from a fixed pool, preferring one family.
///
/// The pools never change after construction, so concurrent calls only share
/// read-only data.
pub struct FixedPoolBalancer {
    v4: Vec<Ipv4Addr>,
    v6: Vec<Ipv6Addr>,
    prefer_v6: bool,
}

impl FixedPoolBalancer {
    pub fn new(v4: Vec<Ipv4Addr>, v6: Vec<Ipv6Addr>, prefer_v6: bool) -> Self {
        Self { v4, v6, prefer_v6 }
    }

    fn pick_v4(&self) -> Option<IpAddr> {
        self.v4.choose(&mut rand::thread_rng()).map(|ip| IpAddr::V4(*ip))
    }

    fn pick_v6(&self) -> Option<IpAddr> {
        self.v6.choose(&mut rand::thread_rng()).map(|ip| IpAddr::V6(*ip))
    }
}

impl Balancer for FixedPoolBalancer {
    fn next(&self, v4: bool, v6: bool) -> Result<IpAddr, BalancerError> {
        let v4_pick = || if v4 { self.pick_v4() } else { None };
        let v6_pick = || if v6 { self.pick_v6() } else { None };

        let picked = if self.prefer_v6 {
            v6_pick().or_else(v4_pick)
        } else {
            v4_pick().or_else(v6_pick)
        };

        picked.ok_or(BalancerError::Exhausted { v4, v6 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a() -> Ipv4Addr {
        "203.0.113.10".parse().unwrap()
    }

    fn b() -> Ipv6Addr {
        "2001:db8::10".parse().unwrap()
    }

    #[test]
    fn single_v4_pool() {
        let balancer = FixedPoolBalancer::new(vec![a()], vec![], false);

        assert_eq!(balancer.next(true, false).unwrap(), IpAddr::V4(a()));
        assert_eq!(balancer.next(true, true).unwrap(), IpAddr::V4(a()));
        assert!(matches!(
            balancer.next(false, true),
            Err(BalancerError::Exhausted {
                v4: false,
                v6: true
            })
        ));
    }

    #[test]
    fn preferred_family_wins_when_usable() {
        let balancer = FixedPoolBalancer::new(vec![a()], vec![b()], true);

        assert_eq!(balancer.next(true, true).unwrap(), IpAddr::V6(b()));
        assert_eq!(balancer.next(true, false).unwrap(), IpAddr::V4(a()));

        let balancer = FixedPoolBalancer::new(vec![a()], vec![b()], false);
        assert_eq!(balancer.next(true, true).unwrap(), IpAddr::V4(a()));
        assert_eq!(balancer.next(false, true).unwrap(), IpAddr::V6(b()));
    }

    #[test]
    fn empty_preferred_pool_falls_back() {
        let balancer = FixedPoolBalancer::new(vec![a()], vec![], true);
        assert_eq!(balancer.next(true, true).unwrap(), IpAddr::V4(a()));
    }

    #[test]
    fn picks_stay_inside_the_pool() {
        let pool: Vec<Ipv4Addr> = (1..=4).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
        let balancer = FixedPoolBalancer::new(pool.clone(), vec![], false);

        for _ in 0..64 {
            match balancer.next(true, false).unwrap() {
                IpAddr::V4(ip) => assert!(pool.contains(&ip)),
                IpAddr::V6(ip) => panic!("unexpected {}", ip),
            }
        }
    }
}
