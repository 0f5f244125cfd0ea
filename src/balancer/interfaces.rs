use std::io;
use std::net::{IpAddr, Ipv6Addr};

use log::debug;
use rand::seq::SliceRandom;
use regex::Regex;

use super::{Balancer, BalancerError};

/// Random pick among the addresses currently assigned to the interfaces whose
/// name matches a pattern. The interface list is read again on every call, so
/// addresses added or removed at runtime are picked up.
pub struct InterfaceBalancer {
    pattern: Regex,
}

impl InterfaceBalancer {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }

    fn candidates(&self, v4: bool, v6: bool) -> io::Result<Vec<IpAddr>> {
        let addrs = interface_addresses()?
            .into_iter()
            .filter(|addr| self.pattern.is_match(&addr.name))
            .map(|addr| addr.ip)
            .filter(|ip| usable(ip, v4, v6))
            .collect();
        Ok(addrs)
    }
}

impl Balancer for InterfaceBalancer {
    fn next(&self, v4: bool, v6: bool) -> Result<IpAddr, BalancerError> {
        let candidates = self.candidates(v4, v6)?;
        debug!("interface candidates: {:?}", candidates);

        candidates
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or(BalancerError::Exhausted { v4, v6 })
    }
}

fn usable(ip: &IpAddr, v4: bool, v6: bool) -> bool {
    if ip.is_unspecified() || ip.is_loopback() {
        return false;
    }

    match ip {
        IpAddr::V4(ip) => v4 && !ip.is_link_local(),
        IpAddr::V6(ip) => v6 && !is_unicast_link_local(ip),
    }
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

struct InterfaceAddress {
    name: String,
    ip: IpAddr,
}

/// Addresses of all interfaces that are up.
#[cfg(unix)]
fn interface_addresses() -> io::Result<Vec<InterfaceAddress>> {
    use std::ffi::CStr;
    use std::net::Ipv4Addr;
    use std::ptr;

    let mut addrs: *mut libc::ifaddrs = ptr::null_mut();

    // SAFETY: getifaddrs/freeifaddrs are standard POSIX functions. The list is
    // only read between the two calls and freed exactly once.
    unsafe {
        if libc::getifaddrs(&mut addrs) != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut result = Vec::new();
        let mut cursor = addrs;

        while !cursor.is_null() {
            let ifa = &*cursor;
            cursor = ifa.ifa_next;

            if ifa.ifa_addr.is_null() || ifa.ifa_flags & libc::IFF_UP as libc::c_uint == 0 {
                continue;
            }

            let ip = match (*ifa.ifa_addr).sa_family as libc::c_int {
                libc::AF_INET => {
                    let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
                }
                libc::AF_INET6 => {
                    let sin6 = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                    IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
                }
                _ => continue,
            };

            let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();
            result.push(InterfaceAddress { name, ip });
        }

        libc::freeifaddrs(addrs);
        Ok(result)
    }
}

#[cfg(not(unix))]
fn interface_addresses() -> io::Result<Vec<InterfaceAddress>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface enumeration is only available on unix",
    ))
}
