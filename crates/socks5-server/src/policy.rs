//! Access policy: which destinations a client may reach through us.
//!
//! Every candidate address is checked with a [`Ruler`] before we dial it.
//! The [`DefaultRuler`] keeps the proxy from being used to reach the
//! machine it runs on, or anything on the networks that machine is
//! directly attached to.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// The outcome of consulting a [`Ruler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The connection may proceed.
    Allow,
    /// The connection must not be made.
    Deny,
}

/// A set of access rules.
///
/// Each candidate destination of each request is checked with
/// [`Ruler::decide`].  Implementations must answer from their arguments
/// alone (plus, at most, the host's interface configuration); they are
/// called once per candidate, from many connections at once.
pub trait Ruler: Send + Sync {
    /// May `requester` connect to `candidate` through this server?
    fn decide(&self, requester: IpAddr, candidate: IpAddr) -> Decision;
}

impl<F> Ruler for F
where
    F: Fn(IpAddr, IpAddr) -> Decision + Send + Sync,
{
    fn decide(&self, requester: IpAddr, candidate: IpAddr) -> Decision {
        self(requester, candidate)
    }
}

/// Ruler that only allows globally routable unicast destinations, outside
/// of every network configured on a local interface.
///
/// Interfaces are enumerated afresh for every decision that gets that
/// far, so addresses that come and go are taken into account.  If they
/// can't be enumerated, everything is denied.
///
/// Enumerating is a `getifaddrs(3)` call on the runtime thread: it only
/// asks the local kernel, and never waits on the network.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRuler;

impl Ruler for DefaultRuler {
    fn decide(&self, _requester: IpAddr, candidate: IpAddr) -> Decision {
        // Most rejections don't need to look at the interfaces at all.
        if !is_global_unicast(canonical(candidate)) {
            return Decision::Deny;
        }
        match local_networks() {
            Ok(nets) => decide_with_networks(candidate, &nets),
            Err(_) => Decision::Deny,
        }
    }
}

/// Ruler that allows everything.
///
/// Only use this when something else is doing the filtering.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Ruler for AllowAll {
    fn decide(&self, _requester: IpAddr, _candidate: IpAddr) -> Decision {
        Decision::Allow
    }
}

/// Apply the [`DefaultRuler`] logic with a given list of local networks.
fn decide_with_networks(candidate: IpAddr, local_nets: &[IpNet]) -> Decision {
    let candidate = canonical(candidate);
    if !is_global_unicast(candidate) {
        return Decision::Deny;
    }
    // IpNet::contains also covers an exact match with the interface address.
    if local_nets.iter().any(|net| net.contains(&candidate)) {
        return Decision::Deny;
    }
    Decision::Allow
}

/// Treat an IPv4-mapped IPv6 address as the IPv4 address it carries.
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Return true if `addr` is a unicast address outside of the unspecified,
/// loopback, link-local, multicast, and broadcast ranges.
///
/// Private ranges count as global here; they are caught by the local
/// network check when this host is attached to them.
fn is_global_unicast(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || is_unicast_link_local(v6))
        }
    }
}

/// fe80::/10
fn is_unicast_link_local(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

/// Return every network configured on a local interface.
fn local_networks() -> io::Result<Vec<IpNet>> {
    let mut nets = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        let net = match iface.addr {
            if_addrs::IfAddr::V4(v4) => v4_net(v4.ip, v4.netmask),
            if_addrs::IfAddr::V6(v6) => v6_net(v6.ip, v6.netmask),
        };
        nets.push(net);
    }
    Ok(nets)
}

/// Build the network containing `ip` with the given netmask.
///
/// A netmask that isn't a prefix is treated as a host route.
fn v4_net(ip: Ipv4Addr, netmask: Ipv4Addr) -> IpNet {
    let prefix = ipnet::ipv4_mask_to_prefix(netmask).unwrap_or(32);
    Ipv4Net::new(ip, prefix)
        .unwrap_or_else(|_| Ipv4Net::from(ip))
        .into()
}

/// Build the network containing `ip` with the given netmask.
///
/// A netmask that isn't a prefix is treated as a host route.
fn v6_net(ip: Ipv6Addr, netmask: Ipv6Addr) -> IpNet {
    let prefix = ipnet::ipv6_mask_to_prefix(netmask).unwrap_or(128);
    Ipv6Net::new(ip, prefix)
        .unwrap_or_else(|_| Ipv6Net::from(ip))
        .into()
}
