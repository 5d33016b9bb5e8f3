use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Membership test over envelope addresses. Used for both the recipient
/// domain allow-list and the sender block-list.
pub trait AddressMatcher: Send + Sync {
    fn matches(&self, addr: &[u8]) -> bool;
}

/// Tells whether an IPv4 literal names this host.
pub trait LocalAddrs: Send + Sync {
    fn is_local(&self, ip: Ipv4Addr) -> bool;
}

/// Domains we accept mail for (`control/rcpthosts`).
///
/// An entry `example.org` matches exactly that domain, `.example.org`
/// matches every subdomain of it.
#[derive(Debug, Default)]
pub struct RcptHosts {
    hosts: HashSet<Vec<u8>>,
}

impl RcptHosts {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().to_ascii_lowercase().into_bytes())
                .collect(),
        }
    }
}

impl AddressMatcher for RcptHosts {
    fn matches(&self, addr: &[u8]) -> bool {
        let Some(at) = addr.iter().rposition(|&b| b == b'@') else {
            // bare local part, qualified later with our own domain
            return true;
        };
        let domain = addr[at + 1..].to_ascii_lowercase();
        (0..domain.len())
            .filter(|&i| i == 0 || domain[i] == b'.')
            .any(|i| self.hosts.contains(&domain[i..]))
    }
}

/// Senders we refuse (`control/badmailfrom`): full addresses or `@domain`.
#[derive(Debug, Default)]
pub struct BadMailFrom {
    entries: HashSet<Vec<u8>>,
}

impl BadMailFrom {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.as_ref().to_ascii_lowercase().into_bytes())
                .collect(),
        }
    }
}

impl AddressMatcher for BadMailFrom {
    fn matches(&self, addr: &[u8]) -> bool {
        let addr = addr.to_ascii_lowercase();
        if self.entries.contains(&addr) {
            return true;
        }
        match addr.iter().rposition(|&b| b == b'@') {
            Some(at) => self.entries.contains(&addr[at..]),
            None => false,
        }
    }
}

/// The addresses this host answers on.
#[derive(Debug, Clone)]
pub struct IpMe {
    addrs: Vec<Ipv4Addr>,
}

impl IpMe {
    pub fn new<I: IntoIterator<Item = Ipv4Addr>>(addrs: I) -> Self {
        let mut me = Self {
            addrs: vec![Ipv4Addr::LOCALHOST],
        };
        for ip in addrs {
            me.add(ip);
        }
        me
    }

    pub fn add(&mut self, ip: Ipv4Addr) {
        if !self.addrs.contains(&ip) {
            self.addrs.push(ip);
        }
    }
}

impl LocalAddrs for IpMe {
    fn is_local(&self, ip: Ipv4Addr) -> bool {
        self.addrs.contains(&ip)
    }
}
