//! Envelope address extraction for `MAIL FROM:` and `RCPT TO:` arguments.

use std::net::Ipv4Addr;

use crate::policy::LocalAddrs;

/// Longest address we are willing to carry through to the queue.
pub const MAX_ADDR_LEN: usize = 900;

/// Pull the mailbox out of a MAIL/RCPT argument.
///
/// Accepts `FROM:<addr>` as well as the bare `FROM:addr` some clients still
/// send. Source routes are dropped, quoting and backslash escapes are
/// undone. Returns `None` on anything we cannot make sense of.
pub fn parse(arg: &[u8]) -> Option<Vec<u8>> {
    let mut terminator = b'>';
    let mut rest = arg;

    if let Some(i) = rest.iter().position(|&b| b == b'<') {
        rest = &rest[i + 1..];
    } else {
        terminator = b' ';
        let i = rest.iter().position(|&b| b == b':')?;
        rest = &rest[i + 1..];
        while let [b' ', tail @ ..] = rest {
            rest = tail;
        }
    }

    if rest.first() == Some(&b'@') {
        let i = rest.iter().position(|&b| b == b':')?;
        rest = &rest[i + 1..];
    }

    let mut addr = Vec::with_capacity(rest.len());
    let mut escaped = false;
    let mut quoted = false;
    for &ch in rest {
        if escaped {
            addr.push(ch);
            escaped = false;
            continue;
        }
        if !quoted && ch == terminator {
            break;
        }
        match ch {
            b'\\' => escaped = true,
            b'"' => quoted = !quoted,
            _ => addr.push(ch),
        }
    }

    if addr.len() > MAX_ADDR_LEN {
        return None;
    }
    Some(addr)
}

/// Rewrite `user@[a.b.c.d]` to `user@<host>` when the literal is one of our
/// own addresses. Anything else comes back untouched.
pub fn replace_local_ip(addr: Vec<u8>, host: &str, ipme: &dyn LocalAddrs) -> Vec<u8> {
    let Some(at) = addr.iter().rposition(|&b| b == b'@') else {
        return addr;
    };
    let domain = &addr[at + 1..];
    match scan_ip_bracket(domain) {
        Some((len, ip)) if len == domain.len() && ipme.is_local(ip) => {
            let mut out = Vec::with_capacity(at + 1 + host.len());
            out.extend_from_slice(&addr[..=at]);
            out.extend_from_slice(host.as_bytes());
            out
        }
        _ => addr,
    }
}

fn scan_ulong(s: &[u8]) -> (usize, u64) {
    let mut n = 0;
    let mut value: u64 = 0;
    for &ch in s {
        if !ch.is_ascii_digit() {
            break;
        }
        value = value.wrapping_mul(10).wrapping_add(u64::from(ch - b'0'));
        n += 1;
    }
    (n, value)
}

/// Scan a dotted quad; octets are truncated to a byte the way qmail does.
fn scan_ip(s: &[u8]) -> Option<(usize, Ipv4Addr)> {
    let mut octets = [0u8; 4];
    let mut len = 0;
    for (i, octet) in octets.iter_mut().enumerate() {
        if i > 0 {
            if s.get(len) != Some(&b'.') {
                return None;
            }
            len += 1;
        }
        let (n, value) = scan_ulong(&s[len..]);
        if n == 0 {
            return None;
        }
        *octet = value as u8;
        len += n;
    }
    Some((len, Ipv4Addr::from(octets)))
}

/// Scan `[a.b.c.d]`, returning the number of bytes consumed.
pub fn scan_ip_bracket(s: &[u8]) -> Option<(usize, Ipv4Addr)> {
    if s.first() != Some(&b'[') {
        return None;
    }
    let (len, ip) = scan_ip(&s[1..])?;
    if s.get(len + 1) != Some(&b']') {
        return None;
    }
    Some((len + 2, ip))
}
