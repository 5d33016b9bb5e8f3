//! qmail control files and the tcpserver environment.

use std::io::{self, ErrorKind};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::session::Peer;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1200);

/// First line of a control file, trimmed. `None` when the file is missing.
pub fn read_line(path: &Path) -> io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text.lines().next().unwrap_or("").trim().to_string())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// A numeric control file. Zero or garbage counts as absent.
pub fn read_int(path: &Path) -> io::Result<Option<i64>> {
    Ok(read_line(path)?.and_then(|line| {
        let (neg, digits) = match line.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, line.as_str()),
        };
        let end = digits
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(digits.len());
        let n: i64 = digits[..end].parse().ok()?;
        match n {
            0 => None,
            n if neg => Some(-n),
            n => Some(n),
        }
    }))
}

/// Every meaningful line of a list file: trimmed, blanks and `#` comments
/// skipped.
pub fn read_file(path: &Path) -> io::Result<Option<Vec<String>>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect(),
        )),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Leading decimal digits of `s`, qmail's `scan_ulong`.
pub fn scan_ulong(s: &str) -> u64 {
    s.bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u64, |n, d| n.wrapping_mul(10).wrapping_add(u64::from(d - b'0')))
}

/// Everything the daemon reads from `<qmail home>/control`.
#[derive(Debug, Clone)]
pub struct Controls {
    pub me: Option<String>,
    pub greeting: String,
    pub local_ip_host: Option<String>,
    pub timeout: Duration,
    pub rcpt_hosts: Option<Vec<String>>,
    pub bad_mail_from: Option<Vec<String>>,
    pub databytes: u64,
}

impl Controls {
    /// `databytes_env` is the `DATABYTES` variable; a non-zero value wins
    /// over the control file.
    pub fn load(home: &Path, databytes_env: Option<&str>) -> Result<Self> {
        let control = home.join("control");
        let path = |name: &str| control.join(name);
        let ctx = |name: &str| format!("unable to read control/{name}");

        let me = read_line(&path("me")).with_context(|| ctx("me"))?;

        let greeting = read_line(&path("smtpgreeting"))
            .with_context(|| ctx("smtpgreeting"))?
            .or_else(|| me.clone())
            .context("neither control/smtpgreeting nor control/me exists")?;

        let local_ip_host = read_line(&path("localiphost"))
            .with_context(|| ctx("localiphost"))?
            .or_else(|| me.clone());

        let timeout = match read_int(&path("timeoutsmtpd")).with_context(|| ctx("timeoutsmtpd"))? {
            Some(secs) if secs <= 0 => Duration::from_secs(1),
            Some(secs) => Duration::from_secs(secs as u64),
            None => DEFAULT_TIMEOUT,
        };

        let rcpt_hosts = read_file(&path("rcpthosts")).with_context(|| ctx("rcpthosts"))?;
        let bad_mail_from =
            read_file(&path("badmailfrom")).with_context(|| ctx("badmailfrom"))?;

        let mut databytes = read_int(&path("databytes"))
            .with_context(|| ctx("databytes"))?
            .map_or(0, |n| n.max(0) as u64);
        if let Some(n) = databytes_env.map(scan_ulong).filter(|&n| n != 0) {
            databytes = n;
        }

        Ok(Self {
            me,
            greeting,
            local_ip_host,
            timeout,
            rcpt_hosts,
            bad_mail_from,
            databytes,
        })
    }
}

/// Connection identity as exported by tcpserver (`TCPLOCALIP` and friends).
pub fn peer_from_env<F>(get: F) -> Peer
where
    F: Fn(&str) -> Option<String>,
{
    let nonempty = |name: &str| get(name).filter(|v| !v.is_empty());
    let local_ip = nonempty("TCPLOCALIP").unwrap_or_else(|| "unknown".to_string());
    Peer {
        local_host: nonempty("TCPLOCALHOST").unwrap_or_else(|| local_ip.clone()),
        local_ip,
        remote_ip: nonempty("TCPREMOTEIP").unwrap_or_else(|| "unknown".to_string()),
        remote_host: nonempty("TCPREMOTEHOST").unwrap_or_else(|| "unknown".to_string()),
        remote_info: nonempty("TCPREMOTEINFO").unwrap_or_default(),
        // an empty RELAYCLIENT still grants relaying
        relay_client: get("RELAYCLIENT"),
    }
}
