use chrono::{DateTime, Utc};

/// What goes into the trace header of one message.
#[derive(Debug, Clone, Copy)]
pub struct Trace<'a> {
    pub protocol: &'a str,
    pub local_host: &'a str,
    pub remote_ip: &'a str,
    pub remote_host: &'a str,
    pub remote_info: &'a str,
    /// The HELO name, only when it differs from the remote host name.
    pub fake_helo: Option<&'a str>,
}

fn is_safe(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || b".@%+/=:-".contains(&ch)
}

fn safe_put(out: &mut String, s: &str) {
    out.extend(
        s.bytes()
            .map(|ch| if is_safe(ch) { ch as char } else { '?' }),
    );
}

/// Render the `Received:` line qmail prepends, e.g.
///
/// ```text
/// Received: from relay1.uu.net (HELO uunet.uu.net) (7@192.48.96.5)
///   by silverton.berkeley.edu with SMTP; 26 Sep 1995 04:46:54 -0000
/// ```
pub fn header(trace: &Trace<'_>, when: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(128);
    out.push_str("Received: from ");
    safe_put(&mut out, trace.remote_host);
    if let Some(helo) = trace.fake_helo {
        out.push_str(" (HELO ");
        safe_put(&mut out, helo);
        out.push(')');
    }
    out.push_str(" (");
    if !trace.remote_info.is_empty() {
        safe_put(&mut out, trace.remote_info);
        out.push('@');
    }
    safe_put(&mut out, trace.remote_ip);
    out.push_str(")\n  by ");
    safe_put(&mut out, trace.local_host);
    out.push_str(" with ");
    out.push_str(trace.protocol);
    out.push_str("; ");
    out.push_str(&when.format("%-d %b %Y %H:%M:%S -0000").to_string());
    out.push('\n');
    out
}
