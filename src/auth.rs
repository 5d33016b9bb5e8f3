//! SMTP AUTH: the LOGIN, PLAIN and CRAM-MD5 exchanges and the checkpassword
//! style authenticator that judges their outcome.

use std::io;
use std::os::fd::AsRawFd;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelError};
use crate::utils;

/// Mechanism list as advertised in the EHLO reply.
pub const MECHANISMS: &str = "LOGIN PLAIN CRAM-MD5";

/// Decides whether collected credentials are good.
///
/// For CRAM-MD5 `pass` holds the challenge we issued and `response` the
/// client's digest; the other mechanisms leave `response` empty. All three
/// are the bytes the client sent, which need not be UTF-8.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, user: &[u8], pass: &[u8], response: &[u8]) -> bool;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: Vec<u8>,
    pub pass: Vec<u8>,
    pub response: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Login,
    Plain,
    CramMd5,
}

impl Mechanism {
    pub fn from_name(name: &[u8]) -> Option<Self> {
        if name.eq_ignore_ascii_case(b"login") {
            Some(Self::Login)
        } else if name.eq_ignore_ascii_case(b"plain") {
            Some(Self::Plain)
        } else if name.eq_ignore_ascii_case(b"cram-md5") {
            Some(Self::CramMd5)
        } else {
            None
        }
    }
}

pub fn b64encode(s: impl AsRef<[u8]>) -> String {
    STANDARD.encode(s)
}

pub fn b64decode(s: &[u8]) -> Option<Vec<u8>> {
    STANDARD.decode(s).ok()
}

fn err_input(ch: &mut Channel) {
    ch.out("501 malformed auth input (#5.5.4)\r\n");
}

async fn prompt(ch: &mut Channel, text: &str) -> Result<(), ChannelError> {
    ch.out("334 ");
    ch.out(&b64encode(text));
    ch.out("\r\n");
    ch.flush().await
}

fn decode(ch: &mut Channel, s: &[u8]) -> Option<Vec<u8>> {
    let decoded = b64decode(s);
    if decoded.is_none() {
        err_input(ch);
    }
    decoded
}

/// Read one client response. `None` means the exchange is over and the
/// client has already been told why.
async fn response(ch: &mut Channel) -> Result<Option<Vec<u8>>, ChannelError> {
    let line = ch.read_line().await?;
    if line == b"*" {
        ch.out("501 auth exchange cancelled (#5.0.0)\r\n");
        return Ok(None);
    }
    Ok(decode(ch, &line))
}

/// Run the exchange for `mech` and return what the client proved, if
/// anything. Failures have been replied to by the time `Ok(None)` returns.
pub async fn exchange(
    ch: &mut Channel,
    mech: Mechanism,
    arg: &[u8],
    hostname: &str,
) -> Result<Option<Credentials>, ChannelError> {
    match mech {
        Mechanism::Login => login(ch, arg).await,
        Mechanism::Plain => plain(ch, arg).await,
        Mechanism::CramMd5 => cram_md5(ch, arg, hostname).await,
    }
}

async fn login(ch: &mut Channel, arg: &[u8]) -> Result<Option<Credentials>, ChannelError> {
    let user = if arg.is_empty() {
        prompt(ch, "Username:").await?;
        response(ch).await?
    } else {
        decode(ch, arg)
    };
    let Some(user) = user else {
        return Ok(None);
    };
    if user.is_empty() {
        err_input(ch);
        return Ok(None);
    }

    prompt(ch, "Password:").await?;
    let Some(pass) = response(ch).await? else {
        return Ok(None);
    };
    if pass.is_empty() {
        err_input(ch);
        return Ok(None);
    }

    Ok(Some(Credentials {
        user,
        pass,
        response: Vec::new(),
    }))
}

async fn plain(ch: &mut Channel, arg: &[u8]) -> Result<Option<Credentials>, ChannelError> {
    let slop = if arg.is_empty() {
        prompt(ch, "").await?;
        response(ch).await?
    } else {
        decode(ch, arg)
    };
    let Some(slop) = slop else {
        return Ok(None);
    };

    // authzid \0 user \0 pass [\0]
    let mut parts = slop.splitn(3, |&b| b == 0);
    let _authzid = parts.next();
    let (Some(user), Some(rest)) = (parts.next(), parts.next()) else {
        err_input(ch);
        return Ok(None);
    };
    let pass = rest.split(|&b| b == 0).next().unwrap_or_default();
    if user.is_empty() || pass.is_empty() {
        err_input(ch);
        return Ok(None);
    }

    Ok(Some(Credentials {
        user: user.to_vec(),
        pass: pass.to_vec(),
        response: Vec::new(),
    }))
}

/// Sessions served by one listener share a pid; the sequence number keeps
/// their challenges apart.
static CHALLENGES: AtomicU64 = AtomicU64::new(0);

/// `<pid.seq.unixtime@hostname>`
pub fn cram_challenge(hostname: &str) -> String {
    format!(
        "<{}.{}.{}@{}>",
        std::process::id(),
        CHALLENGES.fetch_add(1, Ordering::Relaxed),
        chrono::Utc::now().timestamp(),
        hostname
    )
}

async fn cram_md5(
    ch: &mut Channel,
    arg: &[u8],
    hostname: &str,
) -> Result<Option<Credentials>, ChannelError> {
    if !arg.is_empty() {
        err_input(ch);
        return Ok(None);
    }

    let challenge = cram_challenge(hostname);
    prompt(ch, &challenge).await?;
    let Some(slop) = response(ch).await? else {
        return Ok(None);
    };

    let Some(sp) = slop.iter().position(|&b| b == b' ') else {
        err_input(ch);
        return Ok(None);
    };
    let user = &slop[..sp];
    let mut digest = &slop[sp + 1..];
    while let [b' ', rest @ ..] = digest {
        digest = rest;
    }
    if user.is_empty() || digest.is_empty() {
        err_input(ch);
        return Ok(None);
    }

    Ok(Some(Credentials {
        user: user.to_vec(),
        pass: challenge.into_bytes(),
        response: digest.to_vec(),
    }))
}

/// Hands credentials to a checkpassword-compatible program on fd 3 as
/// `user\0pass\0response\0`. Exit status 0 means the credentials are good.
#[derive(Debug, Clone)]
pub struct CheckPassword {
    program: String,
    args: Vec<String>,
}

impl CheckPassword {
    /// `argv` is the full command line; `None` when it is empty.
    pub fn new(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    async fn run(&self, user: &[u8], pass: &[u8], response: &[u8]) -> io::Result<bool> {
        let (read_end, write_end) = utils::pipe()?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        let fd = read_end.as_raw_fd();
        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || utils::dup_onto(fd, 3));
        }
        let mut child = cmd.spawn()?;
        drop(read_end);

        let mut buf = Vec::with_capacity(user.len() + pass.len() + response.len() + 3);
        for field in [user, pass, response] {
            buf.extend_from_slice(field);
            buf.push(0);
        }
        let mut sender = tokio::net::unix::pipe::Sender::from_owned_fd(write_end)?;
        let written = sender.write_all(&buf).await;
        drop(sender);

        let status = child.wait().await?;
        written?;
        Ok(status.success())
    }
}

#[async_trait]
impl Authenticator for CheckPassword {
    async fn authenticate(&self, user: &[u8], pass: &[u8], response: &[u8]) -> bool {
        match self.run(user, pass, response).await {
            Ok(ok) => {
                debug!(user = %utils::safe_log_bytes(user), ok, "checkpassword finished");
                ok
            }
            Err(err) => {
                warn!(program = %self.program, "unable to run checkpassword: {err}");
                false
            }
        }
    }
}
