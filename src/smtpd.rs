//! The SMTP dialogue for one connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::addr;
use crate::auth::{self, Authenticator, Mechanism};
use crate::blast::{self, BlastError, Budget, MAX_HOPS};
use crate::channel::{Channel, ChannelError, Transport};
use crate::control::DEFAULT_TIMEOUT;
use crate::policy::{AddressMatcher, IpMe, LocalAddrs};
use crate::queue::{QueueHandle, QueueSpawner};
use crate::received::{self, Trace};
use crate::session::{Peer, SmtpSession};
use crate::utils::safe_log_bytes;

/// Read-only settings shared by every session.
pub struct SmtpdConfig {
    pub greeting: String,
    pub timeout: Duration,
    /// Largest message accepted, zero for no limit.
    pub databytes: u64,
    /// Canonical name substituted for `[a.b.c.d]` literals naming this host.
    pub local_ip_host: Option<String>,
    /// Name used in CRAM-MD5 challenges; AUTH is off without it.
    pub hostname: Option<String>,
    pub rcpt_hosts: Option<Box<dyn AddressMatcher>>,
    pub bad_mail_from: Option<Box<dyn AddressMatcher>>,
    pub ipme: Box<dyn LocalAddrs>,
    pub auth: Option<Box<dyn Authenticator>>,
    pub queue: Box<dyn QueueSpawner>,
    pub tls: Option<TlsAcceptor>,
    /// Refuse AUTH until STARTTLS has run.
    pub require_tls_for_auth: bool,
}

impl SmtpdConfig {
    pub fn new(greeting: impl Into<String>, queue: Box<dyn QueueSpawner>) -> Self {
        Self {
            greeting: greeting.into(),
            timeout: DEFAULT_TIMEOUT,
            databytes: 0,
            local_ip_host: None,
            hostname: None,
            rcpt_hosts: None,
            bad_mail_from: None,
            ipme: Box::new(IpMe::new([])),
            auth: None,
            queue,
            tls: None,
            require_tls_for_auth: false,
        }
    }

    fn auth_available(&self) -> bool {
        self.auth.is_some() && self.hostname.is_some()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("bare LF from client")]
    StrayNewline,
}

impl From<BlastError> for SessionError {
    fn from(err: BlastError) -> Self {
        match err {
            BlastError::Channel(err) => SessionError::Channel(err),
            BlastError::StrayNewline => SessionError::StrayNewline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Rcpt,
    Mail,
    Data,
    Quit,
    Helo,
    Ehlo,
    Rset,
    Help,
    Noop,
    Vrfy,
    Auth,
    StartTls,
    Unknown,
}

struct Command {
    name: &'static str,
    verb: Verb,
    /// Flush replies after this command; the others may be pipelined.
    flush: bool,
}

const COMMANDS: &[Command] = &[
    Command { name: "rcpt", verb: Verb::Rcpt, flush: false },
    Command { name: "mail", verb: Verb::Mail, flush: false },
    Command { name: "data", verb: Verb::Data, flush: true },
    Command { name: "quit", verb: Verb::Quit, flush: true },
    Command { name: "helo", verb: Verb::Helo, flush: true },
    Command { name: "ehlo", verb: Verb::Ehlo, flush: true },
    Command { name: "rset", verb: Verb::Rset, flush: false },
    Command { name: "help", verb: Verb::Help, flush: true },
    Command { name: "noop", verb: Verb::Noop, flush: true },
    Command { name: "vrfy", verb: Verb::Vrfy, flush: true },
    Command { name: "auth", verb: Verb::Auth, flush: true },
    Command { name: "starttls", verb: Verb::StartTls, flush: true },
];

fn lookup(name: &[u8]) -> (Verb, bool) {
    COMMANDS
        .iter()
        .find(|c| c.name.as_bytes().eq_ignore_ascii_case(name))
        .map_or((Verb::Unknown, true), |c| (c.verb, c.flush))
}

/// Split a command line at its first space; the argument loses its
/// leading spaces. Lines are raw bytes: 8-bit addresses and AUTH data
/// pass through untouched.
fn split_command(line: &[u8]) -> (&[u8], &[u8]) {
    let Some(sp) = line.iter().position(|&b| b == b' ') else {
        return (line, b"");
    };
    let mut arg = &line[sp + 1..];
    while let [b' ', rest @ ..] = arg {
        arg = rest;
    }
    (&line[..sp], arg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct Smtpd {
    config: Arc<SmtpdConfig>,
    ch: Channel,
    session: SmtpSession,
}

impl Smtpd {
    pub fn new(config: Arc<SmtpdConfig>, transport: Box<dyn Transport>, peer: Peer) -> Self {
        let ch = Channel::new(transport, config.timeout);
        Self {
            config,
            ch,
            session: SmtpSession::new(peer),
        }
    }

    /// Greet the client and serve commands until QUIT or a fatal error.
    ///
    /// Timeouts and bare LFs get a last-gasp reply before the error is
    /// handed back.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let banner = format!("220 {} ESMTP\r\n", self.config.greeting);
        self.ch.out(&banner);

        let res = self.commands().await;
        match &res {
            Err(SessionError::Channel(ChannelError::Timeout)) => {
                self.ch.out("451 timeout (#4.4.2)\r\n");
                let _ = self.ch.flush().await;
            }
            Err(SessionError::StrayNewline) => {
                self.ch
                    .out("451 See http://pobox.com/~djb/docs/smtplf.html.\r\n");
                let _ = self.ch.flush().await;
            }
            Err(SessionError::Channel(ChannelError::LineTooLong)) => {
                self.ch.out("500 line too long (#5.5.2)\r\n");
                let _ = self.ch.flush().await;
            }
            _ => {}
        }
        res
    }

    async fn commands(&mut self) -> Result<(), SessionError> {
        loop {
            let line = self.ch.read_line().await?;
            let (name, arg) = split_command(&line);
            let (verb, flush) = lookup(name);
            debug!(command = %safe_log_bytes(&line), "<<");

            if self.dispatch(verb, arg).await? == Flow::Quit {
                return Ok(());
            }
            if flush {
                self.ch.flush().await?;
            }
        }
    }

    async fn dispatch(&mut self, verb: Verb, arg: &[u8]) -> Result<Flow, SessionError> {
        match verb {
            Verb::Rcpt => self.rcpt(arg),
            Verb::Mail => self.mail(arg),
            Verb::Data => self.data().await?,
            Verb::Quit => {
                let bye = format!("221 {}\r\n", self.config.greeting);
                self.ch.out(&bye);
                self.ch.flush().await?;
                return Ok(Flow::Quit);
            }
            Verb::Helo => self.helo(arg),
            Verb::Ehlo => self.ehlo(arg),
            Verb::Rset => {
                self.session.reset();
                self.ch.out("250 flushed\r\n");
            }
            Verb::Help => self
                .ch
                .out("214 qmail home page: http://pobox.com/~djb/qmail.html\r\n"),
            Verb::Noop => self.ch.out("250 ok\r\n"),
            Verb::Vrfy => self.ch.out("252 send some mail, i'll try my best\r\n"),
            Verb::Auth => self.auth(arg).await?,
            Verb::StartTls => self.starttls(arg).await?,
            Verb::Unknown => self.err_unimpl(),
        }
        Ok(Flow::Continue)
    }

    fn err_unimpl(&mut self) {
        self.ch.out("502 unimplemented (#5.5.1)\r\n");
    }

    /// Multi-line reply: every line but the last carries a dash.
    fn reply_lines(&mut self, code: u16, lines: &[&str]) {
        let last = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            self.ch.out(&format!("{code}{sep}{line}\r\n"));
        }
    }

    fn helo(&mut self, arg: &[u8]) {
        let reply = format!("250 {}\r\n", self.config.greeting);
        self.ch.out(&reply);
        self.session.reset();
        self.session.helo(&String::from_utf8_lossy(arg));
    }

    fn ehlo(&mut self, arg: &[u8]) {
        let config = Arc::clone(&self.config);
        let auth_line = format!("AUTH {}", auth::MECHANISMS);
        let auth_eq_line = format!("AUTH={}", auth::MECHANISMS);

        let mut lines = vec![config.greeting.as_str(), "PIPELINING", "8BITMIME"];
        if config.tls.is_some() && !self.session.tls_active {
            lines.push("STARTTLS");
        }
        if config.auth_available() && (self.session.tls_active || !config.require_tls_for_auth)
        {
            lines.push(&auth_line);
            lines.push(&auth_eq_line);
        }
        self.reply_lines(250, &lines);

        self.session.reset();
        self.session.helo(&String::from_utf8_lossy(arg));
    }

    fn parse_addr(&self, arg: &[u8]) -> Option<Vec<u8>> {
        let addr = addr::parse(arg)?;
        Some(match &self.config.local_ip_host {
            Some(host) => addr::replace_local_ip(addr, host, self.config.ipme.as_ref()),
            None => addr,
        })
    }

    fn mail(&mut self, arg: &[u8]) {
        let Some(addr) = self.parse_addr(arg) else {
            self.ch.out("555 syntax error (#5.5.4)\r\n");
            return;
        };
        let barf = self
            .config
            .bad_mail_from
            .as_ref()
            .map_or(false, |bmf| bmf.matches(&addr));
        if barf {
            info!(from = %safe_log_bytes(&addr), "sender in badmailfrom");
        }
        self.session.begin(addr, barf);
        self.ch.out("250 ok\r\n");
    }

    fn rcpt(&mut self, arg: &[u8]) {
        if !self.session.seen_mail {
            self.ch.out("503 MAIL first (#5.5.1)\r\n");
            return;
        }
        let Some(mut addr) = self.parse_addr(arg) else {
            self.ch.out("555 syntax error (#5.5.4)\r\n");
            return;
        };
        if self.session.envelope.barf {
            self.ch
                .out("553 sorry, your envelope sender is in my badmailfrom list (#5.7.1)\r\n");
            return;
        }
        if let Some(token) = &self.session.peer.relay_client {
            addr.extend_from_slice(token.as_bytes());
        } else if !self
            .config
            .rcpt_hosts
            .as_ref()
            .map_or(true, |rh| rh.matches(&addr))
        {
            info!(to = %safe_log_bytes(&addr), "relaying denied");
            self.ch
                .out("553 sorry, that domain isn't in my list of allowed rcpthosts (#5.7.1)\r\n");
            return;
        }
        self.session.envelope.rcpt_to.push(addr);
        self.ch.out("250 ok\r\n");
    }

    async fn data(&mut self) -> Result<(), SessionError> {
        if !self.session.seen_mail {
            self.ch.out("503 MAIL first (#5.5.1)\r\n");
            return Ok(());
        }
        if self.session.envelope.rcpt_to.is_empty() {
            self.ch.out("503 RCPT first (#5.5.1)\r\n");
            return Ok(());
        }
        self.session.reset();

        let mut budget = Budget::new(self.config.databytes);
        let proc = match self.config.queue.spawn().await {
            Ok(proc) => proc,
            Err(err) => {
                warn!("unable to start queue: {err}");
                self.ch.out("451 qqt failure (#4.3.0)\r\n");
                return Ok(());
            }
        };
        let mut qq = QueueHandle::new(proc);
        let qp = qq.pid();
        self.ch.out("354 go ahead\r\n");

        let peer = &self.session.peer;
        let header = received::header(
            &Trace {
                protocol: self.session.protocol(),
                local_host: &peer.local_host,
                remote_ip: &peer.remote_ip,
                remote_host: &peer.remote_host,
                remote_info: &peer.remote_info,
                fake_helo: self.session.fake_helo.as_deref(),
            },
            Utc::now(),
        );
        qq.puts(header.as_bytes()).await;

        let hops = blast::blast(&mut self.ch, &mut qq, &mut budget).await?;
        let too_many_hops = hops >= MAX_HOPS;
        if too_many_hops {
            qq.fail();
        }

        let envelope = &self.session.envelope;
        qq.from(&envelope.mail_from).await;
        for rcpt in &envelope.rcpt_to {
            qq.to(rcpt);
        }

        match qq.close().await {
            Ok(()) => {
                info!(
                    qp,
                    from = %safe_log_bytes(&envelope.mail_from),
                    rcpts = envelope.rcpt_to.len(),
                    "message accepted"
                );
                let reply = format!("250 ok {} qp {}\r\n", Utc::now().timestamp(), qp);
                self.ch.out(&reply);
            }
            Err(_) if too_many_hops => {
                info!(qp, hops, "message is looping");
                self.ch
                    .out("554 too many hops, this message is looping (#5.4.6)\r\n");
            }
            Err(_) if budget.exhausted() => {
                info!(qp, databytes = self.config.databytes, "message too big");
                self.ch
                    .out("552 sorry, that message size exceeds my databytes limit (#5.3.4)\r\n");
            }
            Err(err) => {
                warn!(qp, "queue refused message: {err}");
                let reply = err.reply();
                self.ch.out(&reply);
            }
        }
        Ok(())
    }

    async fn auth(&mut self, arg: &[u8]) -> Result<(), SessionError> {
        let config = Arc::clone(&self.config);
        let (Some(authenticator), Some(hostname)) = (&config.auth, &config.hostname) else {
            self.ch.out("503 auth not available (#5.3.3)\r\n");
            return Ok(());
        };
        if config.require_tls_for_auth && !self.session.tls_active {
            self.ch.out(
                "538 encryption required for requested authentication mechanism (#5.7.11)\r\n",
            );
            return Ok(());
        }
        if self.session.authorized {
            self.ch.out("503 you're already authenticated (#5.5.0)\r\n");
            return Ok(());
        }
        if self.session.seen_mail {
            self.ch.out("503 no auth during mail transaction (#5.5.0)\r\n");
            return Ok(());
        }

        let (name, arg) = split_command(arg);
        let Some(mech) = Mechanism::from_name(name) else {
            self.ch.out("504 auth type unimplemented (#5.5.1)\r\n");
            return Ok(());
        };

        let Some(creds) = auth::exchange(&mut self.ch, mech, arg, hostname).await? else {
            return Ok(());
        };
        let user = safe_log_bytes(&creds.user);
        if !authenticator
            .authenticate(&creds.user, &creds.pass, &creds.response)
            .await
        {
            info!(%user, ?mech, "authentication failed");
            self.ch.out("535 authorization failed (#5.7.0)\r\n");
            return Ok(());
        }

        info!(%user, ?mech, "authenticated");
        self.session.authorized = true;
        self.session.peer.relay_client = Some(String::new());
        self.session.peer.remote_info = String::from_utf8_lossy(&creds.user).into_owned();
        self.ch.out("235 ok, go ahead (#2.0.0)\r\n");
        Ok(())
    }

    async fn starttls(&mut self, arg: &[u8]) -> Result<(), SessionError> {
        let config = Arc::clone(&self.config);
        let acceptor = match &config.tls {
            Some(acceptor) if !self.session.tls_active => acceptor,
            _ => {
                self.err_unimpl();
                return Ok(());
            }
        };
        if !arg.is_empty() {
            self.ch
                .out("501 Syntax error (no parameters allowed) (#5.5.4)\r\n");
            return Ok(());
        }

        self.ch.out("220 go ahead\r\n");
        self.ch.start_tls(acceptor).await?;
        debug!("TLS established");

        // The mail transaction survives the upgrade.
        self.session.tls_active = true;
        let remote_host = self.session.peer.remote_host.clone();
        self.session.helo(&remote_host);
        Ok(())
    }
}
