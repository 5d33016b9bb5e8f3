mod addr;
mod auth;
mod blast;
mod channel;
mod control;
mod policy;
mod queue;
mod received;
mod server;
mod session;
mod smtpd;
mod tls;
mod utils;

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::control::Controls;
use crate::policy::{BadMailFrom, IpMe, RcptHosts};
use crate::queue::QmailQueue;
use crate::smtpd::SmtpdConfig;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "qsmtpd",
    about = "A qmail-smtpd compatible SMTP receiver",
    version = "0.1.0"
)]
pub struct Opt {
    /// qmail home directory holding control/ and bin/
    #[structopt(long = "qmail-home", default_value = "/var/qmail", parse(from_os_str))]
    pub qmail_home: PathBuf,

    /// Queue program, relative to the qmail home
    #[structopt(long = "queue", default_value = "bin/qmail-queue", parse(from_os_str))]
    pub queue: PathBuf,

    /// Listening ports (can be specified multiple times). Without any, one
    /// session is served on stdin/stdout.
    #[structopt(short = "p", long = "port", number_of_values = 1)]
    pub ports: Vec<u16>,

    /// Listening address (default: 0.0.0.0)
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Extra addresses that belong to this host (can be specified multiple times)
    #[structopt(long = "local-ip", number_of_values = 1)]
    pub local_ips: Vec<Ipv4Addr>,

    /// TLS certificate file (default: control/servercert.pem)
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (default: the certificate file)
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Refuse AUTH before STARTTLS
    #[structopt(long = "require-tls-auth")]
    pub require_tls_auth: bool,

    /// Verbose mode - log every SMTP command
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Log file path (default: stderr)
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Host name announced in CRAM-MD5 challenges
    #[structopt(name = "HOSTNAME")]
    pub hostname: Option<String>,

    /// checkpassword program and its arguments
    #[structopt(name = "CHECKPASSWORD")]
    pub checkpassword: Vec<String>,
}

fn init_logging(opt: &Opt) -> Result<()> {
    let default = if opt.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &opt.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {:?}", path))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn tcp_local_ip() -> Option<Ipv4Addr> {
    std::env::var("TCPLOCALIP").ok()?.parse().ok()
}

fn build_config(opt: &Opt) -> Result<SmtpdConfig> {
    let databytes = std::env::var("DATABYTES").ok();
    let controls = Controls::load(&opt.qmail_home, databytes.as_deref())?;
    info!(
        "controls loaded from {:?}, me = {}",
        opt.qmail_home,
        controls.me.as_deref().unwrap_or("(unset)")
    );

    let queue = QmailQueue::new(&opt.qmail_home, &opt.queue);
    let mut config = SmtpdConfig::new(controls.greeting, Box::new(queue));
    config.timeout = controls.timeout;
    config.databytes = controls.databytes;
    config.local_ip_host = controls.local_ip_host;

    if let Some(hosts) = controls.rcpt_hosts {
        config.rcpt_hosts = Some(Box::new(RcptHosts::new(hosts)));
    }
    if let Some(entries) = controls.bad_mail_from {
        config.bad_mail_from = Some(Box::new(BadMailFrom::new(entries)));
    }

    let mut ipme = IpMe::new(opt.local_ips.iter().copied());
    if let Some(ip) = tcp_local_ip() {
        ipme.add(ip);
    }
    if let Ok(ip) = opt.address.parse::<Ipv4Addr>() {
        if !ip.is_unspecified() {
            ipme.add(ip);
        }
    }
    config.ipme = Box::new(ipme);

    if let Some(hostname) = &opt.hostname {
        match auth::CheckPassword::new(&opt.checkpassword) {
            Some(checker) => {
                info!("SMTP AUTH enabled via {}", opt.checkpassword[0]);
                config.hostname = Some(hostname.clone());
                config.auth = Some(Box::new(checker));
            }
            None => info!("no checkpassword program given, SMTP AUTH disabled"),
        }
    }

    let default_cert = opt.qmail_home.join("control").join("servercert.pem");
    let cert = opt
        .tls_cert
        .clone()
        .or_else(|| default_cert.exists().then(|| default_cert.clone()));
    if let Some(cert) = cert {
        let key = opt.tls_key.clone().unwrap_or_else(|| cert.clone());
        config.tls = Some(tls::load_acceptor(&cert, &key)?);
        info!("STARTTLS enabled with certificate: {:?}", cert);
    }
    config.require_tls_for_auth = opt.require_tls_auth;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();
    init_logging(&opt)?;

    let stdio = opt.ports.is_empty();
    let config = match build_config(&opt) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!("setup failed: {:#}", e);
            if stdio {
                let mut out = std::io::stdout();
                let _ = out.write_all(b"421 unable to read controls (#4.3.0)\r\n");
                let _ = out.flush();
                std::process::exit(1);
            }
            return Err(e);
        }
    };

    if stdio {
        let peer = control::peer_from_env(|name| std::env::var(name).ok());
        let code = match server::serve_stdio(config, peer).await {
            Ok(()) => 0,
            Err(_) => 1,
        };
        std::process::exit(code);
    }

    info!("PID: {}", std::process::id());
    info!("Ports: {:?}", opt.ports);
    server::run(config, &opt.address, &opt.ports).await
}
