/// Who is on either end of the connection, as told by tcpserver or the
/// listening socket.
#[derive(Debug, Clone)]
pub struct Peer {
    pub local_ip: String,
    pub local_host: String,
    pub remote_ip: String,
    pub remote_host: String,
    /// Ident answer, or the authenticated user after AUTH.
    pub remote_info: String,
    /// Set when this client may relay; appended to every recipient.
    pub relay_client: Option<String>,
}

impl Default for Peer {
    fn default() -> Self {
        Self {
            local_ip: String::new(),
            local_host: "unknown".to_string(),
            remote_ip: "unknown".to_string(),
            remote_host: "unknown".to_string(),
            remote_info: String::new(),
            relay_client: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Envelope {
    /// Raw address bytes; 8-bit addresses reach the queue untouched.
    pub mail_from: Vec<u8>,
    pub rcpt_to: Vec<Vec<u8>>,
    /// The sender is in badmailfrom; every recipient will be refused.
    pub barf: bool,
}

pub struct SmtpSession {
    pub peer: Peer,
    pub helo: String,
    pub fake_helo: Option<String>,
    pub authorized: bool,
    pub tls_active: bool,
    pub seen_mail: bool,
    pub envelope: Envelope,
}

impl SmtpSession {
    pub fn new(peer: Peer) -> Self {
        let mut session = Self {
            helo: String::new(),
            fake_helo: None,
            peer,
            authorized: false,
            tls_active: false,
            seen_mail: false,
            envelope: Envelope::default(),
        };
        let remote_host = session.peer.remote_host.clone();
        session.helo(&remote_host);
        session
    }

    /// Record the name the client gave and remember it separately when it
    /// does not match the remote host name.
    pub fn helo(&mut self, name: &str) {
        self.helo = name.to_string();
        if !self.peer.remote_host.eq_ignore_ascii_case(name) {
            self.fake_helo = Some(name.to_string());
        } else {
            self.fake_helo = None;
        }
    }

    /// Start over with a new transaction.
    pub fn begin(&mut self, mail_from: Vec<u8>, barf: bool) {
        self.seen_mail = true;
        self.envelope.mail_from = mail_from;
        self.envelope.rcpt_to.clear();
        self.envelope.barf = barf;
    }

    pub fn reset(&mut self) {
        self.seen_mail = false;
    }

    pub fn protocol(&self) -> &'static str {
        if self.tls_active {
            "ESMTPS"
        } else {
            "SMTP"
        }
    }
}
