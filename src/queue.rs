//! Handing accepted mail to `qmail-queue`.
//!
//! The queue program reads the message on fd 0 and then the envelope on
//! fd 1: `F<sender>\0`, one `T<recipient>\0` per recipient and a final
//! `\0`. Its exit status says what became of the message.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};
use tracing::debug;

use crate::utils;

const BODY_CHUNK: usize = 8 * 1024;

/// Starts one queue run per message.
#[async_trait]
pub trait QueueSpawner: Send + Sync {
    async fn spawn(&self) -> io::Result<Box<dyn QueueProcess>>;
}

/// A running queue program and the two pipes feeding it.
#[async_trait]
pub trait QueueProcess: Send {
    fn pid(&self) -> u32;
    async fn write_body(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Close the body pipe.
    async fn end_body(&mut self) -> io::Result<()>;
    async fn write_envelope(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Close the envelope pipe and reap the program. `Ok(None)` means it
    /// did not exit normally.
    async fn finish(self: Box<Self>) -> io::Result<Option<i32>>;
}

/// Why the queue did not take the message. The text starts with `D` for a
/// permanent failure or `Z` for a temporary one, followed by the reply text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", &.0[1..])]
pub struct QueueError(&'static str);

impl QueueError {
    pub fn is_permanent(&self) -> bool {
        self.0.starts_with('D')
    }

    pub fn text(&self) -> &'static str {
        &self.0[1..]
    }

    pub fn reply(&self) -> String {
        let code = if self.is_permanent() { 554 } else { 451 };
        format!("{} {}\r\n", code, self.text())
    }
}

/// Translate the queue program's exit status. `None` stands for success.
pub fn exit_message(code: Option<i32>, sticky: bool) -> Option<&'static str> {
    let Some(code) = code else {
        return Some("Zqq crashed (#4.3.0)");
    };
    let msg = match code {
        0 if !sticky => return None,
        0 | 54 => "Zqq read error (#4.3.0)",
        11 | 115 => "Denvelope address too long for qq (#5.1.3)",
        31 => "Dmail server permanently rejected message (#5.3.0)",
        51 => "Zqq out of memory (#4.3.0)",
        52 => "Zqq timeout (#4.3.0)",
        53 => "Zqq write error or disk full (#4.3.0)",
        55 => "Zqq unable to read configuration (#4.3.0)",
        56 => "Zqq trouble making network connection (#4.3.0)",
        61 => "Zqq trouble in home directory (#4.3.0)",
        62..=66 => "Zqq trouble creating files in queue (#4.3.0)",
        71 => "Zmail server temporarily rejected message (#4.3.0)",
        72 => "Zconnection to mail server timed out (#4.4.1)",
        73 => "Zconnection to mail server rejected (#4.4.1)",
        74 => "Zcommunication with mail server failed (#4.4.2)",
        81 | 91 => "Zqq internal bug (#4.3.0)",
        120 => "Zunable to exec qq (#4.3.0)",
        11..=40 => "Dqq permanent problem (#5.3.0)",
        _ => "Zqq temporary problem (#4.3.0)",
    };
    Some(msg)
}

/// One message on its way into the queue.
///
/// Write errors are latched: after the first one every further write is
/// skipped and [`QueueHandle::close`] reports a failure whatever the
/// program's exit status.
pub struct QueueHandle {
    proc: Box<dyn QueueProcess>,
    buf: Vec<u8>,
    sticky: bool,
}

impl QueueHandle {
    pub fn new(proc: Box<dyn QueueProcess>) -> Self {
        Self {
            proc,
            buf: Vec::with_capacity(BODY_CHUNK),
            sticky: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.proc.pid()
    }

    /// Spoil the message; the queue program will be told nothing more.
    pub fn fail(&mut self) {
        self.sticky = true;
        self.buf.clear();
    }

    pub async fn put(&mut self, ch: u8) {
        if self.sticky {
            return;
        }
        self.buf.push(ch);
        if self.buf.len() >= BODY_CHUNK {
            self.flush_body().await;
        }
    }

    pub async fn puts(&mut self, s: &[u8]) {
        if self.sticky {
            return;
        }
        self.buf.extend_from_slice(s);
        if self.buf.len() >= BODY_CHUNK {
            self.flush_body().await;
        }
    }

    async fn flush_body(&mut self) {
        if self.sticky || self.buf.is_empty() {
            return;
        }
        if let Err(err) = self.proc.write_body(&self.buf).await {
            debug!(pid = self.proc.pid(), "writing message to queue: {err}");
            self.sticky = true;
        }
        self.buf.clear();
    }

    /// End the message and start the envelope with its sender.
    pub async fn from(&mut self, addr: &[u8]) {
        self.flush_body().await;
        if let Err(err) = self.proc.end_body().await {
            debug!(pid = self.proc.pid(), "closing message pipe: {err}");
            self.sticky = true;
        }
        self.envelope(b'F', addr);
    }

    pub fn to(&mut self, addr: &[u8]) {
        self.envelope(b'T', addr);
    }

    fn envelope(&mut self, kind: u8, addr: &[u8]) {
        if self.sticky {
            return;
        }
        self.buf.push(kind);
        self.buf.extend_from_slice(addr);
        self.buf.push(0);
    }

    /// Terminate the envelope and wait for the verdict.
    pub async fn close(mut self) -> Result<(), QueueError> {
        if !self.sticky {
            self.buf.push(0);
            if let Err(err) = self.proc.write_envelope(&self.buf).await {
                debug!(pid = self.proc.pid(), "writing envelope to queue: {err}");
                self.sticky = true;
            }
        }
        let pid = self.proc.pid();
        let code = match self.proc.finish().await {
            Ok(code) => code,
            Err(err) => {
                debug!(pid, "waiting for queue: {err}");
                None
            }
        };
        debug!(pid, ?code, sticky = self.sticky, "queue finished");
        match exit_message(code, self.sticky) {
            None => Ok(()),
            Some(msg) => Err(QueueError(msg)),
        }
    }
}

/// Runs `qmail-queue` from the qmail home directory.
#[derive(Debug, Clone)]
pub struct QmailQueue {
    home: PathBuf,
    program: PathBuf,
}

impl QmailQueue {
    /// `program` is resolved against `home` when relative.
    pub fn new(home: impl Into<PathBuf>, program: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let program = home.join(program.into());
        Self { home, program }
    }
}

#[async_trait]
impl QueueSpawner for QmailQueue {
    async fn spawn(&self) -> io::Result<Box<dyn QueueProcess>> {
        let (envelope_rd, envelope_wr) = utils::pipe()?;

        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&self.home)
            .stdin(Stdio::piped())
            // qmail-queue reads the envelope from fd 1
            .stdout(Stdio::from(envelope_rd))
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;
        drop(cmd);

        let body = child.stdin.take();
        let envelope = pipe::Sender::from_owned_fd(envelope_wr)?;
        debug!(pid = child.id(), program = %self.program.display(), "queue started");
        Ok(Box::new(QmailProcess {
            child,
            body,
            envelope: Some(envelope),
        }))
    }
}

struct QmailProcess {
    child: Child,
    body: Option<ChildStdin>,
    envelope: Option<pipe::Sender>,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe already closed")
}

#[async_trait]
impl QueueProcess for QmailProcess {
    fn pid(&self) -> u32 {
        self.child.id().unwrap_or(0)
    }

    async fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
        let body = self.body.as_mut().ok_or_else(closed)?;
        body.write_all(buf).await
    }

    async fn end_body(&mut self) -> io::Result<()> {
        match self.body.take() {
            Some(mut body) => body.shutdown().await,
            None => Ok(()),
        }
    }

    async fn write_envelope(&mut self, buf: &[u8]) -> io::Result<()> {
        let envelope = self.envelope.as_mut().ok_or_else(closed)?;
        envelope.write_all(buf).await
    }

    async fn finish(mut self: Box<Self>) -> io::Result<Option<i32>> {
        self.body.take();
        self.envelope.take();
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory queue for engine tests.

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default, Clone)]
    pub struct Recorded {
        pub body: Vec<u8>,
        pub envelope: Vec<u8>,
        pub body_closed: bool,
        pub runs: usize,
    }

    /// Always exits with `exit`; refuses to start when `exit` is `Err`.
    /// With `body_limit` set, body writes past that many bytes fail with
    /// a broken pipe.
    #[derive(Clone)]
    pub struct FakeQueue {
        pub exit: Result<Option<i32>, ()>,
        pub body_limit: Option<usize>,
        pub seen: Arc<Mutex<Recorded>>,
    }

    impl FakeQueue {
        pub fn exiting(code: i32) -> Self {
            Self {
                exit: Ok(Some(code)),
                body_limit: None,
                seen: Arc::default(),
            }
        }

        pub fn broken() -> Self {
            Self {
                exit: Err(()),
                body_limit: None,
                seen: Arc::default(),
            }
        }

        /// Exits with `code` but stops reading the message after `limit`
        /// bytes.
        pub fn hanging_up(code: i32, limit: usize) -> Self {
            Self {
                body_limit: Some(limit),
                ..Self::exiting(code)
            }
        }

        pub fn recorded(&self) -> Recorded {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueueSpawner for FakeQueue {
        async fn spawn(&self) -> io::Result<Box<dyn QueueProcess>> {
            let exit = self
                .exit
                .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "no qmail-queue"))?;
            self.seen.lock().unwrap().runs += 1;
            Ok(Box::new(FakeProcess {
                exit,
                body_limit: self.body_limit,
                seen: self.seen.clone(),
            }))
        }
    }

    struct FakeProcess {
        exit: Option<i32>,
        body_limit: Option<usize>,
        seen: Arc<Mutex<Recorded>>,
    }

    #[async_trait]
    impl QueueProcess for FakeProcess {
        fn pid(&self) -> u32 {
            7777
        }

        async fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
            let mut seen = self.seen.lock().unwrap();
            if seen.body_closed {
                return Err(closed());
            }
            if self
                .body_limit
                .map_or(false, |limit| seen.body.len() + buf.len() > limit)
            {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader went away"));
            }
            seen.body.extend_from_slice(buf);
            Ok(())
        }

        async fn end_body(&mut self) -> io::Result<()> {
            self.seen.lock().unwrap().body_closed = true;
            Ok(())
        }

        async fn write_envelope(&mut self, buf: &[u8]) -> io::Result<()> {
            self.seen.lock().unwrap().envelope.extend_from_slice(buf);
            Ok(())
        }

        async fn finish(self: Box<Self>) -> io::Result<Option<i32>> {
            Ok(self.exit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeQueue;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exit_codes() {
        let cases = [
            (Some(0), false, None),
            (Some(0), true, Some("Zqq read error (#4.3.0)")),
            (Some(11), false, Some("Denvelope address too long for qq (#5.1.3)")),
            (Some(115), false, Some("Denvelope address too long for qq (#5.1.3)")),
            (Some(31), false, Some("Dmail server permanently rejected message (#5.3.0)")),
            (Some(25), false, Some("Dqq permanent problem (#5.3.0)")),
            (Some(40), false, Some("Dqq permanent problem (#5.3.0)")),
            (Some(41), false, Some("Zqq temporary problem (#4.3.0)")),
            (Some(52), true, Some("Zqq timeout (#4.3.0)")),
            (Some(64), false, Some("Zqq trouble creating files in queue (#4.3.0)")),
            (Some(72), false, Some("Zconnection to mail server timed out (#4.4.1)")),
            (Some(91), false, Some("Zqq internal bug (#4.3.0)")),
            (Some(120), false, Some("Zunable to exec qq (#4.3.0)")),
            (Some(1), false, Some("Zqq temporary problem (#4.3.0)")),
            (None, false, Some("Zqq crashed (#4.3.0)")),
        ];
        for (code, sticky, want) in cases {
            assert_eq!(exit_message(code, sticky), want, "exit {code:?}");
        }
    }

    #[test]
    fn replies() {
        assert_eq!(
            QueueError("Dqq permanent problem (#5.3.0)").reply(),
            "554 qq permanent problem (#5.3.0)\r\n"
        );
        assert_eq!(
            QueueError("Zqq timeout (#4.3.0)").reply(),
            "451 qq timeout (#4.3.0)\r\n"
        );
    }

    #[tokio::test]
    async fn two_pipe_protocol() {
        let queue = FakeQueue::exiting(0);
        let mut qq = QueueHandle::new(queue.spawn().await.unwrap());
        assert_eq!(qq.pid(), 7777);

        qq.puts(b"Subject: hi\n\n").await;
        qq.put(b'x').await;
        qq.from(b"joe@example.org").await;
        qq.to(b"ann@example.org");
        qq.to(b"bob@example.org");
        qq.close().await.unwrap();

        let seen = queue.recorded();
        assert_eq!(seen.body, b"Subject: hi\n\nx");
        assert!(seen.body_closed);
        assert_eq!(
            seen.envelope,
            b"Fjoe@example.org\0Tann@example.org\0Tbob@example.org\0\0"
        );
    }

    #[tokio::test]
    async fn large_body_is_streamed() {
        let queue = FakeQueue::exiting(0);
        let mut qq = QueueHandle::new(queue.spawn().await.unwrap());
        for _ in 0..3 * BODY_CHUNK {
            qq.put(b'a').await;
        }
        assert_eq!(queue.recorded().body.len(), 3 * BODY_CHUNK);
        qq.from(b"").await;
        qq.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_handle_is_never_accepted() {
        let queue = FakeQueue::exiting(0);
        let mut qq = QueueHandle::new(queue.spawn().await.unwrap());
        qq.puts(b"partial").await;
        qq.fail();
        qq.put(b'y').await;
        qq.from(b"joe@example.org").await;
        qq.to(b"ann@example.org");

        let err = qq.close().await.unwrap_err();
        assert_eq!(err.text(), "qq read error (#4.3.0)");
        assert!(!err.is_permanent());

        let seen = queue.recorded();
        assert!(seen.body.is_empty());
        assert!(seen.envelope.is_empty());
    }

    #[tokio::test]
    async fn body_write_error_is_sticky() {
        let queue = FakeQueue::hanging_up(0, BODY_CHUNK);
        let mut qq = QueueHandle::new(queue.spawn().await.unwrap());
        for _ in 0..2 * BODY_CHUNK + 1 {
            qq.put(b'a').await;
        }
        qq.from(b"joe@example.org").await;
        qq.to(b"ann@example.org");

        // the program exits 0, yet the message is not accepted
        let err = qq.close().await.unwrap_err();
        assert_eq!(err.text(), "qq read error (#4.3.0)");
        assert_eq!(err.reply(), "451 qq read error (#4.3.0)\r\n");

        let seen = queue.recorded();
        assert_eq!(seen.body.len(), BODY_CHUNK);
        assert!(seen.envelope.is_empty());
    }

    #[tokio::test]
    async fn eight_bit_envelope() {
        let queue = FakeQueue::exiting(0);
        let mut qq = QueueHandle::new(queue.spawn().await.unwrap());
        qq.from(b"j\xf6rg@example.org").await;
        qq.to(b"\xe9@x");
        qq.close().await.unwrap();
        assert_eq!(queue.recorded().envelope, b"Fj\xf6rg@example.org\0T\xe9@x\0\0");
    }

    #[tokio::test]
    async fn permanent_exit() {
        let queue = FakeQueue::exiting(31);
        let mut qq = QueueHandle::new(queue.spawn().await.unwrap());
        qq.from(b"joe@example.org").await;
        qq.to(b"ann@example.org");
        let err = qq.close().await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(err.reply(), "554 mail server permanently rejected message (#5.3.0)\r\n");
    }

    #[tokio::test]
    async fn qmail_queue_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-queue");
        let out = dir.path().join("seen");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\ncat > '{out}.body'\ncat <&1 > '{out}.env'\nexit 0\n",
                out = out.display()
            ),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let queue = QmailQueue::new(dir.path(), "fake-queue");
        let mut qq = QueueHandle::new(queue.spawn().await.unwrap());
        qq.puts(b"hello\n").await;
        qq.from(b"joe@example.org").await;
        qq.to(b"ann@example.org");
        qq.close().await.unwrap();

        let body = std::fs::read(format!("{}.body", out.display())).unwrap();
        let env = std::fs::read(format!("{}.env", out.display())).unwrap();
        assert_eq!(body, b"hello\n");
        assert_eq!(env, b"Fjoe@example.org\0Tann@example.org\0\0");
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let queue = QmailQueue::new(dir.path(), "bin/qmail-queue");
        assert!(queue.spawn().await.is_err());
    }
}
