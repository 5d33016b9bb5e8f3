use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

/// Anything a session can talk SMTP over: a TCP socket, the stdin/stdout
/// pair handed over by tcpserver, a TLS stream wrapping one of those.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    #[error("io timeout")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("line too long")]
    LineTooLong,
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        ChannelError::Io(Arc::new(err))
    }
}

const READ_CHUNK: usize = 4096;

/// Longest command or AUTH line accepted, terminator excluded.
pub const MAX_LINE: usize = 16 * 1024;

/// Runs `op` against the deadline. The first failure is latched into
/// `sticky` and handed back by every later call without touching `op`.
async fn guarded<T, F>(
    timeout: Duration,
    sticky: &mut Option<ChannelError>,
    op: F,
) -> Result<T, ChannelError>
where
    F: Future<Output = io::Result<T>>,
{
    if let Some(err) = sticky {
        return Err(err.clone());
    }

    let res = if timeout.is_zero() {
        op.await.map_err(ChannelError::from)
    } else {
        match tokio::time::timeout(timeout, op).await {
            Ok(r) => r.map_err(ChannelError::from),
            Err(_) => Err(ChannelError::Timeout),
        }
    };

    if let Err(err) = &res {
        *sticky = Some(err.clone());
    }
    res
}

/// Buffered, deadline-guarded connection to the SMTP peer.
///
/// Replies are queued with [`Channel::out`] and only hit the wire on
/// [`Channel::flush`], or implicitly right before the channel has to block
/// on the peer for more input.
pub struct Channel {
    inner: Option<Box<dyn Transport>>,
    timeout: Duration,
    rbuf: Vec<u8>,
    rpos: usize,
    wbuf: Vec<u8>,
    read_err: Option<ChannelError>,
    write_err: Option<ChannelError>,
}

impl Channel {
    pub fn new(transport: Box<dyn Transport>, timeout: Duration) -> Self {
        Self {
            inner: Some(transport),
            timeout,
            rbuf: Vec::with_capacity(READ_CHUNK),
            rpos: 0,
            wbuf: Vec::new(),
            read_err: None,
            write_err: None,
        }
    }

    /// Queue reply text for the peer.
    pub fn out(&mut self, s: &str) {
        self.wbuf.extend_from_slice(s.as_bytes());
    }

    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let Some(inner) = self.inner.as_mut() else {
            return Err(ChannelError::Closed);
        };
        let buf = std::mem::take(&mut self.wbuf);
        guarded(self.timeout, &mut self.write_err, async {
            inner.write_all(&buf).await?;
            inner.flush().await
        })
        .await
    }

    async fn fill(&mut self) -> Result<(), ChannelError> {
        self.flush().await?;

        let Some(inner) = self.inner.as_mut() else {
            return Err(ChannelError::Closed);
        };
        self.rbuf.resize(READ_CHUNK, 0);
        self.rpos = 0;
        let rbuf = &mut self.rbuf;
        let n = match guarded(self.timeout, &mut self.read_err, inner.read(rbuf)).await {
            Ok(n) => n,
            Err(err) => {
                rbuf.clear();
                return Err(err);
            }
        };
        rbuf.truncate(n);
        if n == 0 {
            self.read_err = Some(ChannelError::Closed);
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    pub async fn read_byte(&mut self) -> Result<u8, ChannelError> {
        if self.rpos >= self.rbuf.len() {
            self.fill().await?;
        }
        let ch = self.rbuf[self.rpos];
        self.rpos += 1;
        Ok(ch)
    }

    /// Read one line and return it without its `\n` or `\r\n` terminator.
    ///
    /// A line running past [`MAX_LINE`] poisons the read side with
    /// [`ChannelError::LineTooLong`].
    pub async fn read_line(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut line = Vec::new();
        loop {
            if self.rpos >= self.rbuf.len() {
                self.fill().await?;
            }
            let avail = &self.rbuf[self.rpos..];
            let done = match avail.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    line.extend_from_slice(&avail[..i]);
                    self.rpos += i + 1;
                    true
                }
                None => {
                    line.extend_from_slice(avail);
                    self.rpos = self.rbuf.len();
                    false
                }
            };
            // the CR of a CRLF may still be on the line
            let limit = if line.last() == Some(&b'\r') { MAX_LINE + 1 } else { MAX_LINE };
            if line.len() > limit {
                self.rbuf.clear();
                self.rpos = 0;
                self.read_err = Some(ChannelError::LineTooLong);
                return Err(ChannelError::LineTooLong);
            }
            if done {
                break;
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Swap the plaintext transport for a TLS one negotiated over it.
    ///
    /// Pending replies are flushed first. Input the peer sent ahead of the
    /// handshake is dropped, so nothing smuggled in plaintext survives into
    /// the encrypted session.
    pub async fn start_tls(&mut self, acceptor: &TlsAcceptor) -> Result<(), ChannelError> {
        self.flush().await?;

        let Some(inner) = self.inner.take() else {
            return Err(ChannelError::Closed);
        };
        self.rbuf.clear();
        self.rpos = 0;

        let mut handshake_err = None;
        let stream = guarded(self.timeout, &mut handshake_err, acceptor.accept(inner)).await;
        match stream {
            Ok(stream) => {
                self.inner = Some(Box::new(stream));
                Ok(())
            }
            Err(err) => {
                self.read_err = Some(err.clone());
                self.write_err = Some(err.clone());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn channel_over(timeout: Duration) -> (Channel, tokio::io::DuplexStream) {
        let (ours, theirs) = duplex(1024);
        (Channel::new(Box::new(ours), timeout), theirs)
    }

    #[tokio::test]
    async fn lines_lose_their_terminators() {
        let (mut ch, mut peer) = channel_over(Duration::from_secs(5));
        peer.write_all(b"helo there\r\nnoop\nquit\r\n").await.unwrap();

        assert_eq!(ch.read_line().await.unwrap(), b"helo there");
        assert_eq!(ch.read_line().await.unwrap(), b"noop");
        assert_eq!(ch.read_line().await.unwrap(), b"quit");
    }

    #[tokio::test]
    async fn output_is_flushed_before_blocking_read() {
        let (mut ch, mut peer) = channel_over(Duration::from_secs(5));
        ch.out("220 hi\r\n");

        let reader = tokio::spawn(async move {
            let line = ch.read_line().await.unwrap();
            (ch, line)
        });

        let mut greeting = [0u8; 8];
        peer.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"220 hi\r\n");

        peer.write_all(b"quit\r\n").await.unwrap();
        let (_, line) = reader.await.unwrap();
        assert_eq!(line, b"quit");
    }

    #[tokio::test]
    async fn overlong_line_is_refused() {
        let (ours, mut peer) = duplex(64 * 1024);
        let mut ch = Channel::new(Box::new(ours), Duration::from_secs(5));

        let mut input = vec![b'a'; MAX_LINE];
        input.extend_from_slice(b"\r\n");
        input.extend(std::iter::repeat(b'b').take(MAX_LINE + 1));
        input.extend_from_slice(b"\r\nquit\r\n");
        peer.write_all(&input).await.unwrap();

        assert_eq!(ch.read_line().await.unwrap().len(), MAX_LINE);
        assert!(matches!(ch.read_line().await, Err(ChannelError::LineTooLong)));
        // the rest of the stream is not trusted any more
        assert!(matches!(ch.read_line().await, Err(ChannelError::LineTooLong)));
        assert!(matches!(ch.read_byte().await, Err(ChannelError::LineTooLong)));
    }

    #[tokio::test]
    async fn eof_is_sticky() {
        let (mut ch, peer) = channel_over(Duration::from_secs(5));
        drop(peer);

        assert!(matches!(ch.read_byte().await, Err(ChannelError::Closed)));
        assert!(matches!(ch.read_line().await, Err(ChannelError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_poisons_reads_but_not_writes() {
        let (mut ch, mut peer) = channel_over(Duration::from_secs(30));

        assert!(matches!(ch.read_line().await, Err(ChannelError::Timeout)));

        // data arriving late must not revive the read side
        peer.write_all(b"quit\r\n").await.unwrap();
        assert!(matches!(ch.read_line().await, Err(ChannelError::Timeout)));

        ch.out("451 timeout (#4.4.2)\r\n");
        ch.flush().await.unwrap();
        let mut reply = [0u8; 22];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"451 timeout (#4.4.2)\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn write_timeout_is_sticky() {
        // a 4 byte pipe nobody drains
        let (ours, _theirs) = duplex(4);
        let mut ch = Channel::new(Box::new(ours), Duration::from_secs(10));

        ch.out("220 a greeting longer than the pipe\r\n");
        assert!(matches!(ch.flush().await, Err(ChannelError::Timeout)));

        ch.out("221 bye\r\n");
        assert!(matches!(ch.flush().await, Err(ChannelError::Timeout)));
    }
}
