//! The DATA phase: undo dot-stuffing, count trace headers and stream the
//! message into the queue.

use thiserror::Error;

use crate::channel::{Channel, ChannelError};
use crate::queue::QueueHandle;

/// A message carrying this many `Received:`/`Delivered-To:` lines is looping.
pub const MAX_HOPS: u32 = 100;

#[derive(Debug, Error)]
pub enum BlastError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("bare LF in message body")]
    StrayNewline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DotState {
    Plain,
    /// Start of a line; the initial state.
    AfterCrlf,
    AfterCrlfDot,
    AfterCrlfDotCr,
    AfterCr,
}

/// Counts trace lines in the header block, which ends at the first empty line.
#[derive(Debug, Clone)]
struct HeaderScan {
    in_header: bool,
    pos: usize,
    maybe_received: bool,
    maybe_crlf: bool,
    maybe_delivered: bool,
}

impl Default for HeaderScan {
    fn default() -> Self {
        Self {
            in_header: true,
            pos: 0,
            maybe_received: true,
            maybe_crlf: true,
            maybe_delivered: true,
        }
    }
}

impl HeaderScan {
    /// Returns the number of hops completed by `ch`.
    fn scan(&mut self, ch: u8) -> u32 {
        if !self.in_header {
            return 0;
        }
        let mut hops = 0;
        if self.pos < 9 {
            if !b"delivered"[self.pos].eq_ignore_ascii_case(&ch) {
                self.maybe_delivered = false;
            }
            if self.maybe_delivered && self.pos == 8 {
                hops += 1;
            }
            if self.pos < 8 && !b"received"[self.pos].eq_ignore_ascii_case(&ch) {
                self.maybe_received = false;
            }
            if self.maybe_received && self.pos == 7 {
                hops += 1;
            }
            if self.pos < 2 && ch != b"\r\n"[self.pos] {
                self.maybe_crlf = false;
            }
            if self.maybe_crlf && self.pos == 1 {
                self.in_header = false;
            }
        }
        self.pos += 1;
        if ch == b'\n' {
            self.pos = 0;
            self.maybe_received = true;
            self.maybe_crlf = true;
            self.maybe_delivered = true;
        }
        hops
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    More,
    /// The terminating `CRLF.CRLF` was seen.
    Done,
    StrayNewline,
}

/// Byte-at-a-time decoder for the SMTP DATA stream.
///
/// Output uses bare LF line endings with the leading dot of stuffed lines
/// removed; the terminating `.CRLF` never reaches `out`.
#[derive(Debug, Clone)]
pub struct Blaster {
    dot: DotState,
    header: HeaderScan,
    hops: u32,
}

impl Default for Blaster {
    fn default() -> Self {
        Self {
            dot: DotState::AfterCrlf,
            header: HeaderScan::default(),
            hops: 0,
        }
    }
}

impl Blaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hops(&self) -> u32 {
        self.hops
    }

    pub fn feed(&mut self, ch: u8, out: &mut Vec<u8>) -> Feed {
        self.hops += self.header.scan(ch);

        match self.dot {
            DotState::Plain => {
                if ch == b'\n' {
                    return Feed::StrayNewline;
                }
                if ch == b'\r' {
                    self.dot = DotState::AfterCr;
                    return Feed::More;
                }
            }
            DotState::AfterCrlf => {
                match ch {
                    b'\n' => return Feed::StrayNewline,
                    b'.' => {
                        self.dot = DotState::AfterCrlfDot;
                        return Feed::More;
                    }
                    b'\r' => {
                        self.dot = DotState::AfterCr;
                        return Feed::More;
                    }
                    _ => self.dot = DotState::Plain,
                }
            }
            DotState::AfterCrlfDot => {
                match ch {
                    b'\n' => return Feed::StrayNewline,
                    b'\r' => {
                        self.dot = DotState::AfterCrlfDotCr;
                        return Feed::More;
                    }
                    _ => self.dot = DotState::Plain,
                }
            }
            DotState::AfterCrlfDotCr => {
                if ch == b'\n' {
                    return Feed::Done;
                }
                out.extend_from_slice(b".\r");
                if ch == b'\r' {
                    self.dot = DotState::AfterCr;
                    return Feed::More;
                }
                self.dot = DotState::Plain;
            }
            DotState::AfterCr => {
                if ch == b'\n' {
                    self.dot = DotState::AfterCrlf;
                } else if ch != b'\r' {
                    out.push(b'\r');
                    self.dot = DotState::Plain;
                }
            }
        }

        out.push(ch);
        Feed::More
    }
}

/// Size limit for one message. A limit of zero means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    limited: bool,
    left: u64,
}

impl Budget {
    pub fn new(databytes: u64) -> Self {
        Self {
            limited: databytes != 0,
            left: databytes.saturating_add(1),
        }
    }

    /// Account for one byte. True exactly once, on the byte past the limit.
    pub fn spend(&mut self) -> bool {
        if !self.limited || self.left == 0 {
            return false;
        }
        self.left -= 1;
        self.left == 0
    }

    pub fn exhausted(&self) -> bool {
        self.limited && self.left == 0
    }
}

/// Copy the message from `ch` into `qq` up to the end-of-data marker and
/// return the hop count. Once the budget runs out the queue is failed but
/// input keeps being drained.
pub async fn blast(
    ch: &mut Channel,
    qq: &mut QueueHandle,
    budget: &mut Budget,
) -> Result<u32, BlastError> {
    let mut blaster = Blaster::new();
    let mut out = Vec::with_capacity(3);
    loop {
        let byte = ch.read_byte().await?;
        out.clear();
        match blaster.feed(byte, &mut out) {
            Feed::More => {}
            Feed::Done => return Ok(blaster.hops()),
            Feed::StrayNewline => return Err(BlastError::StrayNewline),
        }
        for &b in &out {
            if budget.spend() {
                qq.fail();
            }
            qq.put(b).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode(input: &[u8]) -> (Feed, Vec<u8>, u32) {
        let mut blaster = Blaster::new();
        let mut out = Vec::new();
        for &ch in input {
            match blaster.feed(ch, &mut out) {
                Feed::More => {}
                other => return (other, out, blaster.hops()),
            }
        }
        (Feed::More, out, blaster.hops())
    }

    #[test]
    fn message_ends_at_lone_dot() {
        let (feed, out, hops) = decode(b"Subject: Hello\r\n\r\nHello, Masha!\r\n.\r\nquit\r\n");
        assert_eq!(feed, Feed::Done);
        assert_eq!(out, b"Subject: Hello\n\nHello, Masha!\n");
        assert_eq!(hops, 0);
    }

    #[test]
    fn empty_message() {
        let (feed, out, _) = decode(b".\r\n");
        assert_eq!(feed, Feed::Done);
        assert!(out.is_empty());
    }

    #[test]
    fn dot_stuffing_is_undone() {
        let (feed, out, _) = decode(b"..leading\r\n.x\r\n..\r\n.\r\n");
        assert_eq!(feed, Feed::Done);
        assert_eq!(out, b".leading\nx\n.\n");
    }

    #[test]
    fn dot_cr_without_lf_is_kept() {
        let (feed, out, _) = decode(b".\rx\r\n.\r\r\n.\r\n");
        assert_eq!(feed, Feed::Done);
        assert_eq!(out, b".\rx\n.\r\n");
    }

    #[test]
    fn bare_cr_is_kept() {
        let (feed, out, _) = decode(b"a\rb\r\r\n.\r\n");
        assert_eq!(feed, Feed::Done);
        assert_eq!(out, b"a\rb\r\n");
    }

    #[test]
    fn stray_newlines() {
        let inputs: [&[u8]; 5] = [b"Subject: x\n", b"\n", b".\n", b"a\r\n\n", b"a\r\n.\n"];
        for input in inputs {
            let (feed, _, _) = decode(input);
            assert_eq!(feed, Feed::StrayNewline, "{input:?}");
        }
    }

    #[test]
    fn hops_are_counted_in_header_only() {
        let msg = b"Received: from a\r\n\
                    RECEIVED: from b\r\n\
                    Delivered-To: joe\r\n\
                    X-Received: no\r\n\
                    Receive: no\r\n\
                    \r\n\
                    Received: in body\r\n\
                    .\r\n";
        let (feed, _, hops) = decode(msg);
        assert_eq!(feed, Feed::Done);
        assert_eq!(hops, 3);
    }

    #[test]
    fn budget() {
        let mut unlimited = Budget::new(0);
        assert!((0..10_000).all(|_| !unlimited.spend()));
        assert!(!unlimited.exhausted());

        let mut b = Budget::new(3);
        assert!(!b.spend());
        assert!(!b.spend());
        assert!(!b.spend());
        assert!(!b.exhausted());
        assert!(b.spend());
        assert!(b.exhausted());
        assert!(!b.spend());
        assert!(b.exhausted());
    }
}
