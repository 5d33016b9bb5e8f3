use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Escape peer bytes for log output. Bytes outside printable ASCII print
/// as `\xNN` instead of being guessed at.
pub fn safe_log_bytes(input: &[u8]) -> String {
    let mut result = String::with_capacity(input.len());
    for &b in input {
        match b {
            0 => result.push_str("\\0"),
            b'\r' => result.push_str("\\r"),
            b'\n' => result.push_str("\\n"),
            _ if b.is_ascii_graphic() || b == b' ' || b == b'\t' => result.push(b as char),
            _ => result.push_str(&format!("\\x{:02x}", b)),
        }
    }
    result
}

/// A close-on-exec pipe as `(read end, write end)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    // O_CLOEXEC is set atomically so a child spawned by another task cannot
    // inherit the descriptors in between.
    // SAFETY: fds points at two writable ints.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2(2) just handed us both descriptors.
    let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((rd, wr))
}

/// Make `fd` available as `target` across exec. Meant for `pre_exec`
/// hooks, so it sticks to async-signal-safe calls.
pub fn dup_onto(fd: RawFd, target: RawFd) -> io::Result<()> {
    if fd == target {
        // SAFETY: plain fcntl on a descriptor we were handed.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }
    // SAFETY: dup2 has no memory safety requirements; the result is checked.
    if unsafe { libc::dup2(fd, target) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn raw_bytes_are_escaped() {
        assert_eq!(safe_log_bytes(b"mail from:<j\xf6rg@x>\r\n"), "mail from:<j\\xf6rg@x>\\r\\n");
        assert_eq!(safe_log_bytes(b"a\0b\x1b"), "a\\0b\\x1b");
    }

    #[test]
    fn pipe_is_close_on_exec() {
        let (rd, wr) = pipe().unwrap();
        for fd in [rd.as_raw_fd(), wr.as_raw_fd()] {
            // SAFETY: fd is open for the duration of the call.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert_ne!(flags, -1);
            assert_ne!(flags & libc::FD_CLOEXEC, 0, "fd {fd}");
        }
    }

    #[test]
    fn pipe_carries_bytes() {
        let (rd, wr) = pipe().unwrap();
        let mut wr = File::from(wr);
        wr.write_all(b"F\0").unwrap();
        drop(wr);

        let mut got = Vec::new();
        File::from(rd).read_to_end(&mut got).unwrap();
        assert_eq!(got, b"F\0");
    }
}
