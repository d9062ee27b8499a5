// Copyright (c) 2026 The io-plumbing Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Blocking I/O over raw pipe descriptors.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use nix::unistd;

/// Chunk size for bucket spooling and collection.
pub(crate) const BUF_SIZE: usize = 8192;

/// A raw descriptor with blocking `Read`/`Write` and close-once
/// semantics. Dropping it closes the descriptor unless `close` was
/// already called.
pub(crate) struct StreamFd(RawFd);

impl StreamFd {
    pub(crate) fn new(fd: RawFd) -> Self {
        StreamFd(fd)
    }

    pub(crate) fn close(&mut self) -> io::Result<()> {
        if self.0 < 0 {
            return Ok(());
        }
        let fd = self.0;
        self.0 = -1;
        unistd::close(fd).map_err(Into::into)
    }
}

impl Read for StreamFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        unistd::read(self.0, buf).map_err(Into::into)
    }
}

impl Write for StreamFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        unistd::write(self.0, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for StreamFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for StreamFd {
    fn drop(&mut self) {
        self.close().ok();
    }
}

/// Accumulates bytes and hands them back one line at a time. The
/// trailing newline stays on the line; a final fragment without one is
/// returned by `take_rest`.
#[derive(Default)]
pub(crate) struct LineBuf {
    data: Vec<u8>,
    pos: usize,
}

impl LineBuf {
    pub(crate) fn new() -> Self {
        LineBuf::default()
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn next_line(&mut self) -> Option<String> {
        let nl = self.data[self.pos..].iter().position(|&b| b == b'\n')?;
        let end = self.pos + nl + 1;
        let line = String::from_utf8_lossy(&self.data[self.pos..end]).into_owned();
        self.pos = end;
        Some(line)
    }

    pub(crate) fn take_rest(&mut self) -> Option<String> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.data[self.pos..]).into_owned();
        self.pos = self.data.len();
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;

    #[test]
    fn test_streamfd_pipe() {
        let (rfd, wfd) = unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        let mut writer = StreamFd::new(wfd);
        let mut reader = StreamFd::new(rfd);

        writer.write_all(b"through the pipe").unwrap();
        writer.close().unwrap();

        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"through the pipe");
    }

    #[test]
    fn test_streamfd_close_is_idempotent() {
        let (rfd, _wfd) = unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        let mut s = StreamFd::new(rfd);
        s.close().unwrap();
        s.close().unwrap();
    }

    #[test]
    fn test_linebuf() {
        let mut lb = LineBuf::new();
        lb.extend(b"one\ntw");
        assert_eq!(lb.next_line().as_deref(), Some("one\n"));
        assert_eq!(lb.next_line(), None);
        lb.extend(b"o\nrest");
        assert_eq!(lb.next_line().as_deref(), Some("two\n"));
        assert_eq!(lb.next_line(), None);
        assert_eq!(lb.take_rest().as_deref(), Some("rest"));
        assert_eq!(lb.take_rest(), None);
    }
}
