// Copyright (c) 2026 The io-plumbing Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Fittings: plug, vent, bucket, hose and prng.
//!
//! A fitting sources or sinks data without running a program of its
//! own. Plug, vent, bucket and hose have at most one active data
//! direction, fixed by whichever slot is linked first; binding the
//! opposite direction afterwards is a configuration error. A prng is
//! the exception: with only its output bound it is an entropy source,
//! and with its input bound it stands in for an encryption command that
//! it forks, whose result flows out of its output side.
//!
//! Caveat on shared buckets: when two producers feed one filling bucket,
//! writes smaller than the kernel pipe-buffer atom (at least 4 KiB on
//! POSIX) arrive unbroken, but larger writes may interleave. The library
//! does not prevent this.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use slog::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::pipestream::{LineBuf, StreamFd, BUF_SIZE};
use crate::shellwords;
use crate::stage::{Inner, Kind, Slot, Stage};

pub(crate) const DEV_NULL: &str = "/dev/null";
pub(crate) const DEV_ZERO: &str = "/dev/zero";
pub(crate) const DEV_FULL: &str = "/dev/full";
pub(crate) const DEV_URANDOM: &str = "/dev/urandom";

/// What a prng sink runs when nothing else is configured.
pub(crate) const DEFAULT_ENCRYPT_COMMAND: &str = "gpg --batch --encrypt --default-recipient-self";

pub(crate) struct BucketState {
    pub(crate) buf: Vec<u8>,
    /// `getline` cursor into `buf`.
    pub(crate) pos: usize,
    pub(crate) collect_max: Option<usize>,
    pub(crate) truncated: bool,
    pub(crate) warning: Option<String>,
    pub(crate) drained: bool,
    pub(crate) spooled: bool,
}

impl BucketState {
    pub(crate) fn new() -> Self {
        BucketState::with_buf(Vec::new())
    }

    pub(crate) fn with_buf(buf: Vec<u8>) -> Self {
        BucketState {
            buf,
            pos: 0,
            collect_max: None,
            truncated: false,
            warning: None,
            drained: false,
            spooled: false,
        }
    }
}

pub(crate) struct HoseState {
    /// Ready-made descriptor for the peer (path and handle hoses).
    pub(crate) file: Option<File>,
    /// The user-facing pipe end, once claimed out of the fd table.
    pub(crate) user: Option<File>,
    pub(crate) lines: LineBuf,
}

impl HoseState {
    pub(crate) fn new() -> Self {
        HoseState {
            file: None,
            user: None,
            lines: LineBuf::new(),
        }
    }

    pub(crate) fn with_file(file: File) -> Self {
        // The descriptor must not leak into children of other stages.
        let _ = fcntl::fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC));
        HoseState {
            file: Some(file),
            user: None,
            lines: LineBuf::new(),
        }
    }
}

pub(crate) struct PrngState {
    pub(crate) encrypt: Vec<String>,
}

impl PrngState {
    pub(crate) fn new() -> Self {
        PrngState {
            encrypt: DEFAULT_ENCRYPT_COMMAND
                .split_whitespace()
                .map(String::from)
                .collect(),
        }
    }
}

/// Reject a link that would violate a fitting's orientation rule.
pub(crate) fn check_bind(inner: &Inner, slot: Slot) -> Result<()> {
    if !inner.kind.is_fitting() {
        return Ok(());
    }
    if slot == Slot::Stderr {
        return Err(Error::Configuration(format!(
            "{}: a fitting has no stderr to plumb",
            inner.name()
        )));
    }
    // A prng may carry both sides: a bound input turns it into its
    // encryption command, whose output flows on downstream.
    if matches!(inner.kind, Kind::Prng(_)) {
        return Ok(());
    }
    let other = if slot.is_input() {
        Slot::Output
    } else {
        Slot::Input
    };
    if inner.bound(other) {
        return Err(Error::Configuration(format!(
            "{}: {} side already bound",
            inner.name(),
            other.label()
        )));
    }
    Ok(())
}

impl Inner {
    /// Whether an edge landing on `slot` needs a unix pipe, or this
    /// fitting holds a ready-made character-device descriptor for it.
    pub(crate) fn needs_pipe(&self, slot: Slot) -> bool {
        match self.kind {
            Kind::Plug | Kind::Vent => false,
            // The entropy device serves a pure source; a sink forks its
            // encryption command, and everything around it is piped.
            Kind::Prng(_) => slot.is_input() || self.bound(Slot::Input),
            Kind::Hose(ref h) => h.file.is_none(),
            _ => true,
        }
    }

    /// Surrender the ready-made descriptor for `slot`. Only valid when
    /// `needs_pipe(slot)` is false; a hose's descriptor can be claimed
    /// once.
    pub(crate) fn fd_pair(&mut self, slot: Slot) -> Result<RawFd> {
        let name = self.name();
        let (path, flags) = match (&mut self.kind, slot) {
            (Kind::Plug, Slot::Output) => (DEV_NULL, OFlag::O_RDONLY),
            (Kind::Plug, Slot::Input) => (DEV_FULL, OFlag::O_WRONLY),
            (Kind::Vent, Slot::Output) => (DEV_ZERO, OFlag::O_RDONLY),
            (Kind::Vent, Slot::Input) => (DEV_NULL, OFlag::O_WRONLY),
            (Kind::Prng(_), Slot::Output) => (DEV_URANDOM, OFlag::O_RDONLY),
            (Kind::Hose(h), _) => {
                let file = h.file.take().ok_or_else(|| {
                    Error::Configuration("hose descriptor already claimed".to_string())
                })?;
                return Ok(file.into_raw_fd());
            }
            _ => {
                return Err(Error::Configuration(format!(
                    "{}: no ready-made descriptor for {}",
                    name,
                    slot.label()
                )))
            }
        };
        let fd = fcntl::open(path, flags | OFlag::O_CLOEXEC, Mode::empty()).map_err(|e| {
            Error::Resource {
                context: format!("open {}", path),
                source: e,
            }
        })?;
        trace!(self.logger, "device descriptor"; "path" => path, "fd" => fd);
        Ok(fd)
    }
}

fn bucket_err(inner: &Inner) -> Error {
    Error::Configuration(format!("{} is not a bucket", inner.name()))
}

fn hose_err(inner: &Inner) -> Error {
    Error::Configuration(format!("{} is not a hose", inner.name()))
}

impl Stage {
    pub(crate) fn is_pouring_bucket(&self) -> bool {
        let inner = self.inner.borrow();
        matches!(inner.kind, Kind::Bucket(_)) && inner.orientation() == Some(Slot::Output)
    }

    pub(crate) fn is_filling_bucket(&self) -> bool {
        let inner = self.inner.borrow();
        matches!(inner.kind, Kind::Bucket(_)) && inner.orientation() == Some(Slot::Input)
    }

    /// Cap how many bytes a filling bucket collects. On exceeding the
    /// cap the bucket truncates, warns once naming the upstream command,
    /// and closes its read end.
    pub fn collect_max(&self, max: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.kind {
            Kind::Bucket(ref mut b) => {
                b.collect_max = Some(max);
                Ok(())
            }
            _ => Err(bucket_err(&inner)),
        }
    }

    /// Whether a filling bucket hit its `collect_max`.
    pub fn truncated(&self) -> bool {
        match self.inner.borrow().kind {
            Kind::Bucket(ref b) => b.truncated,
            _ => false,
        }
    }

    /// The truncation warning, if one was emitted.
    pub fn warning(&self) -> Option<String> {
        match self.inner.borrow().kind {
            Kind::Bucket(ref b) => b.warning.clone(),
            _ => None,
        }
    }

    /// A bucket's collected or pre-loaded bytes. Forces the upstream
    /// chain to execute and be waited on first.
    pub fn contents(&self) -> Result<Vec<u8>> {
        {
            let inner = self.inner.borrow();
            if !matches!(inner.kind, Kind::Bucket(_)) {
                return Err(bucket_err(&inner));
            }
        }
        self.wait()?;
        match self.inner.borrow().kind {
            Kind::Bucket(ref b) => Ok(b.buf.clone()),
            _ => unreachable!(),
        }
    }

    /// One line at a time out of a filling bucket or a sucking hose.
    /// Returns `None` after the last line.
    pub fn getline(&self) -> Result<Option<String>> {
        let is_bucket = matches!(self.inner.borrow().kind, Kind::Bucket(_));
        if is_bucket {
            self.wait()?;
            let mut inner = self.inner.borrow_mut();
            let b = match inner.kind {
                Kind::Bucket(ref mut b) => b,
                _ => unreachable!(),
            };
            if b.pos >= b.buf.len() {
                return Ok(None);
            }
            let end = match b.buf[b.pos..].iter().position(|&c| c == b'\n') {
                Some(i) => b.pos + i + 1,
                None => b.buf.len(),
            };
            let line = String::from_utf8_lossy(&b.buf[b.pos..end]).into_owned();
            b.pos = end;
            return Ok(Some(line));
        }
        self.hose_getline()
    }

    /// Write into a gushing hose. The peer sees the bytes on its stdin.
    pub fn print(&self, text: &str) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        ensure_user_end(&mut inner)?;
        let user = match inner_hose(&mut inner).user.as_mut() {
            Some(user) => user,
            None => return Err(Error::Configuration("hose already closed".to_string())),
        };
        user.write_all(text.as_bytes()).map_err(|e| Error::Io {
            context: "hose write".to_string(),
            source: e,
        })
    }

    /// Close the user-facing end of a hose. A gushing peer sees EOF.
    /// Closing an unclaimed or already-closed hose is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !matches!(inner.kind, Kind::Hose(_)) {
            return Err(hose_err(&inner));
        }
        let _ = ensure_user_end(&mut inner);
        inner_hose(&mut inner).user = None;
        Ok(())
    }

    /// Take ownership of the hose's user-facing end.
    pub fn take_handle(&self) -> Result<File> {
        let mut inner = self.inner.borrow_mut();
        ensure_user_end(&mut inner)?;
        inner_hose(&mut inner)
            .user
            .take()
            .ok_or_else(|| Error::Configuration("hose handle already taken".to_string()))
    }

    /// Replace the command a prng sink delegates to.
    pub fn set_encrypt_command(&self, line: &str) -> Result<()> {
        let words = shellwords::unquote(line)?;
        if words.is_empty() {
            return Err(Error::Configuration("empty encrypt command".to_string()));
        }
        let mut inner = self.inner.borrow_mut();
        match inner.kind {
            Kind::Prng(ref mut p) => {
                p.encrypt = words;
                Ok(())
            }
            _ => Err(Error::Configuration(format!(
                "{} is not a prng",
                inner.name()
            ))),
        }
    }

    fn hose_getline(&self) -> Result<Option<String>> {
        {
            let mut inner = self.inner.borrow_mut();
            ensure_user_end(&mut inner)?;
        }
        let mut chunk = [0u8; BUF_SIZE];
        loop {
            let mut inner = self.inner.borrow_mut();
            let h = inner_hose(&mut inner);
            if let Some(line) = h.lines.next_line() {
                return Ok(Some(line));
            }
            let user = match h.user.as_mut() {
                Some(f) => f,
                None => return Ok(h.lines.take_rest()),
            };
            let n = match user.read(&mut chunk) {
                Ok(n) => n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::Io {
                        context: "hose read".to_string(),
                        source: e,
                    })
                }
            };
            if n == 0 {
                return Ok(h.lines.take_rest());
            }
            h.lines.extend(&chunk[..n]);
        }
    }
}

fn inner_hose(inner: &mut Inner) -> &mut HoseState {
    match inner.kind {
        Kind::Hose(ref mut h) => h,
        _ => unreachable!(),
    }
}

/// Pull the user-facing pipe end out of the fd table on first use.
/// Gushing: the peer reads our fd 1 pipe and the user writes. Sucking:
/// the peer writes our fd 0 pipe and the user reads.
fn ensure_user_end(inner: &mut Inner) -> Result<()> {
    let name = inner.name();
    let orientation = inner.orientation();
    let already = match inner.kind {
        Kind::Hose(ref h) => h.user.is_some(),
        _ => return Err(Error::Configuration(format!("{} is not a hose", name))),
    };
    if already {
        return Ok(());
    }
    let fd_num = match orientation {
        Some(slot) => slot.fd_num(),
        None => {
            return Err(Error::Configuration(format!(
                "{}: not connected to a stage",
                name
            )))
        }
    };
    let fd = inner
        .fds
        .remove(&fd_num)
        .ok_or_else(|| Error::Configuration(format!("{}: not plumbed yet", name)))?;
    inner.owned.remove(&fd);
    inner_hose(inner).user = Some(unsafe { File::from_raw_fd(fd) });
    Ok(())
}

/// Drain a filling bucket's read end into its buffer, honoring
/// `collect_max`. Runs in the parent; blocking here is the designed
/// suspension point.
pub(crate) fn collect(stage: &Stage) -> Result<()> {
    let (fd, max, upstream) = {
        let mut inner = stage.inner.borrow_mut();
        let (drained, max) = match inner.kind {
            Kind::Bucket(ref b) => (b.drained, b.collect_max),
            _ => return Err(bucket_err(&inner)),
        };
        if drained {
            return Ok(());
        }
        let fd = inner.fds.remove(&Slot::Input.fd_num());
        if let Some(fd) = fd {
            inner.owned.remove(&fd);
        }
        let upstream = inner
            .peer(Slot::Input)
            .map(|(rc, _)| {
                let peer = rc.borrow();
                let cmd = peer.command_string();
                if cmd.is_empty() {
                    peer.name()
                } else {
                    cmd
                }
            })
            .unwrap_or_else(|| "?".to_string());
        (fd, max, upstream)
    };

    let mut collected = Vec::new();
    let mut truncated = false;
    if let Some(fd) = fd {
        let mut src = StreamFd::new(fd);
        let mut chunk = [0u8; BUF_SIZE];
        loop {
            let n = match src.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::Io {
                        context: "bucket read".to_string(),
                        source: e,
                    })
                }
            };
            let room = match max {
                Some(max) => max.saturating_sub(collected.len()),
                None => n,
            };
            collected.extend_from_slice(&chunk[..n.min(room)]);
            if n > room {
                truncated = true;
                break;
            }
        }
        // src drops here, closing the read end; a still-writing
        // upstream takes SIGPIPE.
    }

    let mut inner = stage.inner.borrow_mut();
    if truncated {
        let max = max.unwrap_or(0);
        let text = format!(
            "bucket(filling): not spooling more than {} bytes from `{}`",
            max, upstream
        );
        warn!(inner.logger, "{}", text);
        if let Kind::Bucket(ref mut b) = inner.kind {
            b.truncated = true;
            b.warning = Some(text);
        }
    }
    if let Kind::Bucket(ref mut b) = inner.kind {
        b.buf = collected;
        b.drained = true;
    }
    Ok(())
}

/// Pour a bucket's buffer into its pipe and close the write end. Must
/// run after the consumer has forked, so the kernel has somewhere to
/// deliver the bytes.
pub(crate) fn spool(stage: &Stage) -> Result<()> {
    let (fd, data) = {
        let mut inner = stage.inner.borrow_mut();
        let (spooled, data) = match inner.kind {
            Kind::Bucket(ref b) => (b.spooled, b.buf.clone()),
            _ => return Err(bucket_err(&inner)),
        };
        if spooled {
            return Ok(());
        }
        let fd = inner.fds.remove(&Slot::Output.fd_num());
        if let Some(fd) = fd {
            inner.owned.remove(&fd);
        }
        (fd, data)
    };

    if let Some(fd) = fd {
        let mut dst = StreamFd::new(fd);
        match dst.write_all(&data) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(stage.inner.borrow().logger, "consumer went away while pouring");
            }
            Err(e) => {
                return Err(Error::Io {
                    context: "bucket write".to_string(),
                    source: e,
                })
            }
        }
    }

    let mut inner = stage.inner.borrow_mut();
    if let Kind::Bucket(ref mut b) = inner.kind {
        b.spooled = true;
    }
    Ok(())
}

/// A prng whose input side is bound runs its encryption command; give
/// it an argv if the user never set one.
pub(crate) fn resolve_prng(inner: &mut Inner) {
    let words = match inner.kind {
        Kind::Prng(ref p) if inner.program.is_none() => p.encrypt.clone(),
        _ => return,
    };
    if !inner.bound(Slot::Input) {
        return;
    }
    inner.program = Some(words[0].clone());
    inner.args = words[1..].to_vec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_plug_fd_pair_reads_eof() {
        let plug = Stage::plug();
        let fd = plug.inner.borrow_mut().fd_pair(Slot::Output).unwrap();
        let mut f = StreamFd::new(fd);
        let mut buf = [0u8; 8];
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_vent_fd_pair_reads_nuls() {
        let vent = Stage::vent();
        let fd = vent.inner.borrow_mut().fd_pair(Slot::Output).unwrap();
        let mut f = StreamFd::new(fd);
        let mut buf = [1u8; 16];
        assert_eq!(f.read(&mut buf).unwrap(), 16);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_plug_sink_rejects_writes() {
        let plug = Stage::plug();
        let fd = plug.inner.borrow_mut().fd_pair(Slot::Input).unwrap();
        let mut f = StreamFd::new(fd);
        assert!(f.write_all(b"x").is_err());
    }

    #[test]
    fn test_vent_sink_discards() {
        let vent = Stage::vent();
        let fd = vent.inner.borrow_mut().fd_pair(Slot::Input).unwrap();
        let mut f = StreamFd::new(fd);
        f.write_all(b"into the void").unwrap();
    }

    #[test]
    fn test_prng_source_device() {
        let prng = Stage::prng();
        assert!(!prng.inner.borrow().needs_pipe(Slot::Output));
        let fd = prng.inner.borrow_mut().fd_pair(Slot::Output).unwrap();
        let mut f = StreamFd::new(fd);
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf).unwrap(), 16);
    }

    #[test]
    fn test_prng_sink_forks_encrypt_command() {
        let prng = Stage::prng();
        prng.set_encrypt_command("cat -u").unwrap();
        Stage::program("dd").output(&prng).unwrap();
        assert!(prng.inner.borrow().needs_fork());
        let mut inner = prng.inner.borrow_mut();
        resolve_prng(&mut inner);
        assert_eq!(inner.program.as_deref(), Some("cat"));
        assert_eq!(inner.args, &["-u"]);
    }

    #[test]
    fn test_collect_max_only_on_buckets() {
        assert!(Stage::bucket().collect_max(10).is_ok());
        assert!(Stage::plug().collect_max(10).is_err());
    }

    #[test]
    fn test_hose_file_claimed_once() {
        let f = tempfile::tempfile().unwrap();
        let hose = Stage::hose_from_file(f);
        assert!(!hose.inner.borrow().needs_pipe(Slot::Output));
        hose.inner.borrow_mut().fd_pair(Slot::Output).unwrap();
        assert!(hose.inner.borrow_mut().fd_pair(Slot::Output).is_err());
    }
}
