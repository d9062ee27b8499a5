// Copyright (c) 2026 The io-plumbing Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Edge materialization.
//!
//! When a stage is about to run, each of its linked slots must end up
//! with a descriptor prepared for the child (or for the in-parent
//! helper of a fitting). A fitting that holds a ready-made character
//! device hands that descriptor over; every other edge gets exactly one
//! unix pipe, whichever side asks first.
//!
//! Descriptors the library creates carry the POSIX close-on-exec bit,
//! so an exec'd child keeps only what was dup2'ed onto fds 0/1/2. The
//! close-on-exec-in-parent flag tracked per descriptor is a separate,
//! library-level rule: it marks descriptors the parent must close right
//! after the holding stage forks. A non-forking holder leaves its end
//! open, because the parent itself still has to pour or collect through
//! it.

use std::rc::Rc;

use nix::fcntl::OFlag;
use nix::unistd;
use slog::trace;

use crate::error::{Error, Result};
use crate::stage::{Slot, Stage};

/// Prepare the descriptor for `slot`, negotiating with the peer on the
/// other end of the edge. Idempotent: an edge the peer already
/// materialized is left alone.
pub(crate) fn materialize(stage: &Stage, slot: Slot) -> Result<()> {
    let (peer_rc, peer_slot) = match stage.inner.borrow().peer(slot) {
        Some(p) => p,
        None => return Ok(()),
    };
    if stage.inner.borrow().fds.contains_key(&slot.fd_num()) {
        return Ok(());
    }
    let peer = Stage::from_rc(peer_rc);

    // stderr sharing its sink with stdout reuses the same prepared
    // descriptor; the child dup2s it onto both 1 and 2.
    if slot == Slot::Stderr {
        let reuse = {
            let inner = stage.inner.borrow();
            match inner.peer(Slot::Output) {
                Some((out_rc, _)) if Rc::ptr_eq(&out_rc, &peer.inner) => {
                    inner.fds.get(&Slot::Output.fd_num()).cloned()
                }
                _ => None,
            }
        };
        if let Some(fd) = reuse {
            let mut inner = stage.inner.borrow_mut();
            trace!(inner.logger, "stderr shares stdout descriptor"; "fd" => fd);
            inner.fds.insert(Slot::Stderr.fd_num(), fd);
            return Ok(());
        }
    }

    // The peer side of this edge may have done all the work already,
    // whether by claiming our ready-made descriptor or by creating the
    // pipe itself.
    if peer.inner.borrow().fds.contains_key(&peer_slot.fd_num()) {
        return Ok(());
    }

    if !peer.inner.borrow().needs_pipe(peer_slot) {
        let fd = peer.inner.borrow_mut().fd_pair(peer_slot)?;
        let forks = stage.inner.borrow().needs_fork();
        stage.inner.borrow_mut().set_fd(slot.fd_num(), fd, forks);
        return Ok(());
    }

    if !stage.inner.borrow().needs_pipe(slot) {
        let fd = stage.inner.borrow_mut().fd_pair(slot)?;
        let forks = peer.inner.borrow().needs_fork();
        peer.inner.borrow_mut().set_fd(peer_slot.fd_num(), fd, forks);
        return Ok(());
    }

    // Both sides want a pipe end: the input side reads, the other
    // writes.
    let (r, w) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::Resource {
        context: "pipe".to_string(),
        source: e,
    })?;
    let (keep, give) = if slot.is_input() { (r, w) } else { (w, r) };
    let self_forks = stage.inner.borrow().needs_fork();
    let peer_forks = peer.inner.borrow().needs_fork();
    stage
        .inner
        .borrow_mut()
        .set_fd(slot.fd_num(), keep, self_forks);
    peer.inner
        .borrow_mut()
        .set_fd(peer_slot.fd_num(), give, peer_forks);
    Ok(())
}
