// Copyright (c) 2026 The io-plumbing Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Pipeline execution.
//!
//! `execute` walks from the invoked stage to the head of its chain,
//! then forks each forking stage in order back down toward the tail,
//! materializing descriptors just before each fork. `wait` reaps one
//! stage and then its whole upstream chain; `reap` opportunistically
//! drains any finished child.
//!
//! The pid -> stage table is thread-local: stages are reference-counted
//! single-threaded values, and the library performs no locking of its
//! own. A port that shares stages across threads must re-home this
//! table behind a lock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Weak;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use slog::{debug, warn};

use crate::error::{Error, Result};
use crate::fitting;
use crate::plumbing;
use crate::stage::{Inner, Slot, Stage, Status};

thread_local! {
    static RUNNING: RefCell<HashMap<libc::pid_t, Weak<RefCell<Inner>>>> =
        RefCell::new(HashMap::new());
}

fn register_running(pid: libc::pid_t, stage: Weak<RefCell<Inner>>) {
    RUNNING.with(|t| {
        t.borrow_mut().insert(pid, stage);
    });
}

fn unregister_running(pid: libc::pid_t) {
    RUNNING.with(|t| {
        t.borrow_mut().remove(&pid);
    });
}

fn lookup_running(pid: libc::pid_t) -> Option<Weak<RefCell<Inner>>> {
    RUNNING.with(|t| t.borrow().get(&pid).cloned())
}

/// Raw wait status -> the library's rc encoding: signal number in the
/// low bits, exit code in the high byte. Matches the POSIX W* macros.
fn encode_wait_status(ws: WaitStatus) -> Option<i32> {
    match ws {
        WaitStatus::Exited(_, code) => Some((code & 0xff) << 8),
        WaitStatus::Signaled(_, sig, _) => Some(sig as i32 & 0x7f),
        _ => None,
    }
}

/// Human-readable failure, or `None` for a clean exit.
pub(crate) fn decode_status(rc: i32) -> Option<String> {
    if rc == 0 {
        return None;
    }
    if rc < 0 {
        return Some("lost child".to_string());
    }
    let sig = rc & 0x7f;
    if sig != 0 {
        Some(format!("killed by signal {}", sig))
    } else {
        Some(format!("exited with error code {}", (rc >> 8) & 0xff))
    }
}

/// Drain finished children without blocking: a `waitpid(-1, WNOHANG)`
/// loop over the running table, at most `max` children when given.
/// Returns how many were reaped. Children the table does not know are
/// noted and skipped.
pub fn reap(max: Option<usize>) -> usize {
    let mut reaped = 0;
    loop {
        if let Some(max) = max {
            if reaped >= max {
                return reaped;
            }
        }
        let ws = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return reaped,
            Ok(ws) => ws,
            Err(Errno::EINTR) => continue,
            Err(_) => return reaped,
        };
        let pid = match ws.pid() {
            Some(pid) => pid.as_raw(),
            None => return reaped,
        };
        let rc = match encode_wait_status(ws) {
            Some(rc) => rc,
            None => continue, // stopped or continued, not an exit
        };
        reaped += 1;
        match lookup_running(pid).and_then(|w| w.upgrade()) {
            Some(rc_inner) => {
                let mut inner = rc_inner.borrow_mut();
                inner.rc = Some(rc);
                inner.transition(Status::Done);
                debug!(inner.logger, "reaped"; "pid" => pid, "rc" => rc);
            }
            None => {
                debug!(crate::root_logger(), "reaped a child no stage claims"; "pid" => pid);
            }
        }
        unregister_running(pid);
    }
}

impl Stage {
    fn fork_state(&self) -> (bool, bool) {
        let inner = self.inner.borrow();
        (inner.needs_fork(), inner.started())
    }

    /// Start the pipeline this stage belongs to. Walks upstream to the
    /// head first, then forks back down the output chain. Safe to call
    /// again once running.
    pub fn execute(&self) -> Result<()> {
        {
            let inner = self.inner.borrow();
            if inner.started() {
                return Ok(());
            }
            if inner.status == Status::Error {
                return Err(Error::Configuration(format!(
                    "{} is not executable",
                    inner.name()
                )));
            }
        }

        // Head-walk: a forking upstream stage runs first and forks the
        // chain back down through us. Fittings never become Running, so
        // the walk must not descend into them.
        if let Some(up) = self.input_peer() {
            if up.status() == Status::Error {
                return Err(Error::Configuration(format!(
                    "{} is not executable",
                    up.name()
                )));
            }
            let (forks, started) = up.fork_state();
            if forks && !started {
                return up.execute();
            }
        }

        self.resolve_defaults()?;

        // Input first: pipes feeding this stage exist before it forks.
        for slot in Slot::ALL.iter() {
            plumbing::materialize(self, *slot)?;
        }

        let taken_hook = self.inner.borrow_mut().pre_fork.take();
        if let Some(mut hook) = taken_hook {
            let result = hook();
            self.inner.borrow_mut().pre_fork = Some(hook);
            result.map_err(|e| Error::Hook {
                context: "pre_fork",
                cause: e,
            })?;
        }

        if self.fork_state().0 {
            self.fork_child()?;
        } else {
            self.inner.borrow_mut().transition(Status::Running);
        }

        // A pouring bucket is the one source with in-parent work to do,
        // and it can only pour once its consumer exists.
        if let Some(up) = self.input_peer() {
            if up.is_pouring_bucket() && !up.fork_state().1 {
                up.execute()?;
            }
        }

        if let Some(down) = self.output_peer() {
            let (forks, started) = down.fork_state();
            if forks && !started {
                down.execute()?;
            }
        }

        if self.is_pouring_bucket() {
            fitting::spool(self)?;
            self.inner.borrow_mut().transition(Status::Done);
        }

        Ok(())
    }

    /// Consult the default edge bindings for any slot left unset: a
    /// forking stage reads EOF, pours its output into a bucket, and
    /// keeps the host's stderr.
    fn resolve_defaults(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            fitting::resolve_prng(&mut inner);
            inner.derive_ready();
        }
        if !self.inner.borrow().needs_fork() {
            return Ok(());
        }
        if self.input_peer().is_none() {
            self.link(Slot::Input, &Stage::plug())?;
        }
        if self.output_peer().is_none() {
            self.link(Slot::Output, &Stage::bucket())?;
        }
        if self.stderr_peer().is_none() {
            let mut inner = self.inner.borrow_mut();
            let fd = Slot::Stderr.fd_num();
            // Bind the child's fd 2 to the inherited stderr; nothing to
            // close, nothing to remap.
            inner.fds.entry(fd).or_insert(fd);
        }
        Ok(())
    }

    fn fork_child(&self) -> Result<()> {
        {
            let inner = self.inner.borrow();
            if inner.status != Status::Ready {
                return Err(Error::Configuration(format!(
                    "{} is not executable",
                    inner.name()
                )));
            }
            debug!(inner.logger, "forking"; "stage" => inner.name());
        }
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Parent { child }) => {
                let mut inner = self.inner.borrow_mut();
                // Close what was flagged close-on-exec-in-parent for
                // this fork; the child owns those ends now.
                let close_now: Vec<libc::c_int> = inner
                    .owned
                    .iter()
                    .filter(|(_, &flag)| flag)
                    .map(|(&fd, _)| fd)
                    .collect();
                for fd in close_now {
                    let _ = unistd::close(fd);
                    inner.owned.remove(&fd);
                }
                inner.fds.clear();
                inner.pid = Some(child.as_raw());
                inner.transition(Status::Running);
                debug!(inner.logger, "forked"; "pid" => child.as_raw());
                drop(inner);
                register_running(child.as_raw(), std::rc::Rc::downgrade(&self.inner));
                Ok(())
            }
            Ok(ForkResult::Child) => child_harness(self),
            Err(e) => Err(Error::Resource {
                context: "fork".to_string(),
                source: e,
            }),
        }
    }

    /// Block until this stage's child is reaped, then reap its whole
    /// upstream chain. Returns the raw rc; a fitting reports its
    /// producer's. Calling again on a finished stage returns the cached
    /// rc without another waitpid.
    pub fn wait(&self) -> Result<i32> {
        self.execute()?;

        if !self.inner.borrow().needs_fork() {
            return settle_fitting(self);
        }

        {
            let inner = self.inner.borrow();
            match inner.status {
                Status::Done | Status::Lost => return Ok(inner.rc.unwrap_or(-1)),
                _ => {}
            }
        }

        // Drain what this stage is still writing into, or a full pipe
        // keeps the child (and us, inside waitpid) blocked forever.
        for slot in [Slot::Output, Slot::Stderr].iter() {
            let peer = self
                .inner
                .borrow()
                .peer(*slot)
                .map(|(rc, _)| Stage::from_rc(rc));
            if let Some(peer) = peer {
                if peer.is_filling_bucket() {
                    fitting::collect(&peer)?;
                }
            }
        }

        let pid = match self.pid() {
            Some(pid) => pid,
            None => {
                return Err(Error::Configuration(format!(
                    "{} has no child to wait for",
                    self.name()
                )))
            }
        };

        let rc = loop {
            match waitpid(Pid::from_raw(pid), None) {
                Ok(ws) => match encode_wait_status(ws) {
                    Some(rc) => break rc,
                    None => continue,
                },
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    let mut inner = self.inner.borrow_mut();
                    warn!(inner.logger, "child was reaped elsewhere"; "pid" => pid);
                    inner.transition(Status::Lost);
                    drop(inner);
                    unregister_running(pid);
                    return Ok(-1);
                }
                Err(e) => {
                    return Err(Error::Resource {
                        context: format!("waitpid {}", pid),
                        source: e,
                    })
                }
            }
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.rc = Some(rc);
            inner.transition(Status::Done);
            debug!(inner.logger, "waited"; "pid" => pid, "rc" => rc);
        }
        unregister_running(pid);

        // Nothing upstream may be left Running after the terminus is
        // waited on.
        if let Some(up) = self.input_peer() {
            if !matches!(up.status(), Status::Done | Status::Lost) {
                up.wait()?;
            }
        }

        Ok(rc)
    }

    /// The raw wait status, forcing execute-and-wait first. `None` only
    /// for a Lost child.
    pub fn rc(&self) -> Result<Option<i32>> {
        self.wait()?;
        Ok(self.inner.borrow().rc)
    }

    /// What went wrong, if anything: "killed by signal N" or "exited
    /// with error code K". Forces execute-and-wait.
    pub fn error(&self) -> Result<Option<String>> {
        let rc = self.wait()?;
        Ok(decode_status(rc))
    }

    /// True when the stage (or, for a fitting, its producer) exited
    /// cleanly. Forces execute-and-wait.
    pub fn ok(&self) -> Result<bool> {
        Ok(self.error()?.is_none())
    }

    /// `error()` flattened to a string, empty on success.
    pub fn errormsg(&self) -> Result<String> {
        Ok(self.error()?.unwrap_or_default())
    }

    /// Deliver a signal to the running child.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        let (pid, running) = {
            let inner = self.inner.borrow();
            (inner.pid, inner.status == Status::Running)
        };
        match pid {
            Some(pid) if running => {
                signal::kill(Pid::from_raw(pid), sig).map_err(|e| Error::Resource {
                    context: format!("kill {}", pid),
                    source: e,
                })
            }
            _ => Err(Error::Configuration(format!(
                "{} is not running",
                self.name()
            ))),
        }
    }
}

/// Wait, as seen from a fitting: drain what it holds, then wait the
/// producer chain it hangs off.
fn settle_fitting(stage: &Stage) -> Result<i32> {
    if stage.is_filling_bucket() {
        fitting::collect(stage)?;
    }
    let up = stage.inner.borrow().peer(Slot::Input).map(|(rc, _)| Stage::from_rc(rc));
    let rc = match up {
        Some(up) => up.wait()?,
        None => 0,
    };
    let mut inner = stage.inner.borrow_mut();
    inner.rc = Some(rc);
    if inner.status == Status::Ready || inner.status == Status::Running {
        inner.transition(Status::Done);
    }
    Ok(rc)
}

/// Everything after `fork` returns in the child. Remap, adjust, then
/// exec or run the code body; never returns to the caller's world.
fn child_harness(stage: &Stage) -> ! {
    let code = run_child(stage);
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    unsafe { libc::_exit(code) }
}

fn run_child(stage: &Stage) -> i32 {
    let (fds, cwd, env, has_code) = {
        let inner = stage.inner.borrow();
        (
            inner.fds.clone(),
            inner.cwd.clone(),
            inner.env.clone(),
            inner.code.is_some(),
        )
    };

    // A prepared descriptor sitting in the 0..=2 range (possible when
    // the host started with closed stdio) would be clobbered mid-remap;
    // move it out of the way first.
    let mut fds = fds;
    for target in 0..=2 {
        let prep = match fds.get(&target) {
            Some(&prep) => prep,
            None => continue,
        };
        if prep <= 2 && prep != target {
            match fcntl(prep, FcntlArg::F_DUPFD_CLOEXEC(3)) {
                Ok(moved) => {
                    for v in fds.values_mut() {
                        if *v == prep {
                            *v = moved;
                        }
                    }
                    let _ = unistd::close(prep);
                }
                Err(e) => {
                    eprintln!("io-plumbing child: cannot relocate fd {}: {}", prep, e);
                    return 127;
                }
            }
        }
    }

    // Rewire fds 0/1/2 onto the prepared descriptors; a slot that
    // prepared nothing closes. dup2 clears the close-on-exec bit on the
    // duplicate, which is exactly what the exec below needs.
    for target in 0..=2 {
        match fds.get(&target) {
            Some(&prep) if prep != target => {
                if unistd::dup2(prep, target).is_err() {
                    eprintln!("io-plumbing child: cannot dup2 {} onto {}", prep, target);
                    return 127;
                }
            }
            Some(&prep) => {
                let _ = fcntl(prep, FcntlArg::F_SETFD(FdFlag::empty()));
            }
            None => {
                let _ = unistd::close(target);
            }
        }
    }
    let mut originals: Vec<libc::c_int> = fds.values().cloned().collect();
    originals.sort_unstable();
    originals.dedup();
    for fd in originals {
        if fd > 2 {
            let _ = unistd::close(fd);
        }
    }

    if let Some(dir) = cwd {
        if let Err(e) = unistd::chdir(&dir) {
            eprintln!("io-plumbing child: chdir {}: {}", dir.display(), e);
            return 127;
        }
    }

    if let Some(vars) = env {
        for (key, _) in std::env::vars() {
            std::env::remove_var(key);
        }
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
    }

    // The Rust runtime ignores SIGPIPE process-wide and the disposition
    // survives exec; a child on the wrong end of a closed pipe must die
    // of it instead.
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, signal::SigHandler::SigDfl);
    }

    if let Some(mut hook) = stage.inner.borrow_mut().pre_exec.take() {
        if let Err(e) = hook() {
            eprintln!("io-plumbing child: pre_exec hook: {:#}", e);
            return 126;
        }
    }

    if has_code {
        // Code bodies see the same fd hygiene an exec would have
        // enforced: no descriptor of any other stage stays open.
        close_sibling_fds(stage);
        let mut body = match stage.inner.borrow_mut().code.take() {
            Some(body) => body,
            None => return 127,
        };
        return match catch_unwind(AssertUnwindSafe(move || body())) {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                eprintln!("io-plumbing child: {:#}", e);
                1
            }
            Err(_) => {
                eprintln!("io-plumbing child: code body panicked");
                101
            }
        };
    }

    exec_program(stage)
}

/// Replace the child with the stage's program. Comes back only when the
/// exec itself failed; the fault is reported like every other child
/// fault (formatted onto the child's stderr, exit code handed up to the
/// harness), with the errno as the exit code so the parent's rc
/// decoding shows what went wrong.
fn exec_program(stage: &Stage) -> i32 {
    let (program, args) = {
        let inner = stage.inner.borrow();
        match inner.program {
            Some(ref program) => (program.clone(), inner.args.clone()),
            None => {
                eprintln!("io-plumbing child: nothing to run");
                return 127;
            }
        }
    };

    let mut argv = Vec::with_capacity(args.len() + 1);
    for word in std::iter::once(&program).chain(args.iter()) {
        match CString::new(word.as_str()) {
            Ok(word) => argv.push(word),
            Err(_) => {
                let fault =
                    Error::Configuration(format!("NUL byte in argv entry {:?}", word));
                eprintln!("io-plumbing child: {}", fault);
                return 127;
            }
        }
    }

    let errno = match unistd::execvp(&argv[0], &argv) {
        Err(errno) => errno,
        Ok(never) => match never {},
    };
    let fault = Error::Resource {
        context: format!("exec {}", program),
        source: errno,
    };
    eprintln!("io-plumbing child: {}", fault);
    errno as i32
}

/// Close every descriptor the rest of the graph owns. Exec'd children
/// get this for free from the close-on-exec bit; an in-process code
/// body has to do it by hand, or a long-lived parent-side end (a
/// pouring bucket's, a hose's) inherited across the fork would hold the
/// child's own stdin open forever.
fn close_sibling_fds(stage: &Stage) {
    let mut visited: Vec<*const RefCell<Inner>> = vec![std::rc::Rc::as_ptr(&stage.inner)];
    let mut queue: Vec<std::rc::Rc<RefCell<Inner>>> = Vec::new();
    {
        let inner = stage.inner.borrow();
        for slot in Slot::ALL.iter() {
            if let Some((rc, _)) = inner.peer(*slot) {
                queue.push(rc);
            }
        }
    }
    while let Some(rc) = queue.pop() {
        let ptr = std::rc::Rc::as_ptr(&rc);
        if visited.contains(&ptr) {
            continue;
        }
        visited.push(ptr);
        let inner = rc.borrow();
        for (&fd, _) in inner.owned.iter() {
            let _ = unistd::close(fd);
        }
        for slot in Slot::ALL.iter() {
            if let Some((next, _)) = inner.peer(*slot) {
                queue.push(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serial_test::serial;
    use std::thread::sleep;
    use std::time::Duration;

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    #[serial]
    fn test_cat_through_od() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, "#!/usr/bin/env sh\n").unwrap();

        let cat = Stage::program("cat");
        cat.input(path.to_str().unwrap()).unwrap();
        let od = cat.output("| od -x").unwrap();
        cat.execute().unwrap();

        let out = text(od.terminus().contents().unwrap());
        let re = Regex::new(r"(2123|2321)\s+(752f|2f75)\s+(7273|7372)\s+(622f|2f62)").unwrap();
        assert!(re.is_match(&out), "od said: {}", out);
    }

    #[test]
    #[serial]
    fn test_sed_from_pouring_bucket() {
        let sed = Stage::command("sed s/$/bar/").unwrap();
        sed.input(Stage::bucket_from("foo\n")).unwrap();
        sed.execute().unwrap();
        let out = text(sed.terminus().contents().unwrap());
        assert!(out.contains("foobar"), "sed said: {}", out);
    }

    #[test]
    #[serial]
    fn test_head_bucket_can_start_the_pipeline() {
        let bucket = Stage::bucket_from("data\n");
        let cat = Stage::program("cat");
        cat.input(&bucket).unwrap();
        bucket.execute().unwrap();
        assert_eq!(bucket.status(), Status::Done);
        assert_eq!(text(cat.terminus().contents().unwrap()), "data\n");
    }

    #[test]
    #[serial]
    fn test_code_stage_lines() {
        let code = Stage::code(|| {
            println!("O HAI");
            println!("{}", unistd::getpid());
            Ok(())
        });
        let bucket = Stage::bucket();
        bucket.input(&code).unwrap();

        assert_eq!(bucket.getline().unwrap().as_deref(), Some("O HAI\n"));
        let pid = code.pid().expect("code stage forked");
        let expect = format!("{}\n", pid);
        assert_eq!(bucket.getline().unwrap().as_deref(), Some(expect.as_str()));
        assert_eq!(bucket.getline().unwrap(), None);
        assert!(code.ok().unwrap());
    }

    #[test]
    #[serial]
    fn test_plug_feeds_eof() {
        let cat = Stage::program("cat");
        cat.input(Stage::plug()).unwrap();
        let bucket = cat.output(Stage::bucket()).unwrap();
        cat.execute().unwrap();
        assert!(bucket.contents().unwrap().is_empty());
        assert!(cat.ok().unwrap());
    }

    #[test]
    #[serial]
    fn test_writing_into_a_plug_fails() {
        let dd = Stage::command("dd if=/dev/zero bs=1k count=200").unwrap();
        dd.output(Stage::plug()).unwrap();
        dd.stderr("/dev/null").unwrap();
        dd.execute().unwrap();
        dd.wait().unwrap();
        assert!(!dd.ok().unwrap());
        assert!(!dd.errormsg().unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn test_collect_max_truncates_and_warns() {
        let cat = Stage::program("cat");
        cat.input(Stage::vent()).unwrap();
        let t = cat.terminus();
        t.collect_max(1000).unwrap();
        cat.execute().unwrap();

        let contents = t.contents().unwrap();
        assert_eq!(contents.len(), 1000);
        assert!(contents.iter().all(|&b| b == 0));
        assert!(t.truncated());
        assert_eq!(
            t.warning().as_deref(),
            Some("bucket(filling): not spooling more than 1000 bytes from `cat`")
        );
    }

    #[test]
    #[serial]
    fn test_hose_into_cat() {
        let h = Stage::hose();
        let cat = Stage::program("cat");
        cat.input(&h).unwrap();
        cat.output(Stage::bucket()).unwrap();
        cat.execute().unwrap();

        h.print("Hello, world\n").unwrap();
        h.close().unwrap();
        assert_eq!(
            cat.terminus().getline().unwrap().as_deref(),
            Some("Hello, world\n")
        );
        assert_eq!(cat.terminus().getline().unwrap(), None);
    }

    #[test]
    #[serial]
    fn test_chain_reaps_every_stage() {
        let a = Stage::command("echo one").unwrap();
        let b = a.output("| cat").unwrap();
        let c = b.output("| cat").unwrap();
        a.execute().unwrap();

        let t = c.terminus();
        t.wait().unwrap();
        for s in [&a, &b, &c].iter() {
            assert_eq!(s.status(), Status::Done, "{}", s.name());
            assert_eq!(s.rc().unwrap(), Some(0), "{}", s.name());
        }
        assert!(text(t.contents().unwrap()).contains("one"));
    }

    #[test]
    #[serial]
    fn test_wait_twice_returns_cached_rc() {
        let s = Stage::command("sh -c 'exit 3'").unwrap();
        s.execute().unwrap();
        let rc1 = s.wait().unwrap();
        let rc2 = s.wait().unwrap();
        assert_eq!(rc1, rc2);
        assert_eq!(rc1, 3 << 8);
        assert_eq!(s.errormsg().unwrap(), "exited with error code 3");
    }

    #[test]
    #[serial]
    fn test_reap_drains_the_running_table() {
        let s = Stage::command("sh -c true").unwrap();
        s.execute().unwrap();
        for _ in 0..5000 {
            if s.done() {
                break;
            }
            if reap(None) == 0 {
                sleep(Duration::from_millis(1));
            }
        }
        assert!(s.done());
        assert_eq!(s.rc().unwrap(), Some(0));
    }

    #[test]
    #[serial]
    fn test_signal_kills_child() {
        let s = Stage::command("sleep 30").unwrap();
        s.input(Stage::plug()).unwrap();
        s.execute().unwrap();
        s.signal(Signal::SIGTERM).unwrap();
        let rc = s.wait().unwrap();
        assert_eq!(rc & 0x7f, Signal::SIGTERM as i32);
        assert_eq!(s.errormsg().unwrap(), "killed by signal 15");
    }

    #[test]
    #[serial]
    fn test_env_replacement() {
        let s = Stage::command("sh -c 'echo $GREETING'").unwrap();
        s.set_env(vec![
            ("GREETING", "oh hello".to_string()),
            ("PATH", std::env::var("PATH").unwrap_or_default()),
        ]);
        let out = text(s.terminus().contents().unwrap());
        assert_eq!(out, "oh hello\n");
    }

    #[test]
    #[serial]
    fn test_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("landmark"), "x").unwrap();
        let s = Stage::command("ls").unwrap();
        s.set_cwd(dir.path());
        let out = text(s.terminus().contents().unwrap());
        assert!(out.contains("landmark"), "ls said: {}", out);
    }

    #[test]
    #[serial]
    fn test_stderr_plumbs_like_output() {
        let s = Stage::command("sh -c 'echo oops >&2'").unwrap();
        let b = Stage::bucket();
        s.stderr(&b).unwrap();
        s.execute().unwrap();
        s.wait().unwrap();
        assert_eq!(text(b.contents().unwrap()), "oops\n");
    }

    #[test]
    #[serial]
    fn test_stdout_and_stderr_share_a_bucket() {
        let s = Stage::command("sh -c 'echo out; echo err >&2'").unwrap();
        let b = Stage::bucket();
        s.output(&b).unwrap();
        s.stderr(&b).unwrap();
        s.execute().unwrap();
        s.wait().unwrap();
        let out = text(b.contents().unwrap());
        assert!(out.contains("out"), "got: {}", out);
        assert!(out.contains("err"), "got: {}", out);
    }

    #[test]
    #[serial]
    fn test_prng_sink_delegates_to_its_command() {
        let src = Stage::command("echo entropy").unwrap();
        let prng = Stage::prng();
        prng.set_encrypt_command("cat").unwrap();
        src.output(&prng).unwrap();
        src.execute().unwrap();
        let out = text(prng.terminus().contents().unwrap());
        assert!(out.contains("entropy"), "got: {}", out);
    }

    #[test]
    #[serial]
    fn test_prng_source_streams_entropy() {
        let cat = Stage::program("cat");
        cat.input(Stage::prng()).unwrap();
        let t = cat.terminus();
        t.collect_max(64).unwrap();
        cat.execute().unwrap();
        assert_eq!(t.contents().unwrap().len(), 64);
        assert!(t.truncated());
    }

    #[test]
    #[serial]
    fn test_hooks_run() {
        use std::cell::Cell;
        use std::rc::Rc;

        let ran = Rc::new(Cell::new(false));
        let seen = ran.clone();
        let s = Stage::command("sh -c true").unwrap();
        s.set_pre_fork(move || {
            seen.set(true);
            Ok(())
        });
        s.execute().unwrap();
        s.wait().unwrap();
        assert!(ran.get());
    }

    #[test]
    #[serial]
    fn test_failing_pre_fork_hook_stops_execute() {
        let s = Stage::command("sh -c true").unwrap();
        s.set_pre_fork(|| Err(anyhow::anyhow!("no")));
        assert!(s.execute().is_err());
        assert!(s.pid().is_none());
    }

    #[test]
    #[serial]
    fn test_code_stage_error_becomes_rc() {
        let s = Stage::code(|| Err(anyhow::anyhow!("deliberate")));
        s.stderr("/dev/null").unwrap();
        s.execute().unwrap();
        s.wait().unwrap();
        assert_eq!(s.errormsg().unwrap(), "exited with error code 1");
    }

    #[test]
    #[serial]
    fn test_execute_rejects_unconfigured_stage() {
        let s = Stage::code(|| Ok(()));
        // Strip the body; the stage falls back to Error.
        s.inner.borrow_mut().code = None;
        s.inner.borrow_mut().derive_ready();
        assert!(s.execute().is_err());
    }

    #[test]
    #[serial]
    fn test_lazy_observers_run_the_pipeline() {
        let s = Stage::command("echo lazily").unwrap();
        let t = s.terminus();
        // Nothing has been executed yet; ok() must do it all.
        assert_eq!(s.status(), Status::Ready);
        assert!(s.ok().unwrap());
        assert!(text(t.contents().unwrap()).contains("lazily"));
    }
}
