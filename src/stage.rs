// Copyright (c) 2026 The io-plumbing Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Pipeline graph nodes.
//!
//! A [`Stage`] is one node in a pipeline graph: an external program, an
//! in-process callable, or a non-forking fitting (plug, vent, bucket,
//! hose, prng). Stages are linked through three edge slots: input,
//! output and stderr. The slot a user sets holds the peer strongly; the
//! reciprocal reference installed on the peer is weak, so a stage stays
//! alive exactly as long as the user or an upstream owner needs it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use nix::unistd;
use slog::{debug, o, trace, Logger};

use crate::error::{Error, Result};
use crate::fitting::{BucketState, HoseState, PrngState};
use crate::shellwords;

/// Host-supplied callable: in-process code bodies and fork hooks.
pub type Callable = Box<dyn FnMut() -> anyhow::Result<()>>;

/// Stage lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Not executable yet: missing program or code, or a fitting whose
    /// configuration is inconsistent.
    Error,
    Ready,
    Running,
    Done,
    /// A wait found the child already reaped by someone else.
    Lost,
}

/// Edge slots of a stage. The discriminant doubles as the fd number the
/// slot binds to in the child: 0, 1 and 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    Input = 0,
    Output = 1,
    Stderr = 2,
}

impl Slot {
    pub(crate) const ALL: [Slot; 3] = [Slot::Input, Slot::Output, Slot::Stderr];

    pub(crate) fn fd_num(self) -> RawFd {
        self as RawFd
    }

    pub(crate) fn is_input(self) -> bool {
        self == Slot::Input
    }

    /// The peer slot a link from this slot lands on.
    pub(crate) fn opposite(self) -> Slot {
        match self {
            Slot::Input => Slot::Output,
            Slot::Output | Slot::Stderr => Slot::Input,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Slot::Input => "input",
            Slot::Output => "output",
            Slot::Stderr => "stderr",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// One side of an edge. The forward direction (set by the user) owns the
/// peer; the reciprocal installed on the peer does not.
pub(crate) enum PeerRef {
    Strong(Rc<RefCell<Inner>>),
    Back(Weak<RefCell<Inner>>),
}

impl PeerRef {
    fn upgrade(&self) -> Option<Rc<RefCell<Inner>>> {
        match self {
            PeerRef::Strong(rc) => Some(rc.clone()),
            PeerRef::Back(weak) => weak.upgrade(),
        }
    }

    fn is_back(&self) -> bool {
        matches!(self, PeerRef::Back(_))
    }
}

pub(crate) struct Edge {
    pub(crate) peer: PeerRef,
    /// Which of the peer's opposite-direction slots this edge lands on.
    pub(crate) peer_slot: Slot,
}

pub(crate) enum Kind {
    Program,
    Code,
    Plug,
    Vent,
    Bucket(BucketState),
    Hose(HoseState),
    Prng(PrngState),
}

impl Kind {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Kind::Program => "command",
            Kind::Code => "code",
            Kind::Plug => "plug",
            Kind::Vent => "vent",
            Kind::Bucket(_) => "bucket",
            Kind::Hose(_) => "hose",
            Kind::Prng(_) => "prng",
        }
    }

    pub(crate) fn is_fitting(&self) -> bool {
        !matches!(self, Kind::Program | Kind::Code)
    }
}

pub(crate) struct Inner {
    pub(crate) kind: Kind,
    pub(crate) program: Option<String>,
    pub(crate) args: Vec<String>,
    pub(crate) code: Option<Callable>,
    /// None means the child inherits the parent's environment.
    pub(crate) env: Option<Vec<(String, String)>>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) slots: [Option<Edge>; 3],
    /// Child fd number -> descriptor prepared for it.
    pub(crate) fds: HashMap<RawFd, RawFd>,
    /// Descriptors this stage owns. The flag marks close-on-exec-in-
    /// parent: the parent must close the descriptor right after this
    /// stage forks. This is a bookkeeping flag of the library, distinct
    /// from the POSIX FD_CLOEXEC bit (which is set on every descriptor
    /// the library creates).
    pub(crate) owned: HashMap<RawFd, bool>,
    pub(crate) status: Status,
    pub(crate) pid: Option<libc::pid_t>,
    pub(crate) rc: Option<i32>,
    pub(crate) pre_fork: Option<Callable>,
    pub(crate) pre_exec: Option<Callable>,
    pub(crate) logger: Logger,
}

impl Inner {
    fn new(kind: Kind) -> Inner {
        let logger = crate::root_logger().new(o!("stage" => kind.label()));
        let mut inner = Inner {
            kind,
            program: None,
            args: Vec::new(),
            code: None,
            env: None,
            cwd: None,
            slots: [None, None, None],
            fds: HashMap::new(),
            owned: HashMap::new(),
            status: Status::Error,
            pid: None,
            rc: None,
            pre_fork: None,
            pre_exec: None,
            logger,
        };
        inner.derive_ready();
        inner
    }

    pub(crate) fn transition(&mut self, to: Status) {
        if self.status != to {
            debug!(self.logger, "status change";
                   "from" => format!("{:?}", self.status),
                   "to" => format!("{:?}", to));
            self.status = to;
        }
    }

    /// Re-derive Error <-> Ready from the minimum-configuration rule.
    /// Later states are never touched.
    pub(crate) fn derive_ready(&mut self) {
        let executable = match self.kind {
            Kind::Program => self.program.is_some(),
            Kind::Code => self.code.is_some(),
            // A pouring bucket with nothing to pour cannot run.
            Kind::Bucket(ref b) => !(self.bound(Slot::Output) && b.buf.is_empty()),
            _ => true,
        };
        match self.status {
            Status::Error if executable => self.transition(Status::Ready),
            Status::Ready if !executable => self.transition(Status::Error),
            _ => {}
        }
    }

    pub(crate) fn started(&self) -> bool {
        matches!(self.status, Status::Running | Status::Done | Status::Lost)
    }

    pub(crate) fn bound(&self, slot: Slot) -> bool {
        self.slots[slot.index()].is_some()
    }

    pub(crate) fn needs_fork(&self) -> bool {
        match self.kind {
            Kind::Program | Kind::Code => true,
            // A prng sink forks its encryption command.
            Kind::Prng(_) => self.bound(Slot::Input),
            _ => false,
        }
    }

    pub(crate) fn peer(&self, slot: Slot) -> Option<(Rc<RefCell<Inner>>, Slot)> {
        let edge = self.slots[slot.index()].as_ref()?;
        let rc = edge.peer.upgrade()?;
        Some((rc, edge.peer_slot))
    }

    pub(crate) fn set_fd(&mut self, target: RawFd, fd: RawFd, close_in_parent: bool) {
        trace!(self.logger, "descriptor prepared";
               "target" => target, "fd" => fd, "close_in_parent" => close_in_parent);
        self.fds.insert(target, fd);
        self.owned.insert(fd, close_in_parent);
    }

    /// The stage's argv rendered as a command line. Empty for stages
    /// without a program.
    pub(crate) fn command_string(&self) -> String {
        let mut words: Vec<String> = Vec::new();
        if let Some(ref p) = self.program {
            words.push(p.clone());
        }
        words.extend(self.args.iter().cloned());
        shellwords::quote(&words).unwrap_or_else(|_| words.join(" "))
    }

    pub(crate) fn name(&self) -> String {
        let mut name = match self.kind {
            Kind::Program => format!("`{}`", self.command_string()),
            Kind::Bucket(_) => match self.orientation() {
                Some(Slot::Input) => "bucket(filling)".to_string(),
                Some(Slot::Output) => "bucket(pouring)".to_string(),
                _ => "bucket".to_string(),
            },
            Kind::Hose(_) => match self.orientation() {
                Some(Slot::Output) => "hose(gushing)".to_string(),
                Some(Slot::Input) => "hose(sucking)".to_string(),
                _ => "hose".to_string(),
            },
            _ => self.kind.label().to_string(),
        };
        if let Some(pid) = self.pid {
            name.push_str(&format!(" (pid {})", pid));
        }
        name
    }

    /// The bound data direction of a fitting, if any. Orientation is
    /// fixed by whichever slot was linked first, in either direction.
    pub(crate) fn orientation(&self) -> Option<Slot> {
        if self.bound(Slot::Input) {
            Some(Slot::Input)
        } else if self.bound(Slot::Output) {
            Some(Slot::Output)
        } else {
            None
        }
    }
}

/// True when bytes leaving `from` can reach `to` through the existing
/// graph, following output and stderr edges in either representation.
fn feeds(from: &Rc<RefCell<Inner>>, to: &Rc<RefCell<Inner>>) -> bool {
    let mut visited: Vec<*const RefCell<Inner>> = Vec::new();
    let mut queue = vec![from.clone()];
    while let Some(cur) = queue.pop() {
        if Rc::ptr_eq(&cur, to) {
            return true;
        }
        let ptr = Rc::as_ptr(&cur);
        if visited.contains(&ptr) {
            continue;
        }
        visited.push(ptr);
        let inner = cur.borrow();
        for slot in [Slot::Output, Slot::Stderr].iter() {
            if let Some((next, _)) = inner.peer(*slot) {
                queue.push(next);
            }
        }
    }
    false
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Every descriptor still owned closes here, on its only
        // remaining path. A dropped terminus thereby delivers SIGPIPE
        // or EOF to whatever is still attached.
        for (&fd, _) in self.owned.iter() {
            let _ = unistd::close(fd);
        }
    }
}

/// A handle to a pipeline stage. Clones are cheap and refer to the same
/// node; equality is node identity.
#[derive(Clone)]
pub struct Stage {
    pub(crate) inner: Rc<RefCell<Inner>>,
}

impl PartialEq for Stage {
    fn eq(&self, other: &Stage) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Stage {}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        write!(f, "Stage({}, {:?})", inner.name(), inner.status)
    }
}

/// What a slot can be connected to.
pub enum Connector {
    Stage(Stage),
    /// A path, or an embedded command line: `"| cmd…"` on an output
    /// slot and `"cmd… |"` on an input slot allocate a new command
    /// stage; any other string names a file.
    Spec(String),
    Handle(File),
    Code(Callable),
}

impl Connector {
    /// Wrap a callable so it can be plumbed into a slot as an
    /// in-process stage.
    pub fn code<F>(f: F) -> Connector
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        Connector::Code(Box::new(f))
    }
}

impl From<Stage> for Connector {
    fn from(s: Stage) -> Connector {
        Connector::Stage(s)
    }
}

impl From<&Stage> for Connector {
    fn from(s: &Stage) -> Connector {
        Connector::Stage(s.clone())
    }
}

impl From<&str> for Connector {
    fn from(s: &str) -> Connector {
        Connector::Spec(s.to_string())
    }
}

impl From<String> for Connector {
    fn from(s: String) -> Connector {
        Connector::Spec(s)
    }
}

impl From<File> for Connector {
    fn from(f: File) -> Connector {
        Connector::Handle(f)
    }
}

impl Stage {
    pub(crate) fn from_rc(inner: Rc<RefCell<Inner>>) -> Stage {
        Stage { inner }
    }

    fn new_kind(kind: Kind) -> Stage {
        Stage {
            inner: Rc::new(RefCell::new(Inner::new(kind))),
        }
    }

    /// An external-program stage with no arguments yet.
    pub fn program<S: Into<String>>(name: S) -> Stage {
        let stage = Stage::new_kind(Kind::Program);
        stage.set_program(name);
        stage
    }

    /// An external-program stage from a command line. A line containing
    /// whitespace is tokenized: the first word becomes the program, the
    /// rest the arguments.
    pub fn command(line: &str) -> Result<Stage> {
        let line = line.trim();
        if !line.contains(char::is_whitespace) {
            if line.is_empty() {
                return Err(Error::Configuration("empty command line".to_string()));
            }
            return Ok(Stage::program(line));
        }
        let words = shellwords::unquote(line)?;
        if words.is_empty() {
            return Err(Error::Configuration("empty command line".to_string()));
        }
        let stage = Stage::program(&words[0]);
        stage.set_args(words[1..].iter().cloned());
        Ok(stage)
    }

    /// An in-process stage: `f` runs in the forked child with fds 0/1/2
    /// already rewired, then the child exits 0. A callable that wants to
    /// signal failure returns an error, which exits 1.
    pub fn code<F>(f: F) -> Stage
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        let stage = Stage::new_kind(Kind::Code);
        stage.inner.borrow_mut().code = Some(Box::new(f));
        stage.inner.borrow_mut().derive_ready();
        stage
    }

    /// EOF as a source, a write error on every write as a sink.
    pub fn plug() -> Stage {
        Stage::new_kind(Kind::Plug)
    }

    /// Endless NUL bytes as a source, silent discard as a sink.
    pub fn vent() -> Stage {
        Stage::new_kind(Kind::Vent)
    }

    /// An in-memory byte buffer; fills from a peer or pours into one,
    /// depending on which side is linked first.
    pub fn bucket() -> Stage {
        Stage::new_kind(Kind::Bucket(BucketState::new()))
    }

    /// A bucket pre-loaded with bytes to pour.
    pub fn bucket_from<B: Into<Vec<u8>>>(bytes: B) -> Stage {
        Stage::new_kind(Kind::Bucket(BucketState::with_buf(bytes.into())))
    }

    /// A pipe whose far end is handed to the caller as a raw file
    /// handle.
    pub fn hose() -> Stage {
        Stage::new_kind(Kind::Hose(HoseState::new()))
    }

    pub(crate) fn hose_from_file(file: File) -> Stage {
        Stage::new_kind(Kind::Hose(HoseState::with_file(file)))
    }

    /// System entropy as a source; an encryption command as a sink.
    pub fn prng() -> Stage {
        Stage::new_kind(Kind::Prng(PrngState::new()))
    }

    /// Replace the stage's logger.
    pub fn with_logger(self, logger: Logger) -> Stage {
        {
            let mut inner = self.inner.borrow_mut();
            let label = inner.kind.label();
            inner.logger = logger.new(o!("stage" => label));
        }
        self
    }

    pub fn set_program<S: Into<String>>(&self, program: S) {
        let mut inner = self.inner.borrow_mut();
        inner.program = Some(program.into());
        inner.derive_ready();
    }

    pub fn set_args<I, S>(&self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.borrow_mut();
        inner.args = args.into_iter().map(Into::into).collect();
        inner.derive_ready();
    }

    /// Append one argument; chains.
    pub fn arg<S: Into<String>>(&self, a: S) -> &Stage {
        self.inner.borrow_mut().args.push(a.into());
        self
    }

    /// Append several arguments; chains.
    pub fn args<I, S>(&self, args: I) -> &Stage
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .borrow_mut()
            .args
            .extend(args.into_iter().map(Into::into));
        self
    }

    pub fn set_code<F>(&self, f: F)
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        inner.code = Some(Box::new(f));
        inner.derive_ready();
    }

    /// Replace the child's environment. `None`-like absence (never
    /// calling this) inherits the parent's.
    pub fn set_env<I, K, V>(&self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.inner.borrow_mut().env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
    }

    pub fn set_cwd<P: Into<PathBuf>>(&self, path: P) {
        self.inner.borrow_mut().cwd = Some(path.into());
    }

    /// Runs in the parent just before this stage forks.
    pub fn set_pre_fork<F>(&self, f: F)
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        self.inner.borrow_mut().pre_fork = Some(Box::new(f));
    }

    /// Runs in the child after the fd remap, just before exec or the
    /// code body.
    pub fn set_pre_exec<F>(&self, f: F)
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        self.inner.borrow_mut().pre_exec = Some(Box::new(f));
    }

    /// Plumb something into this stage's input. Returns the peer stage.
    pub fn input<C: Into<Connector>>(&self, c: C) -> Result<Stage> {
        self.connect(Slot::Input, c.into())
    }

    /// Plumb this stage's output somewhere. Returns the peer stage.
    pub fn output<C: Into<Connector>>(&self, c: C) -> Result<Stage> {
        self.connect(Slot::Output, c.into())
    }

    /// Plumb this stage's stderr somewhere. A peer stage receives it as
    /// its input, exactly like output.
    pub fn stderr<C: Into<Connector>>(&self, c: C) -> Result<Stage> {
        self.connect(Slot::Stderr, c.into())
    }

    fn connect(&self, slot: Slot, c: Connector) -> Result<Stage> {
        let peer = match c {
            Connector::Stage(s) => s,
            Connector::Code(f) => {
                let stage = Stage::new_kind(Kind::Code);
                stage.inner.borrow_mut().code = Some(f);
                stage.inner.borrow_mut().derive_ready();
                stage
            }
            Connector::Handle(f) => Stage::hose_from_file(f),
            Connector::Spec(s) => {
                let text = s.trim();
                if !slot.is_input() && text.starts_with('|') {
                    Stage::command(text.trim_start_matches('|'))?
                } else if slot.is_input() && text.ends_with('|') {
                    Stage::command(text.trim_end_matches('|'))?
                } else if slot.is_input() {
                    let file = File::open(text).map_err(|e| Error::Io {
                        context: format!("open {}", text),
                        source: e,
                    })?;
                    Stage::hose_from_file(file)
                } else {
                    let file = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(text)
                        .map_err(|e| Error::Io {
                            context: format!("open {}", text),
                            source: e,
                        })?;
                    Stage::hose_from_file(file)
                }
            }
        };
        self.link(slot, &peer)?;
        Ok(peer)
    }

    /// Install the edge `self.slot -> peer` and the weak reciprocal on
    /// the peer's opposite slot.
    pub(crate) fn link(&self, slot: Slot, peer: &Stage) -> Result<()> {
        if Rc::ptr_eq(&self.inner, &peer.inner) {
            return Err(Error::Configuration(
                "cannot plumb a stage into itself".to_string(),
            ));
        }

        // A data-flow loop would send the executor chasing its own
        // tail.
        let loops = if slot.is_input() {
            feeds(&self.inner, &peer.inner)
        } else {
            feeds(&peer.inner, &self.inner)
        };
        if loops {
            return Err(Error::Configuration(
                "plumbing this edge would close a loop".to_string(),
            ));
        }

        let peer_slot = slot.opposite();
        crate::fitting::check_bind(&self.inner.borrow(), slot)?;
        crate::fitting::check_bind(&peer.inner.borrow(), peer_slot)?;

        // Replacing an edge invalidates the old peer's reciprocal.
        let old = self.inner.borrow_mut().slots[slot.index()].take();
        if let Some(old) = old {
            if let Some(old_rc) = old.peer.upgrade() {
                if !Rc::ptr_eq(&old_rc, &peer.inner) {
                    let mut o = old_rc.borrow_mut();
                    let stale = o.slots[old.peer_slot.index()]
                        .as_ref()
                        .map(|e| e.peer.is_back())
                        .unwrap_or(false);
                    if stale {
                        o.slots[old.peer_slot.index()] = None;
                        o.derive_ready();
                    }
                }
            }
        }

        self.inner.borrow_mut().slots[slot.index()] = Some(Edge {
            peer: PeerRef::Strong(peer.inner.clone()),
            peer_slot,
        });
        peer.inner.borrow_mut().slots[peer_slot.index()] = Some(Edge {
            peer: PeerRef::Back(Rc::downgrade(&self.inner)),
            peer_slot: slot,
        });

        self.inner.borrow_mut().derive_ready();
        peer.inner.borrow_mut().derive_ready();

        let inner = self.inner.borrow();
        debug!(inner.logger, "plumbed";
               "slot" => slot.label(), "peer" => peer.inner.borrow().name());
        Ok(())
    }

    fn peer_of(&self, slot: Slot) -> Option<Stage> {
        self.inner
            .borrow()
            .peer(slot)
            .map(|(rc, _)| Stage::from_rc(rc))
    }

    /// The stage plumbed into this one, whichever side set the edge.
    pub fn input_peer(&self) -> Option<Stage> {
        self.peer_of(Slot::Input)
    }

    pub fn output_peer(&self) -> Option<Stage> {
        self.peer_of(Slot::Output)
    }

    pub fn stderr_peer(&self) -> Option<Stage> {
        self.peer_of(Slot::Stderr)
    }

    /// Follow output edges to the last stage of the pipeline. A forking
    /// stage whose output was never set gets its default bucket
    /// installed on the way, so the terminus of a command is the bucket
    /// that will hold its output.
    pub fn terminus(&self) -> Stage {
        let mut cur = self.clone();
        loop {
            if let Some(next) = cur.output_peer() {
                cur = next;
                continue;
            }
            let forks = cur.inner.borrow().needs_fork();
            if forks && cur.link(Slot::Output, &Stage::bucket()).is_ok() {
                continue;
            }
            return cur;
        }
    }

    pub fn status(&self) -> Status {
        self.inner.borrow().status
    }

    pub fn ready(&self) -> bool {
        self.status() == Status::Ready
    }

    pub fn running(&self) -> bool {
        self.status() == Status::Running
    }

    pub fn done(&self) -> bool {
        self.status() == Status::Done
    }

    pub fn pid(&self) -> Option<libc::pid_t> {
        self.inner.borrow().pid
    }

    /// Kind, command line and pid, for humans.
    pub fn name(&self) -> String {
        self.inner.borrow().name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_split() {
        let s = Stage::command("dd if=/dev/zero bs=1k count=200").unwrap();
        let inner = s.inner.borrow();
        assert_eq!(inner.program.as_deref(), Some("dd"));
        assert_eq!(inner.args, &["if=/dev/zero", "bs=1k", "count=200"]);
    }

    #[test]
    fn test_command_single_word() {
        let s = Stage::command("cat").unwrap();
        assert_eq!(s.inner.borrow().program.as_deref(), Some("cat"));
        assert!(s.inner.borrow().args.is_empty());
        assert!(Stage::command("   ").is_err());
    }

    #[test]
    fn test_arg_builders_append() {
        let s = Stage::program("od");
        s.arg("-x").args(vec!["-N", "16"]);
        assert_eq!(s.inner.borrow().args, &["-x", "-N", "16"]);

        // set_args replaces outright.
        s.set_args(vec!["-c"]);
        assert_eq!(s.inner.borrow().args, &["-c"]);
    }

    #[test]
    fn test_status_derivation() {
        let s = Stage::new_kind(Kind::Program);
        assert_eq!(s.status(), Status::Error);
        s.set_program("cat");
        assert_eq!(s.status(), Status::Ready);
    }

    #[test]
    fn test_link_back_reference() {
        let a = Stage::program("true");
        let b = Stage::bucket();
        a.output(&b).unwrap();
        assert_eq!(b.input_peer().unwrap(), a);
        assert_eq!(a.output_peer().unwrap(), b);
    }

    #[test]
    fn test_back_reference_does_not_own() {
        let b = Stage::bucket();
        let weak = {
            let a = Stage::program("true");
            a.output(&b).unwrap();
            Rc::downgrade(&a.inner)
        };
        // `a` is gone; only the weak reciprocal on `b` pointed at it.
        assert!(weak.upgrade().is_none());
        assert!(b.input_peer().is_none());
    }

    #[test]
    fn test_forward_edge_owns_peer() {
        let a = Stage::program("true");
        let weak = {
            let b = Stage::bucket();
            a.output(&b).unwrap();
            Rc::downgrade(&b.inner)
        };
        // `b` is kept alive by the forward edge from `a`.
        assert!(weak.upgrade().is_some());
        assert_eq!(a.output_peer().unwrap().name(), "bucket(filling)");
    }

    #[test]
    fn test_self_link_rejected() {
        let a = Stage::program("cat");
        assert!(a.output(&a).is_err());
    }

    #[test]
    fn test_loops_rejected() {
        let a = Stage::program("cat");
        let b = Stage::program("cat");
        a.output(&b).unwrap();
        assert!(b.output(&a).is_err());
        assert!(a.input(&b).is_err());

        // Replacing an edge is not a loop.
        let c = Stage::program("cat");
        a.output(&c).unwrap();
        assert_eq!(a.output_peer().unwrap(), c);
    }

    #[test]
    fn test_fitting_orientation_conflict() {
        let b = Stage::bucket_from("data");
        let consumer = Stage::program("cat");
        consumer.input(&b).unwrap(); // bucket now pours
        assert!(b.input(Stage::program("echo")).is_err());

        let h = Stage::hose();
        let c = Stage::program("cat");
        c.input(&h).unwrap(); // hose output side bound
        assert!(h.input(Stage::program("echo")).is_err());
    }

    #[test]
    fn test_fitting_rejects_stderr_slot() {
        let p = Stage::plug();
        assert!(p.stderr(Stage::bucket()).is_err());
    }

    #[test]
    fn test_empty_pouring_bucket_is_error() {
        let b = Stage::bucket_from("");
        let c = Stage::program("cat");
        c.input(&b).unwrap();
        assert_eq!(b.status(), Status::Error);

        let full = Stage::bucket_from("x");
        let c2 = Stage::program("cat");
        c2.input(&full).unwrap();
        assert_eq!(full.status(), Status::Ready);
    }

    #[test]
    fn test_embedded_command_shortcuts() {
        let cat = Stage::program("cat");
        let od = cat.output("| od -x").unwrap();
        assert_eq!(od.inner.borrow().program.as_deref(), Some("od"));
        assert_eq!(od.input_peer().unwrap(), cat);

        let sink = Stage::program("wc");
        let producer = sink.input("echo hello |").unwrap();
        assert_eq!(producer.inner.borrow().program.as_deref(), Some("echo"));
        assert_eq!(producer.output_peer().unwrap(), sink);
    }

    #[test]
    fn test_terminus_installs_default_bucket() {
        let cat = Stage::program("cat");
        let t = cat.terminus();
        assert_eq!(t.name(), "bucket(filling)");
        assert_eq!(cat.terminus(), t);

        let od = Stage::program("od");
        cat.output(&od).unwrap();
        // The walk now runs through od to od's bucket.
        assert_eq!(cat.terminus(), od.terminus());
    }

    #[test]
    fn test_names() {
        let s = Stage::command("cat -e").unwrap();
        assert_eq!(s.name(), "`cat -e`");
        assert_eq!(Stage::plug().name(), "plug");
        assert_eq!(Stage::bucket().name(), "bucket");
        let h = Stage::hose();
        Stage::program("cat").input(&h).unwrap();
        assert_eq!(h.name(), "hose(gushing)");
    }
}
