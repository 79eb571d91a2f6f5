//! Asynchronous I/O context: a table of file descriptors keyed by
//! opaque ids, submission queues, and a kernel completion-queue driver
//! that resolves chains as results come back.

pub mod driver;
#[cfg(target_os = "linux")]
pub mod uring;
pub mod fallback;

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::chain::{Chain, State};
use crate::config;
use crate::dispatch::{GroupId, TaskDispatcher};
use crate::error::IoSetupError;
use crate::id::{Id, IdAllocator};
use crate::raw_data::RawData;

use driver::{DriverCompletion, IoDriver};

/// Sentinel offset meaning "append after every prior append write to
/// this id", resolved to a real monotonic offset at submission time.
pub const APPEND: u64 = u64::MAX;
/// Sentinel size meaning "the whole file, as sized at submission time".
pub const WHOLE_FILE: u64 = u64::MAX - 1;

/// A completed read or write: the buffer (moved back to the caller),
/// whether the operation succeeded, and how many bytes were actually
/// transferred.
pub type IoResult = (RawData, bool, u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FdKind {
    File,
    Listener,
    Stream,
    Pseudo,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FdState {
    Created,
    Connecting,
    Established,
    Closing,
    Closed,
}

struct FdEntry {
    raw_fd: RawFd,
    #[allow(dead_code)]
    kind: FdKind,
    #[allow(dead_code)]
    path: Option<PathBuf>,
    next_append_offset: Cell<u64>,
    state: Cell<FdState>,
    port: Option<u16>,
    pending_ops: Cell<u32>,
}

enum CompletionSink {
    Read(State<IoResult>),
    Write(State<IoResult>),
    Accept(State<Id>),
    Connect(State<bool>),
    Close(State<bool>),
}

struct PendingOp {
    fd_id: Id,
    sink: CompletionSink,
}

/// Owns fds, in-flight operations, and the kernel completion driver.
/// Single-threaded by construction (its chains are `Rc`-rooted): all
/// submission and dispatch happens on whichever thread calls
/// [`IoContext::process`]/[`IoContext::queue_read`]/etc.
pub struct IoContext {
    driver: RefCell<Box<dyn IoDriver>>,
    fds: RefCell<HashMap<Id, FdEntry>>,
    ids: IdAllocator,
    next_token: Cell<u64>,
    ops: RefCell<HashMap<u64, PendingOp>>,
    prefix_directory: RefCell<PathBuf>,
    dispatcher: RefCell<Option<(Rc<dyn TaskDispatcher>, GroupId)>>,
    any_op_ever_queued: Cell<bool>,
}

impl IoContext {
    pub fn new() -> Result<Rc<Self>, IoSetupError> {
        let driver: Box<dyn IoDriver> = Self::make_driver()?;
        Ok(Rc::new(Self {
            driver: RefCell::new(driver),
            fds: RefCell::new(HashMap::new()),
            ids: IdAllocator::new(),
            next_token: Cell::new(1),
            ops: RefCell::new(HashMap::new()),
            prefix_directory: RefCell::new(PathBuf::from(".")),
            dispatcher: RefCell::new(None),
            any_op_ever_queued: Cell::new(false),
        }))
    }

    #[cfg(target_os = "linux")]
    fn make_driver() -> Result<Box<dyn IoDriver>, IoSetupError> {
        match uring::UringDriver::new(config::IO_URING_QUEUE_DEPTH) {
            Ok(d) => Ok(Box::new(d)),
            Err(e) => {
                tracing::warn!("io_uring unavailable ({e}), falling back to portable driver");
                Ok(Box::new(
                    fallback::FallbackDriver::new().map_err(IoSetupError::UringInit)?,
                ))
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn make_driver() -> Result<Box<dyn IoDriver>, IoSetupError> {
        Ok(Box::new(
            fallback::FallbackDriver::new().map_err(IoSetupError::UringInit)?,
        ))
    }

    pub fn set_prefix_directory(&self, path: impl Into<PathBuf>) {
        *self.prefix_directory.borrow_mut() = path.into();
    }

    fn resolve_path(&self, rel: &Path) -> PathBuf {
        self.prefix_directory.borrow().join(rel)
    }

    fn next_token(&self) -> u64 {
        let t = self.next_token.get();
        self.next_token.set(t + 1);
        t
    }

    fn mark_op_queued(&self, fd_id: Id) {
        self.any_op_ever_queued.set(true);
        if let Some(entry) = self.fds.borrow().get(&fd_id) {
            entry.pending_ops.set(entry.pending_ops.get() + 1);
        }
    }

    // ---- fd table management -------------------------------------------------

    pub fn map_file(&self, rel_path: impl AsRef<Path>) -> Result<Id, IoSetupError> {
        let full_path = self.resolve_path(rel_path.as_ref());
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&full_path)
            .map_err(|source| IoSetupError::FileOpen {
                path: full_path.clone(),
                source,
            })?;
        let raw_fd = file.into_raw_fd();
        let id = self.ids.allocate();
        let size = self.file_len(raw_fd);
        self.fds.borrow_mut().insert(
            id,
            FdEntry {
                raw_fd,
                kind: FdKind::File,
                path: Some(full_path),
                next_append_offset: Cell::new(size),
                state: Cell::new(FdState::Established),
                port: None,
                pending_ops: Cell::new(0),
            },
        );
        tracing::debug!(?id, "mapped file");
        Ok(id)
    }

    fn file_len(&self, raw_fd: RawFd) -> u64 {
        nix::sys::stat::fstat(raw_fd)
            .map(|st| st.st_size as u64)
            .unwrap_or(0)
    }

    pub fn get_file_size(&self, id: Id) -> Option<u64> {
        let fds = self.fds.borrow();
        let entry = fds.get(&id)?;
        Some(self.file_len(entry.raw_fd))
    }

    pub fn create_socket(&self, ipv6: bool) -> Result<Id, IoSetupError> {
        use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
        let family = if ipv6 {
            AddressFamily::Inet6
        } else {
            AddressFamily::Inet
        };
        let fd = socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)
            .map_err(|e| IoSetupError::NonBlocking(std::io::Error::from(e)))?;
        let id = self.ids.allocate();
        self.fds.borrow_mut().insert(
            id,
            FdEntry {
                raw_fd: fd,
                kind: FdKind::Stream,
                path: None,
                next_append_offset: Cell::new(0),
                state: Cell::new(FdState::Created),
                port: None,
                pending_ops: Cell::new(0),
            },
        );
        Ok(id)
    }

    pub fn create_listening_socket(&self, port: u16) -> Result<Id, IoSetupError> {
        use nix::sys::socket::{bind, listen, socket, AddressFamily, SockFlag, SockType, SockaddrIn};
        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| IoSetupError::Bind {
            port,
            source: std::io::Error::from(e),
        })?;
        let addr = SockaddrIn::from(std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::UNSPECIFIED,
            port,
        ));
        bind(fd, &addr).map_err(|e| IoSetupError::Bind {
            port,
            source: std::io::Error::from(e),
        })?;
        listen(fd, 128).map_err(|e| IoSetupError::Bind {
            port,
            source: std::io::Error::from(e),
        })?;
        let actual_port = nix::sys::socket::getsockname::<SockaddrIn>(fd)
            .map(|a| a.port())
            .unwrap_or(port);
        let id = self.ids.allocate();
        self.fds.borrow_mut().insert(
            id,
            FdEntry {
                raw_fd: fd,
                kind: FdKind::Listener,
                path: None,
                next_append_offset: Cell::new(0),
                state: Cell::new(FdState::Established),
                port: Some(actual_port),
                pending_ops: Cell::new(0),
            },
        );
        tracing::debug!(?id, port = actual_port, "listening socket created");
        Ok(id)
    }

    pub fn get_socket_port(&self, id: Id) -> Option<u16> {
        self.fds.borrow().get(&id)?.port
    }

    fn pseudo(&self, raw_fd: RawFd) -> Id {
        let id = self.ids.allocate();
        self.fds.borrow_mut().insert(
            id,
            FdEntry {
                raw_fd,
                kind: FdKind::Pseudo,
                path: None,
                next_append_offset: Cell::new(0),
                state: Cell::new(FdState::Established),
                port: None,
                pending_ops: Cell::new(0),
            },
        );
        id
    }

    pub fn stdin(&self) -> Id {
        self.pseudo(0)
    }
    pub fn stdout(&self) -> Id {
        self.pseudo(1)
    }
    pub fn stderr(&self) -> Id {
        self.pseudo(2)
    }

    // ---- submission ------------------------------------------------------

    pub fn queue_read(self: &Rc<Self>, id: Id, offset: u64, size: u64) -> Chain<IoResult> {
        let (chain, state) = Chain::<IoResult>::new();
        let Some(raw_fd) = self.raw_fd_of(id) else {
            state.complete((RawData::default(), false, 0));
            return chain;
        };
        let resolved_offset = if offset == WHOLE_FILE { 0 } else { offset };
        let resolved_len = if size == WHOLE_FILE {
            self.file_len(raw_fd) as usize
        } else {
            size as usize
        };
        let token = self.next_token();
        self.ops.borrow_mut().insert(
            token,
            PendingOp {
                fd_id: id,
                sink: CompletionSink::Read(state),
            },
        );
        self.mark_op_queued(id);
        self.driver
            .borrow_mut()
            .submit_read(raw_fd, resolved_offset, resolved_len, token);
        chain
    }

    pub fn queue_write(self: &Rc<Self>, id: Id, offset: u64, data: RawData) -> Chain<IoResult> {
        let (chain, state) = Chain::<IoResult>::new();
        let Some(raw_fd) = self.raw_fd_of(id) else {
            state.complete((RawData::default(), false, 0));
            return chain;
        };
        let resolved_offset = if offset == APPEND {
            let fds = self.fds.borrow();
            let entry = fds.get(&id).expect("fd checked above");
            let assigned = entry.next_append_offset.get();
            entry.next_append_offset.set(assigned + data.len() as u64);
            assigned
        } else {
            offset
        };
        let token = self.next_token();
        let bytes = data.into_vec();
        self.ops.borrow_mut().insert(
            token,
            PendingOp {
                fd_id: id,
                sink: CompletionSink::Write(state),
            },
        );
        self.mark_op_queued(id);
        self.driver
            .borrow_mut()
            .submit_write(raw_fd, resolved_offset, bytes, token);
        chain
    }

    pub fn queue_send(self: &Rc<Self>, id: Id, data: RawData) -> Chain<IoResult> {
        let (chain, state) = Chain::<IoResult>::new();
        let Some(raw_fd) = self.raw_fd_of(id) else {
            state.complete((RawData::default(), false, 0));
            return chain;
        };
        let token = self.next_token();
        let bytes = data.into_vec();
        self.ops.borrow_mut().insert(
            token,
            PendingOp {
                fd_id: id,
                sink: CompletionSink::Write(state),
            },
        );
        self.mark_op_queued(id);
        self.driver.borrow_mut().submit_send(raw_fd, bytes, token);
        chain
    }

    pub fn queue_receive(self: &Rc<Self>, id: Id, size: usize) -> Chain<IoResult> {
        let (chain, state) = Chain::<IoResult>::new();
        let Some(raw_fd) = self.raw_fd_of(id) else {
            state.complete((RawData::default(), false, 0));
            return chain;
        };
        let token = self.next_token();
        self.ops.borrow_mut().insert(
            token,
            PendingOp {
                fd_id: id,
                sink: CompletionSink::Read(state),
            },
        );
        self.mark_op_queued(id);
        self.driver.borrow_mut().submit_recv(raw_fd, size, token);
        chain
    }

    /// Opportunistic receive: like [`IoContext::queue_receive`] but the
    /// caller doesn't know how much is available up front. Completes
    /// with whatever actually arrived, which may be less than
    /// `max_size`. Callers that want kernel "multi-shot" behavior
    /// requeue this themselves in their own completion handler, the
    /// same way they'd requeue any other single-shot receive — `Chain`
    /// is single-shot by construction, so there is no separate
    /// multi-firing primitive.
    pub fn queue_multi_receive(self: &Rc<Self>, id: Id, max_size: usize) -> Chain<IoResult> {
        self.queue_receive(id, max_size)
    }

    pub fn queue_full_send(self: &Rc<Self>, id: Id, data: RawData) -> Chain<IoResult> {
        self.full_transfer_loop(id, data, 0, true)
    }

    pub fn queue_full_receive(self: &Rc<Self>, id: Id, size: usize) -> Chain<IoResult> {
        let data = RawData::allocate(size);
        self.full_transfer_loop(id, data, 0, false)
    }

    fn full_transfer_loop(
        self: &Rc<Self>,
        id: Id,
        data: RawData,
        done: usize,
        is_send: bool,
    ) -> Chain<IoResult> {
        let total = data.len();
        let ctx = self.clone();
        if is_send {
            let chunk = RawData::allocate_from(&data[done..]);
            self.queue_send(id, chunk).then_chain(move |(_, ok, n)| {
                let new_done = done + n as usize;
                if !ok || n == 0 || new_done >= total {
                    Chain::create_and_complete((data, ok, new_done as u32))
                } else {
                    ctx.full_transfer_loop(id, data, new_done, true)
                }
            })
        } else {
            let remaining = total - done;
            self.queue_receive(id, remaining).then_chain(move |(chunk, ok, n)| {
                let n = n as usize;
                let mut data = data;
                data.as_mut_slice()[done..done + n].copy_from_slice(&chunk[..n]);
                let new_done = done + n;
                if !ok || n == 0 || new_done >= total {
                    Chain::create_and_complete((data, ok, new_done as u32))
                } else {
                    ctx.full_transfer_loop(id, data, new_done, false)
                }
            })
        }
    }

    pub fn queue_accept(self: &Rc<Self>, listener: Id) -> Chain<Id> {
        let (chain, state) = Chain::<Id>::new();
        let raw_fd = {
            let fds = self.fds.borrow();
            match fds.get(&listener) {
                Some(entry) if entry.state.get() != FdState::Closed => entry.raw_fd,
                _ => {
                    state.complete(Id::INVALID);
                    return chain;
                }
            }
        };
        let token = self.next_token();
        self.ops.borrow_mut().insert(
            token,
            PendingOp {
                fd_id: listener,
                sink: CompletionSink::Accept(state),
            },
        );
        self.mark_op_queued(listener);
        self.driver.borrow_mut().submit_accept(raw_fd, token);
        chain
    }

    /// See [`IoContext::queue_multi_receive`]: servers that want a
    /// continuous accept loop requeue `queue_accept` themselves from
    /// their own completion handler.
    pub fn queue_multi_accept(self: &Rc<Self>, listener: Id) -> Chain<Id> {
        self.queue_accept(listener)
    }

    pub fn queue_connect(self: &Rc<Self>, id: Id, host: &str, port: u16) -> Chain<bool> {
        let (chain, state) = Chain::<bool>::new();
        let addr = match (host, port).to_socket_addrs().ok().and_then(|mut it| it.next()) {
            Some(a) => a,
            None => {
                state.complete(false);
                return chain;
            }
        };
        let raw_fd = match self.raw_fd_of(id) {
            Some(fd) => fd,
            None => {
                state.complete(false);
                return chain;
            }
        };
        if let Some(entry) = self.fds.borrow().get(&id) {
            entry.state.set(FdState::Connecting);
        }
        let token = self.next_token();
        self.ops.borrow_mut().insert(
            token,
            PendingOp {
                fd_id: id,
                sink: CompletionSink::Connect(state),
            },
        );
        self.mark_op_queued(id);
        self.driver.borrow_mut().submit_connect(raw_fd, addr, token);
        chain
    }

    pub fn close(&self, id: Id) {
        self.cancel_all_pending_operations_for(id);
        let raw_fd = {
            let mut fds = self.fds.borrow_mut();
            let Some(entry) = fds.get_mut(&id) else { return };
            if entry.state.get() == FdState::Closed {
                return;
            }
            entry.state.set(FdState::Closing);
            entry.raw_fd
        };
        let token = self.next_token();
        let (chain, state) = Chain::<bool>::new();
        chain.then_void(|_| {});
        self.ops.borrow_mut().insert(
            token,
            PendingOp {
                fd_id: id,
                sink: CompletionSink::Close(state),
            },
        );
        self.driver.borrow_mut().submit_close(raw_fd, token);
        if let Some(entry) = self.fds.borrow().get(&id) {
            entry.state.set(FdState::Closed);
        }
        tracing::debug!(?id, "fd closing");
    }

    pub fn cancel_all_pending_operations_for(&self, id: Id) {
        let tokens: Vec<u64> = self
            .ops
            .borrow()
            .iter()
            .filter(|(_, op)| op.fd_id == id)
            .map(|(t, _)| *t)
            .collect();
        let mut ops = self.ops.borrow_mut();
        for token in tokens {
            if let Some(op) = ops.remove(&token) {
                complete_with_failure(op.sink);
            }
        }
    }

    fn raw_fd_of(&self, id: Id) -> Option<RawFd> {
        let fds = self.fds.borrow();
        match fds.get(&id) {
            Some(entry) if entry.state.get() != FdState::Closed => Some(entry.raw_fd),
            _ => None,
        }
    }

    // ---- deferred dispatch -------------------------------------------------

    /// Route future completion dispatch through `dispatcher` instead of
    /// running continuations inline. One-time initialization: calling
    /// this after any operation has been queued is a contract
    /// violation (checked in debug builds only).
    pub fn force_deferred_execution(&self, dispatcher: Rc<dyn TaskDispatcher>, group: GroupId) {
        debug_assert!(
            !self.any_op_ever_queued.get(),
            "force_deferred_execution must run before any operation is queued"
        );
        *self.dispatcher.borrow_mut() = Some((dispatcher, group));
    }

    // ---- driving the event loop --------------------------------------------

    pub fn has_pending_operations(&self) -> bool {
        !self.ops.borrow().is_empty()
    }

    pub fn has_too_many_file_descriptors(&self) -> bool {
        let soft_limit = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
            .map(|(soft, _)| soft)
            .unwrap_or(1024);
        let count = self.fds.borrow().len() as u64;
        count * config::FD_PRESSURE_DENOMINATOR >= soft_limit as u64
    }

    /// One drive cycle: flush submissions, drain whatever completions
    /// are ready, and dispatch them.
    pub fn process(&self) {
        self.driver.borrow_mut().flush_submissions();
        self.process_completed_queries();
    }

    /// Drain and dispatch already-available completions without
    /// submitting anything new.
    pub fn process_completed_queries(&self) {
        let completions = self.driver.borrow_mut().drain_completions();
        for completion in completions {
            self.dispatch_completion(completion);
        }
    }

    pub fn _wait_for_queries(&self) {
        self.driver.borrow_mut().wait_for_completions();
        self.process_completed_queries();
    }

    pub fn _wait_for_submit_queries(&self) {
        self.process();
        while self.has_pending_operations() {
            self._wait_for_queries();
        }
    }

    fn dispatch_completion(&self, completion: DriverCompletion) {
        let Some(op) = self.ops.borrow_mut().remove(&completion.token) else {
            return;
        };
        if let Some(entry) = self.fds.borrow().get(&op.fd_id) {
            entry.pending_ops.set(entry.pending_ops.get().saturating_sub(1));
        }
        let ok = completion.result >= 0;
        let job: Box<dyn FnOnce()> = match op.sink {
            CompletionSink::Read(state) => {
                let n = if ok { completion.result as u32 } else { 0 };
                let mut bytes = completion.data.unwrap_or_default();
                bytes.truncate(n as usize);
                Box::new(move || state.complete((RawData::from_vec(bytes), ok, n)))
            }
            CompletionSink::Write(state) => {
                let n = if ok { completion.result as u32 } else { 0 };
                Box::new(move || state.complete((RawData::default(), ok, n)))
            }
            CompletionSink::Accept(state) => {
                let accepted = if ok {
                    Id::from_raw(completion.result as u64)
                } else {
                    Id::INVALID
                };
                Box::new(move || state.complete(accepted))
            }
            CompletionSink::Connect(state) => Box::new(move || state.complete(ok)),
            CompletionSink::Close(state) => Box::new(move || state.complete(ok)),
        };
        match self.dispatcher.borrow().as_ref() {
            Some((dispatcher, group)) => dispatcher.post(*group, job),
            None => job(),
        }
    }
}

fn complete_with_failure(sink: CompletionSink) {
    match sink {
        CompletionSink::Read(state) => state.complete((RawData::default(), false, 0)),
        CompletionSink::Write(state) => state.complete((RawData::default(), false, 0)),
        CompletionSink::Accept(state) => state.complete(Id::INVALID),
        CompletionSink::Connect(state) => state.complete(false),
        CompletionSink::Close(state) => state.complete(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_offsets_are_assigned_monotonically_at_submission_time() {
        let ctx = IoContext::new().expect("context");
        let dir = tempfile::tempdir().unwrap();
        ctx.set_prefix_directory(dir.path());
        let file = ctx.map_file("log.txt").unwrap();
        let first = ctx.queue_write(file, APPEND, RawData::allocate_from(b"abc"));
        let second = ctx.queue_write(file, APPEND, RawData::allocate_from(b"de"));
        drop(first);
        drop(second);
        let entry_offset = {
            let fds = ctx.fds.borrow();
            fds.get(&file).unwrap().next_append_offset.get()
        };
        assert_eq!(entry_offset, 5);
    }

    #[test]
    fn fd_pressure_uses_configured_denominator() {
        let ctx = IoContext::new().expect("context");
        assert!(!ctx.has_too_many_file_descriptors());
    }
}
