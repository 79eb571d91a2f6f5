//! Portable driver for platforms without `io_uring`.
//!
//! Regular-file operations are always "ready" from the kernel's point
//! of view, so they're issued as plain positioned reads/writes.
//! Socket operations use `mio` to wait for readiness before issuing the
//! non-blocking syscall, rather than a real kernel completion queue —
//! each submission resolves synchronously inside `submit_*`, and
//! `drain_completions` just hands back what's already finished.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token as MioToken};

use super::driver::{DriverCompletion, IoDriver};

const POLL_BUDGET: Duration = Duration::from_millis(50);

pub struct FallbackDriver {
    poll: Poll,
    events: Events,
    ready: VecDeque<DriverCompletion>,
}

impl FallbackDriver {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            ready: VecDeque::new(),
        })
    }

    fn wait_writable(&mut self, fd: RawFd) -> io::Result<()> {
        self.wait_for(fd, Interest::WRITABLE)
    }

    fn wait_readable(&mut self, fd: RawFd) -> io::Result<()> {
        self.wait_for(fd, Interest::READABLE)
    }

    fn wait_for(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut source = mio::unix::SourceFd(&fd);
        self.poll
            .registry()
            .register(&mut source, MioToken(fd as usize), interest)?;
        let result = self.poll.poll(&mut self.events, Some(POLL_BUDGET));
        let _ = self.poll.registry().deregister(&mut source);
        result.map(|_| ())
    }

    fn push_result(&mut self, token: u64, result: i64, data: Option<Vec<u8>>) {
        self.ready.push_back(DriverCompletion {
            token,
            result,
            data,
        });
    }
}

impl IoDriver for FallbackDriver {
    fn submit_read(&mut self, fd: RawFd, offset: u64, len: usize, token: u64) {
        let mut buf = vec![0u8; len];
        let result = nix::sys::uio::pread(fd, &mut buf, offset as i64);
        match result {
            Ok(n) => {
                buf.truncate(n);
                self.push_result(token, n as i64, Some(buf));
            }
            Err(e) => self.push_result(token, -(e as i32 as i64), None),
        }
    }

    fn submit_write(&mut self, fd: RawFd, offset: u64, data: Vec<u8>, token: u64) {
        let result = nix::sys::uio::pwrite(fd, &data, offset as i64);
        match result {
            Ok(n) => self.push_result(token, n as i64, None),
            Err(e) => self.push_result(token, -(e as i32 as i64), None),
        }
    }

    fn submit_accept(&mut self, fd: RawFd, token: u64) {
        if self.wait_readable(fd).is_err() {
            self.push_result(token, -(libc::EIO as i64), None);
            return;
        }
        match nix::sys::socket::accept(fd) {
            Ok(new_fd) => self.push_result(token, new_fd as i64, None),
            Err(e) => self.push_result(token, -(e as i32 as i64), None),
        }
    }

    fn submit_connect(&mut self, fd: RawFd, addr: SocketAddr, token: u64) {
        use nix::sys::socket::{connect, SockaddrIn, SockaddrIn6};
        let result = match addr {
            SocketAddr::V4(v4) => connect(fd, &SockaddrIn::from(v4)),
            SocketAddr::V6(v6) => connect(fd, &SockaddrIn6::from(v6)),
        };
        let connect_ok = match result {
            Ok(()) => true,
            Err(nix::errno::Errno::EINPROGRESS) => self.wait_writable(fd).is_ok(),
            Err(_) => false,
        };
        self.push_result(token, if connect_ok { 0 } else { -1 }, None);
    }

    fn submit_send(&mut self, fd: RawFd, data: Vec<u8>, token: u64) {
        if self.wait_writable(fd).is_err() {
            self.push_result(token, -(libc::EIO as i64), None);
            return;
        }
        match nix::sys::socket::send(fd, &data, nix::sys::socket::MsgFlags::empty()) {
            Ok(n) => self.push_result(token, n as i64, None),
            Err(e) => self.push_result(token, -(e as i32 as i64), None),
        }
    }

    fn submit_recv(&mut self, fd: RawFd, len: usize, token: u64) {
        if self.wait_readable(fd).is_err() {
            self.push_result(token, -(libc::EIO as i64), None);
            return;
        }
        let mut buf = vec![0u8; len];
        match nix::sys::socket::recv(fd, &mut buf, nix::sys::socket::MsgFlags::empty()) {
            Ok(n) => {
                buf.truncate(n);
                self.push_result(token, n as i64, Some(buf));
            }
            Err(e) => self.push_result(token, -(e as i32 as i64), None),
        }
    }

    fn submit_close(&mut self, fd: RawFd, token: u64) {
        match nix::unistd::close(fd) {
            Ok(()) => self.push_result(token, 0, None),
            Err(e) => self.push_result(token, -(e as i32 as i64), None),
        }
    }

    fn flush_submissions(&mut self) {
        // Everything resolves synchronously inside `submit_*`.
    }

    fn wait_for_completions(&mut self) {
        // Nothing to wait for: completions are already queued.
    }

    fn drain_completions(&mut self) -> Vec<DriverCompletion> {
        self.ready.drain(..).collect()
    }
}
