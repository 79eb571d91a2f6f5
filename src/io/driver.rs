//! Narrow kernel-completion-queue contract that both the `io_uring`
//! driver and the portable fallback driver implement.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// One resolved operation, as handed back by the kernel (or the
/// fallback driver standing in for it).
pub struct DriverCompletion {
    /// Echoes the token the submission was tagged with.
    pub token: u64,
    /// `>= 0`: success, operation-specific meaning (bytes transferred,
    /// accepted fd, ...). `< 0`: negated errno.
    pub result: i64,
    /// Populated for read/receive-shaped operations.
    pub data: Option<Vec<u8>>,
}

/// What [`super::IoContext`] needs from a kernel completion-queue
/// backend. Submissions are fire-and-forget; results arrive later
/// through [`IoDriver::drain_completions`].
pub trait IoDriver {
    fn submit_read(&mut self, fd: RawFd, offset: u64, len: usize, token: u64);
    fn submit_write(&mut self, fd: RawFd, offset: u64, data: Vec<u8>, token: u64);
    fn submit_accept(&mut self, fd: RawFd, token: u64);
    fn submit_connect(&mut self, fd: RawFd, addr: SocketAddr, token: u64);
    fn submit_send(&mut self, fd: RawFd, data: Vec<u8>, token: u64);
    fn submit_recv(&mut self, fd: RawFd, len: usize, token: u64);
    fn submit_close(&mut self, fd: RawFd, token: u64);

    /// Push all queued submissions to the kernel without blocking.
    fn flush_submissions(&mut self);
    /// Block until at least one completion is available.
    fn wait_for_completions(&mut self);
    /// Drain whatever completions are currently available; does not block.
    fn drain_completions(&mut self) -> Vec<DriverCompletion>;
}
