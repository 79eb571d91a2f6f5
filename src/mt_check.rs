//! Debug-only access-pattern checker.
//!
//! Embed an [`MtChecker`] in a container to assert that it's never
//! accessed for writing while a read or another write is in progress.
//! Compiles away to nothing when debug assertions are disabled — it is
//! never load-bearing for correctness, only for catching misuse early.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

/// Packed reader/writer counters plus the id of the current writer
/// thread (writers may reenter).
pub struct MtChecker {
    readers: AtomicI64,
    writers: AtomicI64,
    writer_thread: AtomicU64,
}

fn thread_id_as_u64(id: ThreadId) -> u64 {
    // ThreadId has no stable numeric conversion; hash it instead.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

impl MtChecker {
    pub const fn new() -> Self {
        Self {
            readers: AtomicI64::new(0),
            writers: AtomicI64::new(0),
            writer_thread: AtomicU64::new(0),
        }
    }

    pub fn enter_read_section(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let current = thread_id_as_u64(thread::current().id());
        let writers = self.writers.load(Ordering::Acquire);
        if writers > 0 {
            debug_assert_eq!(
                self.writer_thread.load(Ordering::Acquire),
                current,
                "concurrent read while another thread holds the write section"
            );
        }
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn leave_read_section(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn enter_write_section(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let current = thread_id_as_u64(thread::current().id());
        let writers = self.writers.fetch_add(1, Ordering::AcqRel);
        if writers == 0 {
            self.writer_thread.store(current, Ordering::Release);
        } else {
            debug_assert_eq!(
                self.writer_thread.load(Ordering::Acquire),
                current,
                "concurrent write from two different threads"
            );
        }
        debug_assert_eq!(
            self.readers.load(Ordering::Acquire),
            0,
            "write section entered while readers are active"
        );
    }

    pub fn leave_write_section(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        self.writers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn check_no_access(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        debug_assert_eq!(self.readers.load(Ordering::Acquire), 0, "reader active");
        debug_assert_eq!(self.writers.load(Ordering::Acquire), 0, "writer active");
    }
}

impl Default for MtChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a read section.
pub struct ReadGuard<'a>(&'a MtChecker);
impl<'a> ReadGuard<'a> {
    pub fn new(checker: &'a MtChecker) -> Self {
        checker.enter_read_section();
        Self(checker)
    }
}
impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.leave_read_section();
    }
}

/// RAII guard for a write section.
pub struct WriteGuard<'a>(&'a MtChecker);
impl<'a> WriteGuard<'a> {
    pub fn new(checker: &'a MtChecker) -> Self {
        checker.enter_write_section();
        Self(checker)
    }
}
impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.leave_write_section();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_write_from_same_thread_is_allowed() {
        let checker = MtChecker::new();
        let _a = WriteGuard::new(&checker);
        let _b = WriteGuard::new(&checker);
    }

    #[test]
    fn no_access_after_guards_drop() {
        let checker = MtChecker::new();
        {
            let _g = ReadGuard::new(&checker);
        }
        checker.check_no_access();
    }
}
