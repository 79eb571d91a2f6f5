//! Tunable parameters for the I/O context and server helpers.

/// Submission-queue depth requested from `io_uring` at context creation.
///
/// A larger value allows more in-flight operations to be batched into a
/// single kernel round trip, at the cost of more pinned kernel memory.
pub const IO_URING_QUEUE_DEPTH: u32 = 256;

/// Default cap on simultaneously active connections for a server that
/// doesn't specify its own limit.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 32;

/// Size of the read chunk used by `ring_buffer_connection_t`-style
/// connections when no explicit size is requested by the caller.
pub const DEFAULT_RING_READ_CHUNK: usize = 32;

/// Capacity reserved up front for the pending-operations queue of a
/// freshly mapped file descriptor, to avoid reallocating on the first
/// few submissions.
pub const INITIAL_PENDING_OPS_CAPACITY: usize = 16;

/// Fraction (as a denominator) of `rlimit(NOFILE)` above which
/// `IoContext::has_too_many_file_descriptors` starts reporting pressure.
pub const FD_PRESSURE_DENOMINATOR: u64 = 10;
