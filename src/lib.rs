//! neam-io: a single-threaded, completion-based I/O runtime.
//!
//! The core primitive is [`chain::Chain`]/[`chain::State`]: a move-only,
//! single-shot continuation pair with no polling and no waker. An
//! [`io::IoContext`] submits reads, writes, accepts and connects to a
//! kernel completion queue (`io_uring` on Linux, a portable `mio`/`nix`
//! driver elsewhere) and resolves each operation's chain the moment its
//! result comes back.
//!
//! ## IO backend selection
//!
//! `io_uring` is used when available; [`io::fallback::FallbackDriver`]
//! covers every other case. See `build.rs` for the kernel-version probe
//! that used to pick between `io_uring`/`epoll`/`kqueue` — it's now also
//! the signal this crate uses to prefer the `io_uring` driver.
//!
//! ## Server building blocks
//!
//! [`server::BaseServer`] manages a listening socket and a table of
//! live connections; [`connection`] provides ring-buffer and
//! length-prefixed framing helpers built on top of a raw [`io::IoContext`]
//! connection id; [`rpc`] adds a minimal binary framing adapter for
//! request/response protocols.

#![deny(warnings)]

pub mod chain;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod io;
pub mod mt_check;
pub mod multi_chain;
pub mod raw_data;
pub mod ring_buffer;
pub mod rpc;
pub mod server;
pub mod token_counter;

pub use chain::{Chain, State};
pub use dispatch::{GroupId, InlineDispatcher, TaskDispatcher};
pub use error::IoSetupError;
pub use id::{Id, IdAllocator};
pub use io::{IoContext, IoResult};
pub use multi_chain::{cancel_all, multi_chain, multi_chain_collect, multi_chain_fold};
pub use raw_data::RawData;
pub use ring_buffer::RingBuffer;
pub use token_counter::{TokenCounter, TokenRef};
