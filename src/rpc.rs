//! Minimal binary framing adapter for request/response protocols sent
//! over a [`crate::connection::Connection`] or broadcast to every
//! connection on a [`crate::server::BaseServer`].
//!
//! Frames are an 8-byte little-endian header (`magic: u32`,
//! `size: u32`, where `size` excludes the header itself) followed by
//! `size` payload bytes. `magic` is checked on receipt and rejected
//! otherwise — see [`HEADER_MAGIC`].

use std::cell::RefCell;
use std::rc::Rc;

use crate::connection::Connection;
use crate::raw_data::RawData;

/// Matches the frame magic used throughout this codebase's wire
/// format; chosen to be unlikely to show up as the leading bytes of an
/// unrelated stream.
pub const HEADER_MAGIC: u32 = 0xCACA_CACA;
pub const HEADER_SIZE: usize = 8;

pub struct FrameHeader {
    pub magic: u32,
    pub size: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            size: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.magic == HEADER_MAGIC
    }

    pub fn encode(payload_len: usize) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&(payload_len as u32).to_le_bytes());
        out
    }
}

/// Wrap an arbitrary payload in a framed message ready to send with
/// [`Connection::queue_full_send`].
pub fn frame(payload: &[u8]) -> RawData {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&FrameHeader::encode(payload.len()));
    bytes.extend_from_slice(payload);
    RawData::from_vec(bytes)
}

/// What a [`ScopedAdapter`] makes reachable through [`current_adapter`]:
/// the ability to frame and push a call out to whatever this adapter is
/// bound to (a single connection, or every connection of a server).
pub trait RpcAdapter {
    fn send_rpc(&self, payload: RawData);
}

/// Sends framed calls to one connection.
pub struct ConnectionAdapter {
    connection: Rc<Connection>,
}

impl ConnectionAdapter {
    pub fn new(connection: Rc<Connection>) -> Self {
        Self { connection }
    }
}

impl RpcAdapter for ConnectionAdapter {
    fn send_rpc(&self, payload: RawData) {
        let framed = frame(&payload);
        self.connection.queue_full_send(framed).then_void(|_| {});
    }
}

/// Sends framed calls to every connection currently active on a server.
pub struct BroadcastAdapter<C: crate::server::ServerConnection> {
    server: Rc<crate::server::BaseServer<C>>,
}

impl<C: crate::server::ServerConnection> BroadcastAdapter<C> {
    pub fn new(server: Rc<crate::server::BaseServer<C>>) -> Self {
        Self { server }
    }
}

impl<C: crate::server::ServerConnection> RpcAdapter for BroadcastAdapter<C> {
    fn send_rpc(&self, payload: RawData) {
        let framed = frame(&payload);
        self.server.for_each_connection(|conn| {
            conn.connection()
                .queue_full_send(framed.duplicate())
                .then_void(|_| {});
        });
    }
}

thread_local! {
    static CURRENT_ADAPTER: RefCell<Option<Rc<dyn RpcAdapter>>> = const { RefCell::new(None) };
}

/// RAII registration of the adapter calls made from within its scope
/// should be sent through. Single-threaded by design (a thread-local
/// slot, not a process-wide one) since every chain in this crate is
/// already confined to one thread.
pub struct ScopedAdapter {
    previous: Option<Rc<dyn RpcAdapter>>,
}

impl ScopedAdapter {
    pub fn new(adapter: Rc<dyn RpcAdapter>) -> Self {
        let previous = CURRENT_ADAPTER.with(|cell| cell.borrow_mut().replace(adapter));
        Self { previous }
    }
}

impl Drop for ScopedAdapter {
    fn drop(&mut self) {
        CURRENT_ADAPTER.with(|cell| *cell.borrow_mut() = self.previous.take());
    }
}

/// The adapter bound by the innermost live [`ScopedAdapter`], if any.
pub fn current_adapter() -> Option<Rc<dyn RpcAdapter>> {
    CURRENT_ADAPTER.with(|cell| cell.borrow().clone())
}

/// Send `payload` out through whichever adapter the innermost live
/// [`ScopedAdapter`] bound, framing it first. A no-op if no adapter is
/// currently scoped — mirrors issuing a call from code that hasn't been
/// wired into a connection or server adapter.
pub fn local_call(payload: RawData) {
    if let Some(adapter) = current_adapter() {
        adapter.send_rpc(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    struct RecordingAdapter {
        sent: Rc<StdRefCell<Vec<Vec<u8>>>>,
    }

    impl RpcAdapter for RecordingAdapter {
        fn send_rpc(&self, payload: RawData) {
            self.sent.borrow_mut().push(payload.into_vec());
        }
    }

    #[test]
    fn local_call_sends_through_the_scoped_adapter() {
        let sent = Rc::new(StdRefCell::new(Vec::new()));
        let adapter: Rc<dyn RpcAdapter> = Rc::new(RecordingAdapter { sent: sent.clone() });
        let _scope = ScopedAdapter::new(adapter);
        local_call(RawData::from_vec(b"ping".to_vec()));
        assert_eq!(sent.borrow().as_slice(), &[b"ping".to_vec()]);
    }

    #[test]
    fn local_call_without_a_scoped_adapter_is_a_no_op() {
        assert!(current_adapter().is_none());
        local_call(RawData::from_vec(b"ping".to_vec()));
    }

    #[test]
    fn frame_round_trips_header() {
        let framed = frame(b"hello");
        let header = FrameHeader::parse(&framed).unwrap();
        assert!(header.is_valid());
        assert_eq!(header.size, 5);
        assert_eq!(&framed[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn invalid_magic_is_rejected() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&0u32.to_le_bytes());
        let header = FrameHeader::parse(&bytes).unwrap();
        assert!(!header.is_valid());
    }
}
