//! Per-socket connection state and framing helpers built on top of
//! [`crate::io::IoContext`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::config;
use crate::id::Id;
use crate::io::IoContext;
use crate::raw_data::RawData;
use crate::ring_buffer::RingBuffer;
use crate::token_counter::TokenCounter;

/// A live socket plus the bookkeeping a server needs to keep it alive
/// while operations are in flight and to notice when it closes.
pub struct Connection {
    ioctx: Rc<IoContext>,
    socket: Cell<Id>,
    /// Keeps the connection's owning `Rc` alive while chains registered
    /// against it still hold a token, mirroring the original's
    /// in-flight-operations guard against destruction mid-operation.
    pub in_flight_operations: TokenCounter,
    /// Fired exactly once, from [`Connection::close`], after the socket
    /// has actually been closed. Mirrors `connection_t::on_close`; a
    /// server wires this to move the connection from its active table
    /// to its ending table.
    on_close: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Connection {
    pub fn new(ioctx: Rc<IoContext>, socket: Id) -> Self {
        Self {
            ioctx,
            socket: Cell::new(socket),
            in_flight_operations: TokenCounter::new(),
            on_close: RefCell::new(None),
        }
    }

    pub fn ioctx(&self) -> &Rc<IoContext> {
        &self.ioctx
    }

    pub fn socket(&self) -> Id {
        self.socket.get()
    }

    pub fn is_closed(&self) -> bool {
        self.socket.get().is_none()
    }

    /// Register the `on_close` handler. At most one is kept; a second
    /// call replaces the first.
    pub fn set_on_close(&self, f: impl FnOnce() + 'static) {
        *self.on_close.borrow_mut() = Some(Box::new(f));
    }

    pub fn close(&self) {
        if !self.is_closed() {
            self.ioctx.close(self.socket.get());
            self.socket.set(Id::NONE);
            if let Some(cb) = self.on_close.borrow_mut().take() {
                cb();
            }
        }
    }

    pub fn queue_send(&self, data: RawData) -> crate::chain::Chain<crate::io::IoResult> {
        self.ioctx.queue_send(self.socket.get(), data)
    }

    pub fn queue_full_send(&self, data: RawData) -> crate::chain::Chain<crate::io::IoResult> {
        self.ioctx.queue_full_send(self.socket.get(), data)
    }

    pub fn queue_receive(&self, size: usize) -> crate::chain::Chain<crate::io::IoResult> {
        self.ioctx.queue_receive(self.socket.get(), size)
    }

    pub fn queue_multi_receive(&self, max_size: usize) -> crate::chain::Chain<crate::io::IoResult> {
        self.ioctx.queue_multi_receive(self.socket.get(), max_size)
    }

    pub fn queue_full_receive(&self, size: usize) -> crate::chain::Chain<crate::io::IoResult> {
        self.ioctx.queue_full_receive(self.socket.get(), size)
    }
}

/// Implemented by a connection type that wants its incoming bytes
/// pushed into a fixed-size ring buffer as they arrive, rather than
/// framed into discrete packets. Mirrors `ring_buffer_connection_t`.
pub trait RingBufferConnection<const N: usize>: 'static {
    fn connection(&self) -> &Connection;
    fn read_buffer(&self) -> &RefCell<RingBuffer<u8, N>>;

    /// Called with the range of newly-inserted bytes (as an offset
    /// into the logical stream, not the ring buffer's own indexing).
    fn on_read(self: &Rc<Self>, _start_offset: u64, _size: u32) {}

    /// Called when the ring buffer is full and a read still has bytes
    /// left over. Default: give up on the connection, since without a
    /// consumer nothing will ever free space.
    fn on_buffer_full(self: &Rc<Self>) {
        self.connection().close();
    }
}

/// Starts the automatic receive loop for a [`RingBufferConnection`],
/// requeuing `queue_multi_receive` from inside its own completion
/// handler. This is the Rust shape of the original's single recursive
/// `async_read`: there's no kernel multi-shot receive here, so the loop
/// is driven explicitly.
pub fn start_ring_buffer_read<T, const N: usize>(this: Rc<T>)
where
    T: RingBufferConnection<N>,
{
    let tk = this.connection().in_flight_operations.get_token();
    step(this, tk);

    fn step<T, const N: usize>(this: Rc<T>, tk: crate::token_counter::TokenRef)
    where
        T: RingBufferConnection<N>,
    {
        let chunk = this
            .connection()
            .queue_multi_receive(config::DEFAULT_RING_READ_CHUNK);
        chain_then(chunk, move |(data, ok, n)| {
            if !ok || n == 0 {
                return;
            }
            let mut total_offset: u64;
            {
                let mut buf = this.read_buffer().borrow_mut();
                total_offset = buf.size() as u64;
                let mut it = data.as_slice()[..n as usize].iter().copied();
                let mut inserted = buf.push_back(&mut it);
                drop(buf);
                this.on_read(total_offset, inserted as u32);
                while inserted < n as usize {
                    if this.connection().is_closed() {
                        return;
                    }
                    let mut buf = this.read_buffer().borrow_mut();
                    if buf.free_space() == 0 {
                        drop(buf);
                        this.on_buffer_full();
                        break;
                    }
                    total_offset = buf.size() as u64;
                    let remaining = n as usize - inserted;
                    let mut it = data.as_slice()[inserted..inserted + remaining]
                        .iter()
                        .copied();
                    let just_inserted = buf.push_back(&mut it);
                    drop(buf);
                    inserted += just_inserted;
                    this.on_read(total_offset, just_inserted as u32);
                    if just_inserted == 0 {
                        this.on_buffer_full();
                        break;
                    }
                }
            }
            if !this.connection().is_closed() {
                step(this, tk);
            }
        });
    }
}

fn chain_then<T: 'static>(chain: crate::chain::Chain<T>, f: impl FnOnce(T) + 'static) {
    chain.then_void(f);
}

/// Implemented by a connection type whose packets are framed by a
/// fixed-size header naming the size of a variable-length payload.
/// Mirrors `header_connection_t`. `HEADER_SIZE` is the byte length of
/// whatever header representation `parse_header` expects.
pub trait HeaderFramedConnection: 'static {
    const HEADER_SIZE: usize;
    const MAX_DATA_SIZE: usize;

    fn connection(&self) -> &Connection;

    /// Reject malformed headers before any payload read is queued.
    fn is_header_valid(&self, _header: &[u8]) -> bool {
        true
    }

    /// How many payload bytes follow this header.
    fn size_of_data_to_read(&self, header: &[u8]) -> usize;

    /// A payload exceeding `MAX_DATA_SIZE` arrived; the connection is
    /// closed immediately afterward.
    fn on_packet_oversized(self: &Rc<Self>, _header: &[u8]) {}

    /// A full packet arrived. The next header read is already queued
    /// by the time this runs, mirroring the original's
    /// requeue-before-dispatch ordering.
    fn on_packet(self: &Rc<Self>, header: Vec<u8>, payload: RawData);
}

/// Starts the automatic header/payload read loop for a
/// [`HeaderFramedConnection`].
pub fn start_header_framed_read<T>(this: Rc<T>)
where
    T: HeaderFramedConnection,
{
    read_header(this);

    fn read_header<T: HeaderFramedConnection>(this: Rc<T>) {
        if this.connection().is_closed() {
            return;
        }
        let chain = this.connection().queue_full_receive(T::HEADER_SIZE);
        chain.then_void(move |(header_bytes, ok, _n)| {
            if !ok {
                return;
            }
            let header = header_bytes.into_vec();
            if !this.is_header_valid(&header) {
                this.connection().close();
                return;
            }
            let read_size = this.size_of_data_to_read(&header);
            if read_size > T::MAX_DATA_SIZE {
                this.on_packet_oversized(&header);
                this.connection().close();
                return;
            }
            read_payload(this, header, read_size);
        });
    }

    fn read_payload<T: HeaderFramedConnection>(this: Rc<T>, header: Vec<u8>, size: usize) {
        let chain = this.connection().queue_full_receive(size);
        chain.then_void(move |(payload, ok, _n)| {
            if !ok {
                return;
            }
            read_header(this.clone());
            this.on_packet(header, payload);
        });
    }
}
