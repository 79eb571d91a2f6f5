//! End-to-end behavioral scenarios exercising the chain/io stack as a
//! whole, rather than one module at a time.

mod common;

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use neam_io::chain::Chain;
use neam_io::connection::{start_ring_buffer_read, Connection, RingBufferConnection};
use neam_io::io::{IoContext, APPEND, WHOLE_FILE};
use neam_io::multi_chain::multi_chain;
use neam_io::raw_data::RawData;
use neam_io::ring_buffer::RingBuffer;
use neam_io::server::{start_accept_loop, BaseServer, ServerConnection};

/// Recursive fan-out depth: an outer loop of 4097 steps, each driving an
/// inner loop of 4097 steps built entirely out of `then_chain`
/// composition, never a plain Rust loop — the whole point is proving
/// this doesn't blow the stack. 4097 * 4097 == 16,785,409.
#[test]
fn recursive_fan_out_reaches_expected_entry_count() {
    common::setup_tracing();

    fn inner(j: u32, counter: Rc<Cell<u64>>) -> Chain<()> {
        counter.set(counter.get() + 1);
        if j >= 4096 {
            Chain::create_and_complete(())
        } else {
            inner(j + 1, counter)
        }
    }

    fn outer(i: u32, counter: Rc<Cell<u64>>) -> Chain<()> {
        if i > 4096 {
            return Chain::create_and_complete(());
        }
        let counter2 = counter.clone();
        inner(0, counter).then_chain(move |_| outer(i + 1, counter2))
    }

    let counter = Rc::new(Cell::new(0u64));
    let done = Rc::new(Cell::new(false));
    let done2 = done.clone();
    outer(0, counter.clone()).then_void(move |_| done2.set(true));

    assert!(done.get());
    assert_eq!(counter.get(), 4097u64 * 4097u64);
    assert_eq!(counter.get(), 16_785_409);
}

/// A million append writes queued without waiting between submissions;
/// after draining, the file must be exactly `1_000_000 * 20` bytes.
#[test]
fn one_million_append_writes_produce_exact_file_size() {
    common::setup_tracing();

    let ctx = IoContext::new().expect("io context");
    let dir = tempfile::tempdir().unwrap();
    ctx.set_prefix_directory(dir.path());
    let file = ctx.map_file("appended.log").unwrap();

    const RECORD: &[u8] = b"more and more data!\n";
    assert_eq!(RECORD.len(), 20);

    const COUNT: usize = 1_000_000;
    for _ in 0..COUNT {
        ctx.queue_write(file, APPEND, RawData::allocate_from(RECORD))
            .then_void(|_| {});
    }
    ctx._wait_for_submit_queries();

    assert_eq!(ctx.get_file_size(file), Some((COUNT * RECORD.len()) as u64));
}

/// Writes are queued one at a time, each submitted from inside the
/// previous write's completion, terminating with a distinct trailer.
#[test]
fn chained_append_writes_end_with_exact_trailer() {
    common::setup_tracing();

    let ctx = IoContext::new().expect("io context");
    let dir = tempfile::tempdir().unwrap();
    ctx.set_prefix_directory(dir.path());
    let file = ctx.map_file("chained.log").unwrap();

    const RECORD: &[u8] = b"more and more data!\n";
    const TRAILER: &[u8] = b"[last operation !]\n";
    const COUNT: usize = 1_000_000;
    assert_eq!(RECORD.len(), 20);
    assert_eq!(TRAILER.len(), 19);

    fn write_next(ctx: Rc<IoContext>, file: neam_io::id::Id, remaining: usize) {
        if remaining == 0 {
            ctx.queue_write(file, APPEND, RawData::allocate_from(TRAILER))
                .then_void(|_| {});
            return;
        }
        ctx.queue_write(file, APPEND, RawData::allocate_from(RECORD))
            .then_void(move |_| {
                write_next(ctx, file, remaining - 1);
            });
    }

    write_next(ctx.clone(), file, COUNT);
    ctx._wait_for_submit_queries();

    assert_eq!(
        ctx.get_file_size(file),
        Some((COUNT * RECORD.len() + TRAILER.len()) as u64)
    );

    let tail_chain = ctx.queue_read(file, WHOLE_FILE, WHOLE_FILE);
    let tail = Rc::new(RefCell::new(None));
    let tail2 = tail.clone();
    tail_chain.then_void(move |(data, ok, _n)| {
        if ok {
            *tail2.borrow_mut() = Some(data.into_vec());
        }
    });
    ctx._wait_for_submit_queries();

    let contents = tail.borrow_mut().take().expect("whole-file read completed");
    assert!(contents.ends_with(TRAILER));
}

/// 8-way-fanout scatter-gather copy: each of the 8 workers reads its
/// own chunk and writes it straight back out at the same offset, then
/// advances by `fanout * chunk_size` until it runs past the end.
#[test]
fn scatter_gather_copy_reproduces_source_file() {
    common::setup_tracing();

    const CHUNK_SIZE: u64 = 1024;
    const FANOUT: u64 = 8;

    let ctx = IoContext::new().expect("io context");
    let dir = tempfile::tempdir().unwrap();
    ctx.set_prefix_directory(dir.path());

    let source_bytes: Vec<u8> = (0..(CHUNK_SIZE * FANOUT * 3 + 137))
        .map(|i| (i % 251) as u8)
        .collect();
    std::fs::write(dir.path().join("source.bin"), &source_bytes).unwrap();

    let source = ctx.map_file("source.bin").unwrap();
    let dest = ctx.map_file("dest.bin").unwrap();

    fn worker(ctx: Rc<IoContext>, source: neam_io::id::Id, dest: neam_io::id::Id, offset: u64) -> Chain<()> {
        const CHUNK_SIZE: u64 = 1024;
        const FANOUT: u64 = 8;
        ctx.queue_read(source, offset, CHUNK_SIZE).then_chain(move |(data, ok, n)| {
            if !ok || n == 0 {
                return Chain::create_and_complete(());
            }
            let mut chunk = data;
            chunk.truncate(n as usize);
            let ctx2 = ctx.clone();
            ctx.queue_write(dest, offset, chunk).then_chain(move |_| {
                worker(ctx2, source, dest, offset + CHUNK_SIZE * FANOUT)
            })
        })
    }

    let workers: Vec<Chain<()>> = (0..FANOUT)
        .map(|i| worker(ctx.clone(), source, dest, i * CHUNK_SIZE))
        .collect();

    let done = Rc::new(Cell::new(false));
    let done2 = done.clone();
    multi_chain(workers).then_void(move |()| done2.set(true));

    ctx._wait_for_submit_queries();
    assert!(done.get());

    let dest_bytes = std::fs::read(dir.path().join("dest.bin")).unwrap();
    assert_eq!(dest_bytes, source_bytes);
}

struct EchoConnection {
    connection: Connection,
    read_buffer: RefCell<RingBuffer<u8, 2048>>,
}

impl RingBufferConnection<2048> for EchoConnection {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn read_buffer(&self) -> &RefCell<RingBuffer<u8, 2048>> {
        &self.read_buffer
    }

    fn on_read(self: &Rc<Self>, _start_offset: u64, _size: u32) {
        loop {
            let line = {
                let mut buf = self.read_buffer.borrow_mut();
                let mut newline_at = None;
                for i in 0..buf.size() {
                    if *buf.at(i) == b'\n' {
                        newline_at = Some(i);
                        break;
                    }
                }
                match newline_at {
                    Some(i) => Some(String::from_utf8_lossy(&buf.pop_bytes(i + 1)).into_owned()),
                    None => None,
                }
            };
            let Some(line) = line else { break };
            let line = line.trim_end_matches('\n');
            if line == "/close" {
                self.connection
                    .queue_full_send(RawData::allocate_from(b"[goodbie]\n"))
                    .then_void(|_| {});
                self.connection.close();
                break;
            } else {
                let reply = format!("[{line}]\n");
                self.connection
                    .queue_send(RawData::allocate_from(reply.as_bytes()))
                    .then_void(|_| {});
            }
        }
    }
}

impl ServerConnection for EchoConnection {
    fn from_accepted(conn: Connection) -> Option<Rc<Self>> {
        let handle = Rc::new(EchoConnection {
            connection: conn,
            read_buffer: RefCell::new(RingBuffer::new()),
        });
        start_ring_buffer_read(handle.clone());
        Some(handle)
    }

    fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[test]
fn line_echo_server_handles_close_sequence() {
    common::setup_tracing();

    let ctx = IoContext::new().expect("io context");
    let server = Rc::new(BaseServer::<EchoConnection>::with_default_limits(ctx.clone()));
    let port = server.listen(0).expect("listen");
    start_accept_loop(server.clone());

    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream.write_all(b"hello\n/close\n").unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(10).any(|w| w == b"[goodbie]\n") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        buf
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while !client.is_finished() && Instant::now() < deadline {
        ctx.process();
        std::thread::sleep(Duration::from_millis(5));
    }

    let received = client.join().expect("client thread");
    assert_eq!(received, b"[hello]\n[goodbie]\n");
}
