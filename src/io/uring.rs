//! Linux `io_uring` completion-queue driver.
//!
//! This is the primary backend: submissions are batched into the
//! kernel's submission queue and completions are drained from the
//! completion queue in one syscall-light pass per [`IoContext::process`]
//! call. See [`super::driver::IoDriver`] for the narrow contract this
//! type implements.

#![cfg(target_os = "linux")]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use io_uring::{opcode, types, IoUring};

use super::driver::{DriverCompletion, IoDriver};

enum InFlightBuffer {
    Read(Vec<u8>),
    Write(Vec<u8>),
    SockAddr(Box<libc::sockaddr_storage>, libc::socklen_t),
    None,
}

struct InFlight {
    buffer: InFlightBuffer,
}

/// `io_uring`-backed driver. Owns the ring and the buffers of
/// in-flight reads/writes until their completion is drained.
pub struct UringDriver {
    ring: IoUring,
    in_flight: HashMap<u64, InFlight>,
}

impl UringDriver {
    pub fn new(queue_depth: u32) -> std::io::Result<Self> {
        Ok(Self {
            ring: IoUring::new(queue_depth)?,
            in_flight: HashMap::new(),
        })
    }

    fn push(&mut self, entry: io_uring::squeue::Entry) {
        // SAFETY: `entry` references buffers stored in `self.in_flight`
        // under the same user_data token, kept alive until the
        // corresponding completion is drained.
        unsafe {
            while self.ring.submission().push(&entry).is_err() {
                let _ = self.ring.submit();
            }
        }
    }
}

impl IoDriver for UringDriver {
    fn submit_read(&mut self, fd: RawFd, offset: u64, len: usize, token: u64) {
        let mut buf = vec![0u8; len];
        let entry = opcode::Read::new(types::Fd(fd), buf.as_mut_ptr(), len as u32)
            .offset(offset)
            .build()
            .user_data(token);
        self.in_flight.insert(
            token,
            InFlight {
                buffer: InFlightBuffer::Read(buf),
            },
        );
        self.push(entry);
    }

    fn submit_write(&mut self, fd: RawFd, offset: u64, data: Vec<u8>, token: u64) {
        let entry = opcode::Write::new(types::Fd(fd), data.as_ptr(), data.len() as u32)
            .offset(offset)
            .build()
            .user_data(token);
        self.in_flight.insert(
            token,
            InFlight {
                buffer: InFlightBuffer::Write(data),
            },
        );
        self.push(entry);
    }

    fn submit_accept(&mut self, fd: RawFd, token: u64) {
        let storage: Box<libc::sockaddr_storage> = Box::new(unsafe { std::mem::zeroed() });
        let len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let addr_ptr = &*storage as *const _ as *mut libc::sockaddr;
        let entry = opcode::Accept::new(types::Fd(fd), addr_ptr, std::ptr::null_mut())
            .build()
            .user_data(token);
        self.in_flight.insert(
            token,
            InFlight {
                buffer: InFlightBuffer::SockAddr(storage, len),
            },
        );
        self.push(entry);
    }

    fn submit_connect(&mut self, fd: RawFd, addr: SocketAddr, token: u64) {
        let (storage, len) = socket_addr_to_storage(addr);
        let boxed = Box::new(storage);
        let addr_ptr = &*boxed as *const _ as *const libc::sockaddr;
        let entry = opcode::Connect::new(types::Fd(fd), addr_ptr, len)
            .build()
            .user_data(token);
        self.in_flight.insert(
            token,
            InFlight {
                buffer: InFlightBuffer::SockAddr(boxed, len),
            },
        );
        self.push(entry);
    }

    fn submit_send(&mut self, fd: RawFd, data: Vec<u8>, token: u64) {
        let entry = opcode::Send::new(types::Fd(fd), data.as_ptr(), data.len() as u32)
            .build()
            .user_data(token);
        self.in_flight.insert(
            token,
            InFlight {
                buffer: InFlightBuffer::Write(data),
            },
        );
        self.push(entry);
    }

    fn submit_recv(&mut self, fd: RawFd, len: usize, token: u64) {
        let mut buf = vec![0u8; len];
        let entry = opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), len as u32)
            .build()
            .user_data(token);
        self.in_flight.insert(
            token,
            InFlight {
                buffer: InFlightBuffer::Read(buf),
            },
        );
        self.push(entry);
    }

    fn submit_close(&mut self, fd: RawFd, token: u64) {
        let entry = opcode::Close::new(types::Fd(fd)).build().user_data(token);
        self.in_flight.insert(
            token,
            InFlight {
                buffer: InFlightBuffer::None,
            },
        );
        self.push(entry);
    }

    fn flush_submissions(&mut self) {
        let _ = self.ring.submit();
    }

    fn wait_for_completions(&mut self) {
        let _ = self.ring.submit_and_wait(1);
    }

    fn drain_completions(&mut self) -> Vec<DriverCompletion> {
        let mut out = Vec::new();
        let mut cq = self.ring.completion();
        cq.sync();
        for cqe in &mut cq {
            let token = cqe.user_data();
            let result = cqe.result() as i64;
            let in_flight = self.in_flight.remove(&token);
            let data = match in_flight {
                Some(InFlight {
                    buffer: InFlightBuffer::Read(mut buf),
                }) => {
                    buf.truncate(result.max(0) as usize);
                    Some(buf)
                }
                _ => None,
            };
            out.push(DriverCompletion { token, result, data });
        }
        out
    }
}

fn socket_addr_to_storage(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: 0,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}
