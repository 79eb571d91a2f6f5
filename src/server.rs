//! Listening-socket + connection-table boilerplate shared by every
//! server built on [`crate::io::IoContext`]. Mirrors
//! `base_server_interface`/`base_server`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::config;
use crate::connection::Connection;
use crate::error::IoSetupError;
use crate::id::Id;
use crate::io::IoContext;

/// A connection type a [`BaseServer`] can own. `from_accepted` decides
/// whether to keep the new socket (returning the wrapped connection)
/// or reject it (returning `None`, e.g. past some protocol-level
/// admission check); whatever per-connection read loop it needs
/// (ring-buffer or header-framed) is its own job to start before
/// returning.
pub trait ServerConnection: Sized + 'static {
    fn from_accepted(conn: Connection) -> Option<Rc<Self>>;
    fn connection(&self) -> &Connection;
}

/// Owns a listening socket and the table of connections accepted on
/// it. Connections are keyed by their socket [`Id`] rather than by
/// pointer identity — ids are already a stable, unique, `Copy` handle
/// in this codebase, so there's no need for the original's
/// pointer-keyed map.
pub struct BaseServer<C: ServerConnection> {
    ioctx: Rc<IoContext>,
    listen_socket: RefCell<Option<Id>>,
    max_connection_count: u32,
    active_connections: RefCell<HashMap<Id, Rc<C>>>,
    ended_connections: RefCell<HashMap<Id, Rc<C>>>,
}

impl<C: ServerConnection> BaseServer<C> {
    pub fn new(ioctx: Rc<IoContext>, max_connection_count: u32) -> Self {
        Self {
            ioctx,
            listen_socket: RefCell::new(None),
            max_connection_count,
            active_connections: RefCell::new(HashMap::new()),
            ended_connections: RefCell::new(HashMap::new()),
        }
    }

    pub fn with_default_limits(ioctx: Rc<IoContext>) -> Self {
        Self::new(ioctx, config::DEFAULT_MAX_CONNECTIONS)
    }

    pub fn listen(self: &Rc<Self>, port: u16) -> Result<u16, IoSetupError> {
        let socket = self.ioctx.create_listening_socket(port)?;
        let actual_port = self.ioctx.get_socket_port(socket).unwrap_or(port);
        *self.listen_socket.borrow_mut() = Some(socket);
        Ok(actual_port)
    }

    pub fn is_listening_socket_closed(&self) -> bool {
        self.listen_socket.borrow().is_none()
    }

    pub fn close_listening_socket(&self) {
        if let Some(socket) = self.listen_socket.borrow_mut().take() {
            self.ioctx.close(socket);
        }
    }

    pub fn close_all_connections(&self) {
        let ids: Vec<Id> = self.active_connections.borrow().keys().copied().collect();
        for id in ids {
            let conn = self.active_connections.borrow().get(&id).cloned();
            if let Some(conn) = conn {
                conn.connection().close();
            }
        }
    }

    pub fn has_any_connections(&self) -> bool {
        !self.active_connections.borrow().is_empty()
    }

    pub fn get_connection_count(&self) -> usize {
        self.active_connections.borrow().len()
    }

    /// Run `f` for every currently-active connection. Takes a snapshot
    /// of the ids up front and re-looks-up each one by key before
    /// calling `f`, so a callback that removes connections (e.g. by
    /// closing one) can't invalidate the iteration — the equivalent of
    /// the original's lock-release-before-callback, upper-bound-based
    /// resumption, minus the actual lock: everything here runs on one
    /// thread, so there's no concurrent mutator to guard against.
    pub fn for_each_connection<F: FnMut(&Rc<C>)>(&self, mut f: F) {
        let ids: Vec<Id> = self.active_connections.borrow().keys().copied().collect();
        for id in ids {
            let conn = self.active_connections.borrow().get(&id).cloned();
            if let Some(conn) = conn {
                f(&conn);
            }
        }
    }

    fn admit_new_connection(&self) -> bool {
        self.active_connections.borrow().len() < self.max_connection_count as usize
            && !self.ioctx.has_too_many_file_descriptors()
    }

    fn move_to_ended(&self, id: Id) {
        if let Some(conn) = self.active_connections.borrow_mut().remove(&id) {
            self.ended_connections.borrow_mut().insert(id, conn);
        }
    }
}

/// Runs the automatic accept loop for `server`: requeues
/// `queue_accept` from inside its own completion handler, same
/// single-shot-plus-manual-requeue shape as the read loops in
/// [`crate::connection`].
pub fn start_accept_loop<C: ServerConnection>(server: Rc<BaseServer<C>>) {
    let Some(listen_socket) = *server.listen_socket.borrow() else {
        return;
    };
    step(server, listen_socket);

    fn step<C: ServerConnection>(server: Rc<BaseServer<C>>, listen_socket: Id) {
        if server.is_listening_socket_closed() {
            return;
        }
        let ioctx = server.ioctx.clone();
        let accepted = ioctx.queue_accept(listen_socket);
        accepted.then_void(move |new_socket| {
            if server.is_listening_socket_closed() {
                return;
            }
            if new_socket.is_invalid() {
                step(server, listen_socket);
                return;
            }
            if server.admit_new_connection() {
                let conn = Connection::new(server.ioctx.clone(), new_socket);
                if let Some(handle) = C::from_accepted(conn) {
                    let id = handle.connection().socket();
                    let server_for_close = server.clone();
                    handle.connection().set_on_close(move || {
                        retire_connection(&server_for_close, id);
                    });
                    server.active_connections.borrow_mut().insert(id, handle);
                }
            } else {
                server.ioctx.close(new_socket);
            }
            step(server, listen_socket);
        });
    }
}

/// Drop a connection from the active table into the ended table once
/// it has closed, then arm its final removal from the ended table for
/// the moment its last in-flight operation drains — called from a
/// connection's own `on_close` hook, wired up by [`start_accept_loop`].
pub fn retire_connection<C: ServerConnection>(server: &Rc<BaseServer<C>>, id: Id) {
    server.move_to_ended(id);
    let conn = server.ended_connections.borrow().get(&id).cloned();
    if let Some(conn) = conn {
        let server = server.clone();
        conn.connection()
            .in_flight_operations
            .set_callback(move || {
                server.ended_connections.borrow_mut().remove(&id);
            });
    }
}
