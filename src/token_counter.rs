//! Reference count with a terminal callback, used to keep connection
//! state alive while operations are in flight. `Rc`/`Cell`-based like
//! every other shared counter in this crate — everything here lives on
//! the single thread that owns the `IoContext`, so there's no reason to
//! pay for atomics or a mutex.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct Inner {
    count: Cell<u64>,
    callback: RefCell<Option<Box<dyn FnOnce()>>>,
    callback_fired: Cell<bool>,
}

/// Shared counter. Cloning an existing `TokenCounter` does not itself
/// take a token — call [`TokenCounter::get_token`] for that.
#[derive(Clone)]
pub struct TokenCounter {
    inner: Rc<Inner>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                count: Cell::new(0),
                callback: RefCell::new(None),
                callback_fired: Cell::new(false),
            }),
        }
    }

    /// Increment the count and return a drop-guard that decrements it.
    pub fn get_token(&self) -> TokenRef {
        self.inner.count.set(self.inner.count.get() + 1);
        TokenRef {
            inner: self.inner.clone(),
        }
    }

    pub fn count(&self) -> u64 {
        self.inner.count.get()
    }

    /// Install the terminal callback. If the count is already zero (and
    /// has been held and released at least once, or was never taken at
    /// all) the callback fires immediately, inline, on this thread.
    pub fn set_callback(&self, callback: impl FnOnce() + 'static) {
        *self.inner.callback.borrow_mut() = Some(Box::new(callback));
        self.inner.maybe_fire();
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn maybe_fire(&self) {
        if self.count.get() != 0 {
            return;
        }
        if self.callback_fired.get() {
            return;
        }
        self.callback_fired.set(true);
        let cb = self.callback.borrow_mut().take();
        if let Some(cb) = cb {
            cb();
        }
    }
}

/// Drop-guard returned by [`TokenCounter::get_token`].
pub struct TokenRef {
    inner: Rc<Inner>,
}

impl Drop for TokenRef {
    fn drop(&mut self) {
        let prev = self.inner.count.get();
        debug_assert!(prev > 0, "token_counter underflow");
        self.inner.count.set(prev - 1);
        if prev == 1 {
            self.inner.maybe_fire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;

    #[test]
    fn callback_fires_once_all_tokens_dropped() {
        let tc = TokenCounter::new();
        let fired = Rc::new(StdCell::new(0u32));
        let t1 = tc.get_token();
        let t2 = tc.get_token();
        let f = fired.clone();
        tc.set_callback(move || {
            f.set(f.get() + 1);
        });
        assert_eq!(fired.get(), 0);
        drop(t1);
        assert_eq!(fired.get(), 0);
        drop(t2);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn callback_installed_after_zero_fires_immediately() {
        let tc = TokenCounter::new();
        let t = tc.get_token();
        drop(t);
        let fired = Rc::new(StdCell::new(0u32));
        let f = fired.clone();
        tc.set_callback(move || {
            f.set(f.get() + 1);
        });
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn never_held_a_token_still_fires_on_set() {
        let tc = TokenCounter::new();
        let fired = Rc::new(StdCell::new(0u32));
        let f = fired.clone();
        tc.set_callback(move || {
            f.set(f.get() + 1);
        });
        assert_eq!(fired.get(), 1);
    }
}
