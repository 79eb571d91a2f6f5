//! Single-shot, move-only continuation primitive.
//!
//! A [`Chain<T>`] / [`State<T>`] pair is produced together by
//! [`Chain::new`]. The `State` is the producer side: it completes at
//! most once, carrying a value of type `T` (typically a tuple) to
//! whoever registered a continuation on the paired `Chain`. There is no
//! polling and no waker: a continuation runs synchronously, inline, on
//! whichever thread calls [`State::complete`], the moment a value is
//! available.
//!
//! Both halves share one reference-counted cell rather than the raw
//! mutual back-pointers of the systems this is adapted from — `Rc` does
//! the "clear my peer's pointer on drop" bookkeeping for free, and as a
//! side effect makes the non-thread-safety of a chain a compile-time
//! fact: `Rc<RefCell<_>>` is neither `Send` nor `Sync`.

use std::cell::RefCell;
use std::rc::Rc;

enum Slot<T> {
    /// No continuation installed yet, no value produced yet.
    Pending,
    /// A continuation is installed; the producer's `complete` will
    /// invoke it.
    Continuation(Box<dyn FnOnce(T)>),
    /// The producer completed before a continuation was registered.
    Completed(T),
    /// `cancel()` was called; future `complete` calls are no-ops.
    Canceled,
    /// Terminal: the continuation has already run, or the value has
    /// already been taken.
    Done,
}

struct Shared<T> {
    slot: RefCell<Slot<T>>,
    /// Fired at most once, the moment this chain is canceled — either
    /// directly via [`Chain::cancel`] or through a [`CancelToken`]
    /// cloned from it. Lets a combinator built on top of a chain (e.g.
    /// `multi_chain`) propagate cancellation of its output down to
    /// still-pending inputs it no longer holds a `Chain` handle for.
    on_cancel: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// The consumer half of a chain. Register a continuation with
/// [`Chain::then_void`]/[`Chain::then`]/[`Chain::then_chain`], or give up
/// the chain entirely with [`Chain::cancel`].
pub struct Chain<T> {
    cell: Rc<Shared<T>>,
}

/// The producer half of a chain.
pub struct State<T> {
    cell: Rc<Shared<T>>,
}

/// A handle that can cancel a chain without consuming it, obtained via
/// [`Chain::cancel_token`]. Used by combinators that need to retain the
/// ability to cancel an input after having already registered their own
/// continuation on it.
pub struct CancelToken<T> {
    cell: Rc<Shared<T>>,
}

impl<T> CancelToken<T> {
    pub fn cancel(&self) {
        cancel_cell(&self.cell);
    }
}

fn cancel_cell<T>(cell: &Rc<Shared<T>>) {
    *cell.slot.borrow_mut() = Slot::Canceled;
    let hook = cell.on_cancel.borrow_mut().take();
    if let Some(hook) = hook {
        hook();
    }
}

impl<T> Chain<T> {
    /// Create a linked chain/state pair, both initially pending.
    pub fn new() -> (Chain<T>, State<T>) {
        let cell = Rc::new(Shared {
            slot: RefCell::new(Slot::Pending),
            on_cancel: RefCell::new(None),
        });
        (
            Chain {
                cell: cell.clone(),
            },
            State { cell },
        )
    }

    /// Build a chain whose value is already available — no separate
    /// state object is created since there's nothing left to produce.
    pub fn create_and_complete(args: T) -> Chain<T> {
        Chain {
            cell: Rc::new(Shared {
                slot: RefCell::new(Slot::Completed(args)),
                on_cancel: RefCell::new(None),
            }),
        }
    }

    /// A handle that can cancel this chain later without consuming it
    /// now — e.g. retained alongside a `then_void` registration.
    pub fn cancel_token(&self) -> CancelToken<T> {
        CancelToken {
            cell: self.cell.clone(),
        }
    }

    /// Register a hook that runs the moment this chain is canceled
    /// (directly, or via any [`CancelToken`] cloned from it). Returns
    /// `self` so it composes with the rest of the builder-style API.
    pub fn on_cancel(self, f: impl FnOnce() + 'static) -> Chain<T> {
        *self.cell.on_cancel.borrow_mut() = Some(Box::new(f));
        self
    }

    /// Register a continuation that consumes the chain's value and
    /// produces nothing. Runs immediately if the value is already here.
    pub fn then_void<F>(self, f: F)
    where
        F: FnOnce(T) + 'static,
    {
        enum Action<T> {
            InvokeNow(T),
            Installed,
        }
        let action;
        {
            let mut slot = self.cell.slot.borrow_mut();
            let prev = std::mem::replace(&mut *slot, Slot::Done);
            action = match prev {
                Slot::Completed(args) => Action::InvokeNow(args),
                Slot::Pending => {
                    *slot = Slot::Continuation(Box::new(f));
                    Action::Installed
                }
                Slot::Canceled => {
                    *slot = Slot::Canceled;
                    Action::Installed
                }
                Slot::Continuation(_) | Slot::Done => {
                    debug_assert!(false, "chain already has a continuation registered");
                    Action::Installed
                }
            };
        }
        if let Action::InvokeNow(args) = action {
            f(args);
        }
    }

    /// Map the eventual value through `f`, returning a chain that
    /// completes with `f`'s result.
    pub fn then<R, F>(self, f: F) -> Chain<R>
    where
        F: FnOnce(T) -> R + 'static,
        R: 'static,
    {
        let (out_chain, out_state) = Chain::<R>::new();
        self.then_void(move |args| {
            out_state.complete(f(args));
        });
        out_chain
    }

    /// Map the eventual value through `f`, where `f` itself returns
    /// another chain — flattens so the outer chain completes when the
    /// inner one does, without nesting continuations.
    pub fn then_chain<B, F>(self, f: F) -> Chain<B>
    where
        F: FnOnce(T) -> Chain<B> + 'static,
        B: 'static,
    {
        let (out_chain, out_state) = Chain::<B>::new();
        self.then_void(move |args| {
            f(args).use_state(out_state);
        });
        out_chain
    }

    /// Splice `other_state` so that it completes whenever this chain's
    /// value eventually arrives. Used by [`Chain::then_chain`] to
    /// flatten nested chains.
    pub fn use_state(self, other_state: State<T>) {
        self.then_void(move |args| {
            other_state.complete(args);
        });
    }

    /// Discard the value, keeping only "did it finish" signal.
    pub fn to_continuation(self) -> Chain<()> {
        self.then(|_| ())
    }

    /// Give up on this chain. The paired state's future `complete`
    /// calls become no-ops and no continuation ever runs. Fires this
    /// chain's `on_cancel` hook, if one was registered.
    pub fn cancel(self) {
        cancel_cell(&self.cell);
    }
}

impl<T> State<T> {
    /// Complete the chain with `args`, invoking the registered
    /// continuation synchronously if one is present. A no-op if the
    /// chain was canceled. Consumes `self`: a `State` can complete at
    /// most once by construction.
    pub fn complete(self, args: T) {
        enum Action<T> {
            InvokeNow(Box<dyn FnOnce(T)>, T),
            None,
        }
        let action;
        {
            let mut slot = self.cell.slot.borrow_mut();
            let prev = std::mem::replace(&mut *slot, Slot::Done);
            action = match prev {
                Slot::Canceled => Action::None,
                Slot::Continuation(cb) => Action::InvokeNow(cb, args),
                Slot::Pending => {
                    *slot = Slot::Completed(args);
                    Action::None
                }
                Slot::Completed(_) | Slot::Done => {
                    debug_assert!(false, "state completed twice");
                    Action::None
                }
            };
        }
        if let Action::InvokeNow(cb, args) = action {
            cb(args);
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(&*self.cell.slot.borrow(), Slot::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn create_and_complete_invokes_then_void_immediately() {
        let chain = Chain::create_and_complete(5i32);
        let got = StdRc::new(StdRefCell::new(0));
        let got2 = got.clone();
        chain.then_void(move |v| *got2.borrow_mut() = v);
        assert_eq!(*got.borrow(), 5);
    }

    #[test]
    fn then_void_before_complete_runs_on_complete() {
        let (chain, state) = Chain::<i32>::new();
        let got = StdRc::new(StdRefCell::new(0));
        let got2 = got.clone();
        chain.then_void(move |v| *got2.borrow_mut() = v);
        assert_eq!(*got.borrow(), 0);
        state.complete(9);
        assert_eq!(*got.borrow(), 9);
    }

    #[test]
    fn cascade_then_arithmetic() {
        let (chain, state) = Chain::<i32>::new();
        let result = StdRc::new(StdRefCell::new(0));
        let result2 = result.clone();
        chain
            .then(|v| v + 1)
            .then(|v| v * 2)
            .then_void(move |v| *result2.borrow_mut() = v);
        state.complete(3);
        // (3 + 1) * 2 == 8
        assert_eq!(*result.borrow(), 8);
    }

    #[test]
    fn then_chain_flattens() {
        let (chain, state) = Chain::<i32>::new();
        let result = StdRc::new(StdRefCell::new(0));
        let result2 = result.clone();
        chain
            .then_chain(|v| Chain::create_and_complete(v + 10))
            .then_void(move |v| *result2.borrow_mut() = v);
        state.complete(1);
        assert_eq!(*result.borrow(), 11);
    }

    #[test]
    fn deep_then_chain_fan_out_does_not_overflow_stack() {
        // Mirrors a recursive fan-out: each hop completes immediately
        // and the next is built from its result, four thousand ninety
        // six levels deep.
        const DEPTH: i64 = 4096;
        let (chain, state) = Chain::<i64>::new();
        let result = StdRc::new(StdRefCell::new(0i64));
        let result2 = result.clone();

        fn recurse(c: Chain<i64>, remaining: i64, result: StdRc<StdRefCell<i64>>) -> Chain<i64> {
            if remaining == 0 {
                return c;
            }
            let next = c.then_chain(move |v| Chain::create_and_complete(v + 1));
            recurse(next, remaining - 1, result)
        }
        let built = recurse(chain, DEPTH, result.clone());
        built.then_void(move |v| *result2.borrow_mut() = v);
        state.complete(0);
        assert_eq!(*result.borrow(), DEPTH);
    }

    #[test]
    fn cancel_suppresses_completion() {
        let (chain, state) = Chain::<i32>::new();
        chain.cancel();
        assert!(state.is_canceled());
        // complete after cancel must not panic and must be a no-op.
        state.complete(42);
    }

    #[test]
    fn to_continuation_drops_value() {
        let chain = Chain::create_and_complete("hello");
        let ran = StdRc::new(StdRefCell::new(false));
        let ran2 = ran.clone();
        chain.to_continuation().then_void(move |()| *ran2.borrow_mut() = true);
        assert!(*ran.borrow());
    }

    #[test]
    fn on_cancel_hook_fires_when_chain_is_canceled() {
        let (chain, _state) = Chain::<i32>::new();
        let fired = StdRc::new(StdRefCell::new(false));
        let fired2 = fired.clone();
        let chain = chain.on_cancel(move || *fired2.borrow_mut() = true);
        assert!(!*fired.borrow());
        chain.cancel();
        assert!(*fired.borrow());
    }

    #[test]
    fn cancel_token_cancels_without_consuming_chain() {
        let (chain, state) = Chain::<i32>::new();
        let token = chain.cancel_token();
        let got = StdRc::new(StdRefCell::new(-1));
        let got2 = got.clone();
        chain.then_void(move |v| *got2.borrow_mut() = v);
        token.cancel();
        state.complete(7);
        // canceled via the token before completion arrived, so the
        // continuation registered above must never run.
        assert_eq!(*got.borrow(), -1);
    }
}
