//! Fan-in combinator built on top of [`crate::chain`].

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::chain::{CancelToken, Chain};

/// Complete once every input chain has completed. The inputs' values
/// are discarded; use [`multi_chain_collect`] to gather them. Canceling
/// the returned chain cancels every input that hasn't completed yet.
pub fn multi_chain(inputs: Vec<Chain<()>>) -> Chain<()> {
    multi_chain_collect(inputs).then(|_| ())
}

/// Complete once every input chain has completed, collecting each
/// input's value into a `Vec` in input order. Canceling the returned
/// chain cancels every input that hasn't completed yet — the pending
/// ones never get to invoke their registered continuation here, so the
/// output is never assembled from a partial result.
pub fn multi_chain_collect<T: 'static>(inputs: Vec<Chain<T>>) -> Chain<Vec<T>> {
    let (out_chain, out_state) = Chain::<Vec<T>>::new();
    let count = inputs.len();
    if count == 0 {
        out_state.complete(Vec::new());
        return out_chain;
    }

    let pending = Rc::new(AtomicU64::new(count as u64));
    let results: Rc<RefCell<Vec<Option<T>>>> =
        Rc::new(RefCell::new((0..count).map(|_| None).collect()));
    let out_state = Rc::new(RefCell::new(Some(out_state)));
    let cancel_tokens: Rc<RefCell<Vec<CancelToken<T>>>> =
        Rc::new(RefCell::new(Vec::with_capacity(count)));

    for (index, input) in inputs.into_iter().enumerate() {
        cancel_tokens.borrow_mut().push(input.cancel_token());
        let pending = pending.clone();
        let results = results.clone();
        let out_state = out_state.clone();
        input.then_void(move |value| {
            results.borrow_mut()[index] = Some(value);
            if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                let collected: Vec<T> = results
                    .borrow_mut()
                    .iter_mut()
                    .map(|slot| slot.take().expect("all inputs must have completed"))
                    .collect();
                if let Some(state) = out_state.borrow_mut().take() {
                    state.complete(collected);
                }
            }
        });
    }

    out_chain.on_cancel(move || {
        for token in cancel_tokens.borrow_mut().drain(..) {
            token.cancel();
        }
    })
}

/// Fold over each input's completion as it arrives (order of arrival is
/// unspecified), delivering the final accumulator once every input has
/// fired. Canceling the returned chain cancels every input that hasn't
/// folded in yet.
pub fn multi_chain_fold<S, T, F>(initial: S, inputs: Vec<Chain<T>>, fold: F) -> Chain<S>
where
    S: 'static,
    T: 'static,
    F: Fn(&mut S, T) + 'static,
{
    let (out_chain, out_state) = Chain::<S>::new();
    let count = inputs.len();
    if count == 0 {
        out_state.complete(initial);
        return out_chain;
    }

    let pending = Rc::new(AtomicU64::new(count as u64));
    let state_cell = Rc::new(RefCell::new(Some(initial)));
    let out_state = Rc::new(RefCell::new(Some(out_state)));
    let fold = Rc::new(fold);
    let cancel_tokens: Rc<RefCell<Vec<CancelToken<T>>>> =
        Rc::new(RefCell::new(Vec::with_capacity(count)));

    for input in inputs {
        cancel_tokens.borrow_mut().push(input.cancel_token());
        let pending = pending.clone();
        let state_cell = state_cell.clone();
        let out_state = out_state.clone();
        let fold = fold.clone();
        input.then_void(move |value| {
            if let Some(acc) = state_cell.borrow_mut().as_mut() {
                fold(acc, value);
            }
            if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                let acc = state_cell
                    .borrow_mut()
                    .take()
                    .expect("accumulator consumed twice");
                if let Some(state) = out_state.borrow_mut().take() {
                    state.complete(acc);
                }
            }
        });
    }

    out_chain.on_cancel(move || {
        for token in cancel_tokens.borrow_mut().drain(..) {
            token.cancel();
        }
    })
}

/// Variadic-flavored convenience wrapper analogous to `multi_chain` for
/// a fixed, small, statically-known set of same-type chains.
pub fn multi_chain_simple<T: 'static>(inputs: Vec<Chain<T>>) -> Chain<Vec<T>> {
    multi_chain_collect(inputs)
}

/// Cancel every input of a not-yet-submitted batch; used when a
/// consumer abandons a pending `multi_chain` before any input fires.
pub fn cancel_all<T>(inputs: Vec<Chain<T>>) {
    for input in inputs {
        input.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_multi_chain_completes_immediately() {
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();
        multi_chain(Vec::new()).then_void(move |()| *ran2.borrow_mut() = true);
        assert!(*ran.borrow());
    }

    #[test]
    fn completes_only_after_all_inputs_fire() {
        let (c1, s1) = Chain::<i32>::new();
        let (c2, s2) = Chain::<i32>::new();
        let done = Rc::new(RefCell::new(false));
        let done2 = done.clone();
        multi_chain_collect(vec![c1, c2]).then_void(move |vs| {
            *done2.borrow_mut() = true;
            assert_eq!(vs, vec![1, 2]);
        });
        assert!(!*done.borrow());
        s1.complete(1);
        assert!(!*done.borrow());
        s2.complete(2);
        assert!(*done.borrow());
    }

    #[test]
    fn cancel_before_any_input_completes_reaches_every_input() {
        let (c1, s1) = Chain::<i32>::new();
        let (c2, s2) = Chain::<i32>::new();
        let out = multi_chain_collect(vec![c1, c2]);
        out.cancel();
        assert!(s1.is_canceled());
        assert!(s2.is_canceled());
    }

    #[test]
    fn cancel_after_one_input_completes_reaches_the_rest() {
        let (c1, s1) = Chain::<i32>::new();
        let (c2, s2) = Chain::<i32>::new();
        let (c3, s3) = Chain::<i32>::new();
        let out = multi_chain_collect(vec![c1, c2, c3]);
        s1.complete(1);
        out.cancel();
        // c2 and c3 were still pending when the output was canceled.
        assert!(s2.is_canceled());
        assert!(s3.is_canceled());
    }

    #[test]
    fn fold_accumulates_across_inputs() {
        let (c1, s1) = Chain::<i32>::new();
        let (c2, s2) = Chain::<i32>::new();
        let (c3, s3) = Chain::<i32>::new();
        let result = Rc::new(RefCell::new(0));
        let result2 = result.clone();
        multi_chain_fold(0, vec![c1, c2, c3], |acc, v| *acc += v)
            .then_void(move |total| *result2.borrow_mut() = total);
        s1.complete(2);
        s2.complete(3);
        s3.complete(4);
        assert_eq!(*result.borrow(), 9);
    }
}
