//! Narrow coupling point between the I/O context and an external task
//! scheduler. The scheduler itself is out of scope for this crate —
//! this is the entire surface it needs to expose.

/// Identifies a scheduling group/lane a deferred job should land on.
/// Opaque to this crate; interpreted entirely by the `TaskDispatcher`
/// implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub u32);

/// What [`crate::io::IoContext::force_deferred_execution`] needs from a
/// task scheduler: the ability to run a job later instead of inline.
///
/// Jobs are `FnOnce()` without a `Send` bound: continuations captured
/// here close over chain state that is intentionally not thread-safe
/// (see [`crate::chain`]), so a `TaskDispatcher` in this crate's sense
/// is a cooperative, possibly-same-thread deferral point rather than a
/// work-stealing thread pool.
pub trait TaskDispatcher {
    fn post(&self, group: GroupId, job: Box<dyn FnOnce()>);
}

/// A dispatcher that runs jobs immediately, inline. Useful in tests and
/// as the default when no scheduler is wired up.
pub struct InlineDispatcher;

impl TaskDispatcher for InlineDispatcher {
    fn post(&self, _group: GroupId, job: Box<dyn FnOnce()>) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_dispatcher_runs_synchronously() {
        let ran = std::cell::RefCell::new(false);
        InlineDispatcher.post(GroupId(0), Box::new(|| {
            *ran.borrow_mut() = true;
        }));
        assert!(*ran.borrow());
    }
}
