//! The wait-channel abstraction the log uses for admission control.
//!
//! Spec §5/§9: the host is assumed to provide a mutual-exclusion lock with
//! sleep (modeled by [`mutex_api::Mutex`]) and a wait-channel primitive
//! where `sleep` atomically releases the lock and suspends, and `wakeup`
//! wakes every sleeper. Broadcast semantics are required: admission
//! waiters (in `begin_op`) and the commit-done waiters (in `end_op`) share
//! one channel, so a single-wake primitive would have to be looped by the
//! implementer.

use mutex_api::Mutex;

/// A broadcast condition variable keyed to a [`Mutex`] of type `M`.
pub trait CondVar<M: Mutex> {
    /// Creates a new, empty wait channel.
    fn new() -> Self;

    /// Atomically releases `guard` and suspends the caller until the next
    /// [`Self::notify_all`], then reacquires the lock and returns a fresh
    /// guard.
    ///
    /// Like a standard condition variable, this may return spuriously;
    /// callers must re-check their wait condition in a loop.
    fn wait<'g>(&self, guard: M::Guard<'g>) -> M::Guard<'g>;

    /// Wakes every caller currently suspended in [`Self::wait`].
    fn notify_all(&self);
}
