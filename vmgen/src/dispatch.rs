//! Hands out exclusive access to shared generator state, one registered thread at a time.

use std::fmt::{self, Display};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use log::*;
use serde::{Deserialize, Serialize};

/// Identifies a generator thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub u32);

impl Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    threads: Vec<ThreadId>,
    current: usize,
    depth: usize,
}

impl DispatchState {
    fn current(&self) -> Option<ThreadId> {
        self.threads.get(self.current).copied()
    }

    fn advance(&mut self) {
        if !self.threads.is_empty() {
            self.current = (self.current + 1) % self.threads.len();
        }
    }
}

/// A cooperative scheduler for generator threads.
///
/// Exactly one registered thread is current at any time.
/// [`ThreadDispatcher::request`] blocks until the calling thread is current.
/// When an advancing request ends, the next registered thread (in registration order) becomes current.
#[derive(Debug, Default)]
pub struct ThreadDispatcher {
    state: Mutex<DispatchState>,
    turn: Condvar,
}

impl ThreadDispatcher {
    /// Creates a dispatcher without any threads.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `id` to the end of the rotation.
    pub fn register(&self, id: ThreadId) {
        let mut state = self.lock();
        if !state.threads.contains(&id) {
            state.threads.push(id);
            debug!("Registered thread {id}");
        }

        self.turn.notify_all();
    }

    /// Removes `id` from the rotation. If `id` is current, the next thread becomes current.
    pub fn unregister(&self, id: ThreadId) {
        let mut state = self.lock();
        if let Some(index) = state.threads.iter().position(|&t| t == id) {
            state.threads.remove(index);
            if index < state.current {
                state.current -= 1;
            } else if index == state.current {
                state.depth = 0;
            }

            if state.current >= state.threads.len() {
                state.current = 0;
            }

            debug!("Unregistered thread {id}");
        }

        self.turn.notify_all();
    }

    /// The thread that currently has access.
    pub fn current(&self) -> Option<ThreadId> {
        self.lock().current()
    }

    /// The registered threads, in rotation order.
    pub fn threads(&self) -> Vec<ThreadId> {
        self.lock().threads.clone()
    }

    /// Waits until `id` is current. Access is kept until the returned guard is dropped.
    /// Nested requests from the current thread return immediately.
    ///
    /// When `advance` is true, the next thread becomes current after the outermost guard is dropped.
    ///
    /// # Panics
    /// Panics if `id` is not registered.
    pub fn request(&self, id: ThreadId, advance: bool) -> DispatchGuard<'_> {
        let state = self.lock();
        assert!(state.threads.contains(&id), "Thread {id} is not registered");

        let mut state = self
            .turn
            .wait_while(state, |state| state.current() != Some(id))
            .unwrap_or_else(PoisonError::into_inner);
        state.depth += 1;
        trace!("Thread {id} has access (depth {})", state.depth);

        DispatchGuard {
            dispatcher: self,
            id,
            advance,
        }
    }

    /// Makes `id` current without waiting, and returns a guard that behaves like the one of [`ThreadDispatcher::request`].
    ///
    /// This is the rotation for a caller that already has exclusive access to the generator state and acts for
    /// several threads from a single OS thread: whichever thread it acts for runs next, and the rotation continues
    /// from there.
    ///
    /// # Panics
    /// Panics if `id` is not registered, or if another thread holds access.
    pub fn enter(&self, id: ThreadId, advance: bool) -> DispatchGuard<'_> {
        let mut state = self.lock();
        let index = state
            .threads
            .iter()
            .position(|&t| t == id)
            .unwrap_or_else(|| panic!("Thread {id} is not registered"));

        if state.current != index {
            assert_eq!(
                state.depth,
                0,
                "Thread {id} cannot enter while {:?} has access",
                state.current()
            );
            trace!("Thread {id} takes over from {:?}", state.current());
            state.current = index;
        }

        state.depth += 1;
        DispatchGuard {
            dispatcher: self,
            id,
            advance,
        }
    }

    fn release(&self, id: ThreadId, advance: bool) {
        let mut state = self.lock();
        if state.current() != Some(id) {
            return;
        }

        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 && advance {
            state.advance();
            trace!("Thread {id} hands over to {:?}", state.current());
        }

        self.turn.notify_all();
    }
}

/// Exclusive access for a single thread. See [`ThreadDispatcher::request`].
#[derive(Debug)]
#[must_use]
pub struct DispatchGuard<'a> {
    dispatcher: &'a ThreadDispatcher,
    id: ThreadId,
    advance: bool,
}

impl DispatchGuard<'_> {
    /// The thread that holds access.
    pub fn id(&self) -> ThreadId {
        self.id
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.release(self.id, self.advance);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::thread;

    use test_log::test;

    use super::{ThreadDispatcher, ThreadId};

    #[test]
    pub fn nested_requests_do_not_advance() {
        let dispatcher = ThreadDispatcher::new();
        dispatcher.register(ThreadId(1));
        dispatcher.register(ThreadId(2));
        assert_eq!(dispatcher.current(), Some(ThreadId(1)));

        {
            let _outer = dispatcher.request(ThreadId(1), true);
            {
                let _inner = dispatcher.request(ThreadId(1), true);
            }

            assert_eq!(dispatcher.current(), Some(ThreadId(1)));
        }

        assert_eq!(dispatcher.current(), Some(ThreadId(2)));

        drop(dispatcher.request(ThreadId(2), false));
        assert_eq!(dispatcher.current(), Some(ThreadId(2)));

        drop(dispatcher.request(ThreadId(2), true));
        assert_eq!(dispatcher.current(), Some(ThreadId(1)));
    }

    #[test]
    pub fn unregistering_current_thread_advances() {
        let dispatcher = ThreadDispatcher::new();
        for id in 0..3 {
            dispatcher.register(ThreadId(id));
        }

        drop(dispatcher.request(ThreadId(0), true));
        assert_eq!(dispatcher.current(), Some(ThreadId(1)));

        dispatcher.unregister(ThreadId(1));
        assert_eq!(dispatcher.current(), Some(ThreadId(2)));

        dispatcher.unregister(ThreadId(2));
        assert_eq!(dispatcher.current(), Some(ThreadId(0)));
        assert_eq!(dispatcher.threads(), vec![ThreadId(0)]);

        dispatcher.unregister(ThreadId(0));
        assert_eq!(dispatcher.current(), None);
    }

    #[test]
    pub fn entering_never_waits() {
        let dispatcher = ThreadDispatcher::new();
        dispatcher.register(ThreadId(0));
        dispatcher.register(ThreadId(1));

        drop(dispatcher.enter(ThreadId(0), true));
        assert_eq!(dispatcher.current(), Some(ThreadId(1)));

        // Thread 1 never runs, but thread 0 can continue.
        drop(dispatcher.enter(ThreadId(0), true));
        assert_eq!(dispatcher.current(), Some(ThreadId(1)));

        {
            let _outer = dispatcher.enter(ThreadId(1), false);
            let _inner = dispatcher.enter(ThreadId(1), true);
        }

        assert_eq!(dispatcher.current(), Some(ThreadId(1)));

        // A blocking request from the current thread is served immediately.
        drop(dispatcher.request(ThreadId(1), true));
        assert_eq!(dispatcher.current(), Some(ThreadId(0)));
    }

    #[test]
    #[should_panic]
    pub fn entering_while_another_thread_has_access_panics() {
        let dispatcher = ThreadDispatcher::new();
        dispatcher.register(ThreadId(0));
        dispatcher.register(ThreadId(1));

        let _guard = dispatcher.enter(ThreadId(0), true);
        let _other = dispatcher.enter(ThreadId(1), true);
    }

    #[test]
    #[should_panic]
    pub fn unregistered_thread_panics() {
        let dispatcher = ThreadDispatcher::new();
        dispatcher.register(ThreadId(0));
        let _guard = dispatcher.request(ThreadId(5), true);
    }

    #[test]
    pub fn threads_take_turns() {
        const ROUNDS: usize = 20;
        let dispatcher = Arc::new(ThreadDispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            dispatcher.register(ThreadId(id));
        }

        let handles = (0..3)
            .map(|id| {
                let dispatcher = dispatcher.clone();
                let log = log.clone();
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let _guard = dispatcher.request(ThreadId(id), true);
                        log.lock().unwrap().push(id);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3 * ROUNDS);
        for (index, &id) in log.iter().enumerate() {
            assert_eq!(id as usize, index % 3);
        }
    }
}
