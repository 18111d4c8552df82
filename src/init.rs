//! A once-only initialization cell that lets you poll its state, including
//! mid-initialization.
//!
//! Queries check-and-trigger rather than assuming anything ran at process
//! start, and allocation hooks that fire *while* the runtime is being built
//! need to observe [`InitState::Initializing`] so they can decline to recurse
//! into it.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex,
    },
};

use crate::util::hint::cold;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum InitState {
    /// Signifies this cell is uninitialized
    Uninit = 0,
    /// Signifies this cell is mid initialization. Only observable from code
    /// that runs underneath the initializer (e.g. allocation hooks).
    Initializing = 1,
    /// Signifies this cell is initialized
    Ready = 2,
}

pub struct InitCell<T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    lock: Mutex<()>,
    state: AtomicU8,
}

// SAFETY: the value is written exactly once, before `state` is released to
// `Ready`; afterwards all access is shared and immutable.
unsafe impl<T: Send + Sync> Sync for InitCell<T> {}
unsafe impl<T: Send> Send for InitCell<T> {}

impl<T> InitCell<T> {
    pub const fn new() -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            lock: Mutex::new(()),
            state: AtomicU8::new(InitState::Uninit as u8),
        }
    }

    pub fn state(&self) -> InitState {
        match self.state.load(Ordering::Acquire) {
            0 => InitState::Uninit,
            1 => InitState::Initializing,
            _ => InitState::Ready,
        }
    }

    /// The value, if initialization has completed.
    pub fn get(&self) -> Option<&T> {
        if self.state() == InitState::Ready {
            // SAFETY: `Ready` is only published after the value is written.
            Some(unsafe { (*self.cell.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Initialize the cell with `init` if nobody has yet; otherwise return
    /// the existing value. The initializer runs at most once process-wide.
    /// Calling this from inside `init` on the same cell deadlocks.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if self.state() != InitState::Ready {
            cold(|| ());
            let _guard = self.lock.lock().expect("no panics while holding the init lock");
            // Re-check: somebody may have initialized while we waited.
            if self.state() != InitState::Ready {
                self.state
                    .store(InitState::Initializing as u8, Ordering::Release);
                // SAFETY: we hold the lock and state is not `Ready`, so no
                // reference to the contents exists yet.
                unsafe { (*self.cell.get()).write(init()) };
                self.state.store(InitState::Ready as u8, Ordering::Release);
            }
        }
        // SAFETY: state is `Ready` from here on.
        unsafe { (*self.cell.get()).assume_init_ref() }
    }
}

impl<T> Drop for InitCell<T> {
    fn drop(&mut self) {
        if self.state() == InitState::Ready {
            // SAFETY: initialized, and we have exclusive access.
            unsafe { (*self.cell.get()).assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializes_once() {
        let cell: InitCell<u32> = InitCell::new();
        assert_eq!(cell.state(), InitState::Uninit);
        assert!(cell.get().is_none());
        assert_eq!(*cell.get_or_init(|| 7), 7);
        assert_eq!(cell.state(), InitState::Ready);
        // Second initializer must not run.
        assert_eq!(*cell.get_or_init(|| 42), 7);
        assert_eq!(cell.get(), Some(&7));
    }

    #[test]
    fn concurrent_initialization_is_idempotent() {
        static CELL: InitCell<usize> = InitCell::new();
        let threads: Vec<_> = (0..8)
            .map(|i| std::thread::spawn(move || *CELL.get_or_init(|| 100 + i)))
            .collect();
        let values: Vec<usize> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(values.windows(2).all(|w| w[0] == w[1]));
    }
}
