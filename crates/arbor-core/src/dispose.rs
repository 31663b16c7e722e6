//! Lock-free dispose protocol
//!
//! A [`DisposeCoordinator`] lets any number of threads ask for disposal while
//! guaranteeing that only one of them runs the dispose routine at a time.
//! A failed disposal leaves the state at `DisposedPartially` so a later
//! request can try again; a successful one is final.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

use crate::storage::error::{StoreError, StoreResult};

/// Where an object is in its disposal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisposeState {
    None = 0,
    Disposing = 1,
    DisposedPartially = 2,
    DisposedFully = 3,
}

impl DisposeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DisposeState::None,
            1 => DisposeState::Disposing,
            2 => DisposeState::DisposedPartially,
            _ => DisposeState::DisposedFully,
        }
    }
}

/// Tri-state dispose flag shared between threads
#[derive(Debug)]
pub struct DisposeCoordinator {
    state: AtomicU8,
}

impl DisposeCoordinator {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(DisposeState::None as u8),
        }
    }

    pub fn state(&self) -> DisposeState {
        DisposeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once any dispose request has started
    pub fn is_disposing_or_disposed(&self) -> bool {
        self.state() != DisposeState::None
    }

    pub fn is_disposed_fully(&self) -> bool {
        self.state() == DisposeState::DisposedFully
    }

    fn try_begin(&self) -> bool {
        [DisposeState::None, DisposeState::DisposedPartially]
            .into_iter()
            .any(|from| {
                self.state
                    .compare_exchange(
                        from as u8,
                        DisposeState::Disposing as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            })
    }

    /// Run `dispose` if no other caller is disposing or has disposed fully
    ///
    /// Returns `Ok(true)` when this call ran `dispose` to success and
    /// `Ok(false)` when another caller owns (or finished) the disposal.
    /// On error the state becomes `DisposedPartially` and the error is
    /// returned. A panic inside `dispose` is treated like an error.
    pub fn handle_dispose_request<E, F>(&self, dispose: F) -> Result<bool, E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        if !self.try_begin() {
            return Ok(false);
        }

        let mut guard = PartialOnUnwind {
            state: &self.state,
            armed: true,
        };
        let result = dispose();
        guard.armed = false;

        match result {
            Ok(()) => {
                self.state
                    .store(DisposeState::DisposedFully as u8, Ordering::Release);
                Ok(true)
            }
            Err(e) => {
                self.state
                    .store(DisposeState::DisposedPartially as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Wait until no disposal is in progress and return the settled state
    ///
    /// Polls with a spin, then yield, then sleep back-off. Setting `cancel`
    /// makes the wait return [`StoreError::Cancelled`].
    pub fn wait_settled(&self, cancel: Option<&AtomicBool>) -> StoreResult<DisposeState> {
        let mut backoff = Backoff::new();
        loop {
            let state = self.state();
            if state != DisposeState::Disposing {
                return Ok(state);
            }
            if cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                return Err(StoreError::Cancelled);
            }
            backoff.snooze();
        }
    }
}

impl Default for DisposeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

struct PartialOnUnwind<'a> {
    state: &'a AtomicU8,
    armed: bool,
}

impl Drop for PartialOnUnwind<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state
                .store(DisposeState::DisposedPartially as u8, Ordering::Release);
        }
    }
}

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;
const SLEEP: Duration = Duration::from_millis(1);

struct Backoff {
    step: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { step: 0 }
    }

    fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step < YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(SLEEP);
        }
        self.step = (self.step + 1).min(YIELD_LIMIT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_success_is_final() {
        let coordinator = DisposeCoordinator::new();
        assert_eq!(coordinator.state(), DisposeState::None);
        assert!(!coordinator.is_disposing_or_disposed());

        let ran = coordinator
            .handle_dispose_request(|| Ok::<(), StoreError>(()))
            .unwrap();
        assert!(ran);
        assert!(coordinator.is_disposed_fully());

        let again = coordinator
            .handle_dispose_request(|| -> Result<(), StoreError> { panic!("must not run") })
            .unwrap();
        assert!(!again);
    }

    #[test]
    fn test_failure_allows_retry() {
        let coordinator = DisposeCoordinator::new();
        let err = coordinator
            .handle_dispose_request(|| Err(StoreError::corrupt("busy")))
            .unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(coordinator.state(), DisposeState::DisposedPartially);
        assert!(coordinator.is_disposing_or_disposed());

        assert!(coordinator
            .handle_dispose_request(|| Ok::<(), StoreError>(()))
            .unwrap());
        assert_eq!(coordinator.state(), DisposeState::DisposedFully);
    }

    #[test]
    fn test_panic_leaves_partial() {
        let coordinator = DisposeCoordinator::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = coordinator.handle_dispose_request(|| -> Result<(), StoreError> {
                panic!("boom")
            });
        }));
        assert!(result.is_err());
        assert_eq!(coordinator.state(), DisposeState::DisposedPartially);
    }

    #[test]
    fn test_single_winner_under_contention() {
        let coordinator = Arc::new(DisposeCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    coordinator
                        .handle_dispose_request(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(5));
                            Ok::<(), StoreError>(())
                        })
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_disposed_fully());
    }

    #[test]
    fn test_wait_settled_sees_other_thread_finish() {
        let coordinator = Arc::new(DisposeCoordinator::new());
        let started = Arc::new(Barrier::new(2));

        let worker = {
            let coordinator = Arc::clone(&coordinator);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                coordinator
                    .handle_dispose_request(|| {
                        started.wait();
                        thread::sleep(Duration::from_millis(20));
                        Ok::<(), StoreError>(())
                    })
                    .unwrap()
            })
        };

        started.wait();
        assert_eq!(
            coordinator.wait_settled(None).unwrap(),
            DisposeState::DisposedFully
        );
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_wait_settled_cancel() {
        let coordinator = Arc::new(DisposeCoordinator::new());
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(AtomicBool::new(false));

        let worker = {
            let coordinator = Arc::clone(&coordinator);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                coordinator
                    .handle_dispose_request(|| {
                        started.wait();
                        while !release.load(Ordering::Acquire) {
                            thread::sleep(Duration::from_millis(1));
                        }
                        Ok::<(), StoreError>(())
                    })
                    .unwrap()
            })
        };

        started.wait();
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            coordinator.wait_settled(Some(&cancel)),
            Err(StoreError::Cancelled)
        ));

        release.store(true, Ordering::Release);
        assert!(worker.join().unwrap());
    }
}
