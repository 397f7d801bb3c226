//! Counting admission gate for test command execution.
//!
//! The gate bounds how many commands run at once. It never queues: a caller
//! that arrives while the gate is full is turned away with
//! [`Error::Saturated`] and decides for itself whether to retry.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct ExecutionGate {
    active: AtomicUsize,
    limit: usize,
}

/// Slot held while admitted work runs. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct GatePermit<'a> {
    gate: &'a ExecutionGate,
}

impl ExecutionGate {
    pub fn new(limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(Error::validation(
                "concurrency_limit",
                "must be greater than 0",
            ));
        }
        Ok(Self {
            active: AtomicUsize::new(0),
            limit,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Snapshot check. A `false` here does not reserve a slot.
    pub fn is_saturated(&self) -> bool {
        self.active() >= self.limit
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Result<GatePermit<'_>> {
        loop {
            let current = self.active.load(Ordering::Acquire);
            if current >= self.limit {
                debug!(active = current, limit = self.limit, "gate saturated");
                return Err(Error::Saturated {
                    active: current,
                    limit: self.limit,
                });
            }
            if self
                .active
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(GatePermit { gate: self });
            }
        }
    }

    /// Run `work` under a slot. The slot is released on every exit path,
    /// including a panic inside `work`.
    pub fn run<T>(&self, work: impl FnOnce() -> T) -> Result<T> {
        let _permit = self.try_acquire()?;
        Ok(work())
    }

    /// Zero the counter. Permits still alive release without underflowing.
    #[cfg(any(test, feature = "test-support"))]
    pub fn reset(&self) {
        self.active.store(0, Ordering::Release);
    }

    fn release(&self) {
        // Saturating so a release after `reset` cannot wrap.
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::{Arc, Barrier, mpsc};
    use std::thread;

    #[test]
    fn zero_limit_is_rejected() {
        let err = ExecutionGate::new(0).expect_err("zero limit");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn permits_count_and_release() {
        let gate = ExecutionGate::new(2).expect("gate");
        let first = gate.try_acquire().expect("first");
        let _second = gate.try_acquire().expect("second");
        assert!(gate.is_saturated());
        match gate.try_acquire() {
            Err(Error::Saturated { active, limit }) => {
                assert_eq!((active, limit), (2, 2));
            }
            other => panic!("expected saturation, got {other:?}"),
        }
        drop(first);
        assert_eq!(gate.active(), 1);
        assert!(!gate.is_saturated());
    }

    /// The `limit + 1`-th concurrent caller is refused while the others are in
    /// flight, and admitted once one of them completes.
    #[test]
    fn concurrent_callers_beyond_limit_are_refused() {
        let limit = 3;
        let gate = Arc::new(ExecutionGate::new(limit).expect("gate"));
        let started = Arc::new(Barrier::new(limit + 1));
        let mut releases = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..limit {
            let (tx, rx) = mpsc::channel::<()>();
            releases.push(tx);
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            handles.push(thread::spawn(move || {
                gate.run(|| {
                    started.wait();
                    rx.recv().ok();
                })
            }));
        }

        started.wait();
        assert_eq!(gate.active(), limit);
        assert!(matches!(gate.run(|| ()), Err(Error::Saturated { .. })));

        let first = releases.remove(0);
        first.send(()).expect("release");
        handles.remove(0).join().expect("join").expect("admitted");
        assert!(gate.run(|| 42).is_ok_and(|v| v == 42));

        for tx in releases {
            tx.send(()).expect("release");
        }
        for handle in handles {
            handle.join().expect("join").expect("admitted");
        }
        assert_eq!(gate.active(), 0);
    }

    #[test]
    fn panicking_work_releases_its_slot() {
        let gate = ExecutionGate::new(1).expect("gate");
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = gate.run(|| panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(gate.active(), 0);
        assert!(gate.run(|| ()).is_ok());
    }

    #[test]
    fn release_after_reset_does_not_underflow() {
        let gate = ExecutionGate::new(1).expect("gate");
        let permit = gate.try_acquire().expect("permit");
        gate.reset();
        drop(permit);
        assert_eq!(gate.active(), 0);
    }
}
