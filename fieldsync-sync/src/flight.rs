//! Single-flight flag with a drop guard.

use std::sync::atomic::{AtomicBool, Ordering};

/// At most one holder at a time; everyone else is turned away immediately.
#[derive(Debug, Default)]
pub(crate) struct SingleFlight(AtomicBool);

impl SingleFlight {
    pub(crate) fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(&self.0))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the flight when dropped, including on early return or unwind.
#[derive(Debug)]
pub(crate) struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
