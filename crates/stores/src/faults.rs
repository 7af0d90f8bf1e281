use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tiered_archive_common::StoreError;

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Put,
    Delete,
    Scan,
    Exists,
}

#[derive(Debug, Clone)]
enum Fault {
    Unavailable,
    Throttled(Option<Duration>),
}

/// Injects failures into the in-memory stores.
#[derive(Debug, Default)]
pub struct FaultInjector {
    outage: AtomicBool,
    armed: Mutex<HashMap<StoreOp, Vec<Fault>>>,
}

impl FaultInjector {
    /// Fail every operation with `Unavailable` until cleared.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Fail the next `count` calls of `op` with `Unavailable`.
    pub fn fail_next(&self, op: StoreOp, count: usize) {
        self.arm(op, Fault::Unavailable, count);
    }

    /// Throttle the next `count` calls of `op`.
    pub fn throttle_next(&self, op: StoreOp, count: usize, retry_after: Option<Duration>) {
        self.arm(op, Fault::Throttled(retry_after), count);
    }

    fn arm(&self, op: StoreOp, fault: Fault, count: usize) {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = armed.entry(op).or_default();
        queue.extend(std::iter::repeat(fault).take(count));
    }

    /// Consume one armed fault for `op`, if any.
    pub fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("injected outage on {op:?}")));
        }
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        let fault = armed.get_mut(&op).and_then(|queue| queue.pop());
        match fault {
            None => Ok(()),
            Some(Fault::Unavailable) => Err(StoreError::Unavailable(format!("injected failure on {op:?}"))),
            Some(Fault::Throttled(retry_after)) => Err(StoreError::Throttled { retry_after }),
        }
    }
}
