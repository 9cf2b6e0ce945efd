//! Global connection budget shared across running missions.
//!
//! Each mission reserves fetcher slots from this budget before it starts so
//! total concurrency stays under `max_total_connections`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct GlobalConnectionBudget {
    max_total: usize,
    in_use: AtomicUsize,
}

impl GlobalConnectionBudget {
    pub fn new(max_total: usize) -> Self {
        Self {
            max_total: max_total.max(1),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Number of connections currently reserved.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Free slots. May be 0 while other missions hold the budget.
    pub fn available(&self) -> usize {
        self.max_total.saturating_sub(self.in_use())
    }

    /// Reserves up to `requested` connections and returns how many were
    /// actually taken. Hand the same number back to `release`.
    pub fn reserve(&self, requested: usize) -> usize {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            let take = requested.min(self.max_total.saturating_sub(current));
            match self.in_use.compare_exchange_weak(
                current,
                current + take,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return take,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, n: usize) {
        let _ = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(n))
            });
    }
}

/// Slots held by one mission run; returned to the budget on drop.
pub struct BudgetLease {
    budget: Arc<GlobalConnectionBudget>,
    slots: usize,
}

impl BudgetLease {
    /// Reserves up to `requested` slots. The lease may hold zero.
    pub fn reserve(budget: &Arc<GlobalConnectionBudget>, requested: usize) -> Self {
        let slots = budget.reserve(requested);
        Self {
            budget: Arc::clone(budget),
            slots,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}

impl Drop for BudgetLease {
    fn drop(&mut self) {
        self.budget.release(self.slots);
    }
}
