use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts emails attempted in a run against an optional cap.
///
/// A slot is taken before the first attempt and is never given back, so the cap bounds
/// attempts, not successes.
#[derive(Debug)]
pub struct QuotaGate {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl QuotaGate {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Reserve one slot. Returns false once the cap is reached.
    pub fn try_acquire(&self) -> bool {
        match self.limit {
            None => {
                self.used.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(limit) => self
                .used
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    (used < limit).then_some(used + 1)
                })
                .is_ok(),
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}
