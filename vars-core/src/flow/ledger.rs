//! Credit Ledger
//!
//! Each subscription keeps a count of the deliveries its subscriber has
//! authorized. Grants add to the count, deliveries take from it, and the
//! `UNBOUNDED` sentinel switches accounting off for good.
//!
//! # Thread Safety
//!
//! All operations are compare-and-retry loops on a single `AtomicU64`; no
//! locks are taken, so grants and consumption may race freely. Sequentially
//! consistent ordering keeps ledger updates in the same total order as the
//! delivery state and guard flags they are checked against.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, VarError};

/// Credit value meaning "deliver everything".
pub const UNBOUNDED: u64 = u64::MAX;

/// Atomic credit counter for one subscription.
#[derive(Debug, Default)]
pub struct CreditLedger {
    credit: AtomicU64,
}

impl CreditLedger {
    /// Create an empty ledger.
    pub const fn new() -> Self {
        Self {
            credit: AtomicU64::new(0),
        }
    }

    /// Add `n` units of credit and return the new balance.
    ///
    /// Saturates at [`UNBOUNDED`]; once reached, the balance never changes
    /// again except through [`drain`](Self::drain).
    pub fn grant(&self, n: u64) -> Result<u64> {
        if n == 0 {
            return Err(VarError::InvalidRequest(n));
        }

        let mut current = self.credit.load(Ordering::SeqCst);
        loop {
            if current == UNBOUNDED {
                return Ok(UNBOUNDED);
            }
            let next = current.saturating_add(n);
            match self
                .credit
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Take `k` units if at least that many are available.
    ///
    /// Always succeeds against an unbounded balance, without decrementing.
    pub fn try_consume(&self, k: u64) -> bool {
        let mut current = self.credit.load(Ordering::SeqCst);
        loop {
            if current == UNBOUNDED {
                return true;
            }
            if current < k {
                return false;
            }
            match self.credit.compare_exchange_weak(
                current,
                current - k,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current balance.
    pub fn available(&self) -> u64 {
        self.credit.load(Ordering::SeqCst)
    }

    /// Whether the balance is the unbounded sentinel.
    pub fn is_unbounded(&self) -> bool {
        self.available() == UNBOUNDED
    }

    /// Reset the balance to zero, returning what was there.
    pub fn drain(&self) -> u64 {
        self.credit.swap(0, Ordering::SeqCst)
    }
}
