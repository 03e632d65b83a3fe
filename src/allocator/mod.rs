//! Greedy left-to-right slab allocation.
//!
//! The allocator never touches shared state: [`SlabAllocator::allocate`] takes
//! the current [`SlabState`] by reference and returns the state that would
//! result from the deposit. Callers commit it only once every other step of
//! the deposit has succeeded.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::LedgerConfig,
    error::AllocationError,
    ledger::{Amount, SlabIndex},
};

/// Fill levels of every slab plus the pointer to the first open one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlabState {
    pub current_slab: SlabIndex,
    pub slab_filled: Vec<Amount>,
    pub total_deposited: Amount,
}

impl SlabState {
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            current_slab: 0,
            slab_filled: vec![0; config.max_slab()],
            total_deposited: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_slab >= self.slab_filled.len()
    }

    /// Validate the accounting invariants against `config`.
    pub fn check_invariants(&self, config: &LedgerConfig) -> Result<(), String> {
        let capacity = config.slab_capacity();
        if self.slab_filled.len() != config.max_slab() {
            return Err(format!(
                "expected {} slabs, found {}",
                config.max_slab(),
                self.slab_filled.len()
            ));
        }
        if self.current_slab > config.max_slab() {
            return Err(format!(
                "current slab {} beyond max {}",
                self.current_slab,
                config.max_slab()
            ));
        }
        let mut sum: Amount = 0;
        for (idx, filled) in self.slab_filled.iter().copied().enumerate() {
            if filled > capacity {
                return Err(format!("slab {idx} holds {filled} over capacity {capacity}"));
            }
            if idx < self.current_slab && filled != capacity {
                return Err(format!("closed slab {idx} holds {filled}, expected {capacity}"));
            }
            if idx == self.current_slab && filled == capacity {
                return Err(format!("current slab {idx} is already full"));
            }
            if idx > self.current_slab && filled != 0 {
                return Err(format!("slab {idx} ahead of current slab holds {filled}"));
            }
            sum = sum
                .checked_add(filled)
                .ok_or_else(|| "slab total overflows".to_string())?;
        }
        if sum != self.total_deposited {
            return Err(format!(
                "total deposited {} differs from slab sum {sum}",
                self.total_deposited
            ));
        }
        Ok(())
    }
}

/// Portion of a deposit credited to one slab.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlabFill {
    pub slab: SlabIndex,
    pub amount: Amount,
}

/// Result of a successful allocation, not yet committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub state: SlabState,
    pub final_slab: SlabIndex,
    pub fills: Vec<SlabFill>,
}

#[derive(Clone, Copy, Debug)]
pub struct SlabAllocator {
    config: LedgerConfig,
}

impl SlabAllocator {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Capacity left across the current slab and every slab after it.
    pub fn remaining_capacity(&self, state: &SlabState) -> Amount {
        self.config.total_capacity().saturating_sub(state.total_deposited)
    }

    /// Spread `amount` over the open slabs starting at `state.current_slab`.
    ///
    /// A slab that becomes exactly full closes immediately, so the returned
    /// state always points at the next open slab (or `max_slab`). The final
    /// slab is the highest-index slab that absorbed part of the deposit.
    pub fn allocate(&self, amount: Amount, state: &SlabState) -> Result<Allocation, AllocationError> {
        let max_slab = self.config.max_slab();
        let capacity = self.config.slab_capacity();
        if state.current_slab >= max_slab {
            return Err(AllocationError::SlabsExhausted { max_slab });
        }
        state
            .check_invariants(&self.config)
            .map_err(AllocationError::MalformedState)?;

        let mut next = state.clone();
        let mut fills = Vec::new();
        let mut remaining = amount;
        let mut slab = next.current_slab;
        let mut final_slab = slab;

        while remaining > 0 {
            if slab >= max_slab {
                return Err(AllocationError::InsufficientCapacity {
                    requested: amount,
                    available: self.remaining_capacity(state),
                });
            }
            let space = capacity - next.slab_filled[slab];
            let take = remaining.min(space);
            next.slab_filled[slab] += take;
            remaining -= take;
            final_slab = slab;
            fills.push(SlabFill { slab, amount: take });
            if next.slab_filled[slab] == capacity {
                slab += 1;
            }
        }

        next.current_slab = slab;
        next.total_deposited += amount;
        debug!(
            amount = %amount,
            from_slab = state.current_slab,
            to_slab = next.current_slab,
            final_slab,
            spans = fills.len(),
            "allocation planned"
        );
        Ok(Allocation {
            state: next,
            final_slab,
            fills,
        })
    }
}
