//! Slab deposit ledger.
//!
//! Depositors move a fungible token into a custodian account; every accepted
//! amount is credited to a fixed sequence of fixed-capacity slabs, filled left
//! to right:
//!
//! * [`allocator`]: the greedy slab fill and its accounting invariants.
//! * [`ledger`]: [`DepositLedger`], the serialized deposit entry point,
//!   queries and snapshots.
//! * [`transfer`]: the value-transfer collaborator seam and an in-memory
//!   mintable token.
//! * [`events`]: post-commit deposit notifications.

pub mod allocator;
pub mod config;
pub mod events;
pub mod ledger;
pub mod scenario;
pub mod transfer;

mod error;

pub use allocator::{Allocation, SlabAllocator, SlabFill, SlabState};
pub use config::{LedgerConfig, DEFAULT_MAX_SLAB, DEFAULT_SLAB_CAPACITY, TOKEN_DECIMALS, TOKEN_SCALE};
pub use error::{AllocationError, ConfigError, LedgerError, Result, TransferError};
pub use events::{EventLog, EventSink, LedgerEvent, TracingSink};
pub use ledger::{AccountId, Amount, DepositLedger, LedgerSnapshot, LedgerState, SlabIndex};
pub use transfer::{InMemoryToken, ValueTransfer};
