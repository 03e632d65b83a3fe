use thiserror::Error;

use crate::ledger::{AccountId, Amount, SlabIndex};

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Rejected ledger configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_slab must be greater than zero")]
    ZeroSlabs,
    #[error("slab_capacity must be greater than zero")]
    ZeroCapacity,
    #[error("total capacity of {max_slab} slabs x {slab_capacity} overflows")]
    CapacityOverflow {
        max_slab: SlabIndex,
        slab_capacity: Amount,
    },
    #[error("unable to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures raised by the slab allocator. None of them mutates state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("all {max_slab} slabs are full")]
    SlabsExhausted { max_slab: SlabIndex },
    #[error("deposit of {requested} exceeds remaining capacity {available}")]
    InsufficientCapacity { requested: Amount, available: Amount },
    #[error("slab state does not match the ledger config: {0}")]
    MalformedState(String),
}

/// Failures reported by the value-transfer collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("allowance of {spender} over {owner} is {allowance}, needs {amount}")]
    InsufficientAllowance {
        owner: AccountId,
        spender: AccountId,
        allowance: Amount,
        amount: Amount,
    },
    #[error("balance of {account} is {balance}, needs {amount}")]
    InsufficientBalance {
        account: AccountId,
        balance: Amount,
        amount: Amount,
    },
    #[error("invalid account identity")]
    InvalidAccount,
    #[error("balance overflow for {account}")]
    Overflow { account: AccountId },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("deposit amount must be greater than zero")]
    InvalidAmount,
    #[error("please approve custodian {custodian} to transfer {amount} (current allowance {allowance})")]
    TransferNotApproved {
        custodian: AccountId,
        amount: Amount,
        allowance: Amount,
    },
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    /// Errors the depositor can recover from by fixing input or re-approving.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidAmount
                | LedgerError::TransferNotApproved { .. }
                | LedgerError::Transfer(_)
        )
    }

    /// Permanent capacity conditions.
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            LedgerError::Allocation(
                AllocationError::SlabsExhausted { .. } | AllocationError::InsufficientCapacity { .. }
            )
        )
    }
}
