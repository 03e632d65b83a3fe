use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    ledger::{Amount, SlabIndex},
};

pub const TOKEN_DECIMALS: u32 = 18;
pub const TOKEN_SCALE: Amount = 1_000_000_000_000_000_000; // 1 token = 1e18 minimal units
pub const DEFAULT_MAX_SLAB: SlabIndex = 4;
pub const DEFAULT_SLAB_CAPACITY: Amount = 100 * TOKEN_SCALE;

/// Slab geometry, fixed for the lifetime of a ledger.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawConfig")]
pub struct LedgerConfig {
    max_slab: SlabIndex,
    slab_capacity: Amount,
}

#[derive(Deserialize)]
struct RawConfig {
    max_slab: SlabIndex,
    #[serde(default = "default_capacity")]
    slab_capacity: Amount,
}

fn default_capacity() -> Amount {
    DEFAULT_SLAB_CAPACITY
}

impl TryFrom<RawConfig> for LedgerConfig {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        LedgerConfig::new(raw.max_slab, raw.slab_capacity)
    }
}

impl LedgerConfig {
    pub fn new(max_slab: SlabIndex, slab_capacity: Amount) -> Result<Self, ConfigError> {
        if max_slab == 0 {
            return Err(ConfigError::ZeroSlabs);
        }
        if slab_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if slab_capacity.checked_mul(max_slab as Amount).is_none() {
            return Err(ConfigError::CapacityOverflow {
                max_slab,
                slab_capacity,
            });
        }
        Ok(Self {
            max_slab,
            slab_capacity,
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn max_slab(&self) -> SlabIndex {
        self.max_slab
    }

    pub fn slab_capacity(&self) -> Amount {
        self.slab_capacity
    }

    /// Capacity across every slab. Cannot overflow, checked in [`LedgerConfig::new`].
    pub fn total_capacity(&self) -> Amount {
        self.slab_capacity * self.max_slab as Amount
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_slab: DEFAULT_MAX_SLAB,
            slab_capacity: DEFAULT_SLAB_CAPACITY,
        }
    }
}
