//! Value-transfer collaborator.
//!
//! The ledger never moves value itself; it asks a [`ValueTransfer`]
//! implementation to pull a pre-approved amount from the depositor into the
//! custodian account. [`InMemoryToken`] is a mintable single-asset token used
//! by the CLI and the tests.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::TransferError,
    ledger::{AccountId, Amount},
};

pub trait ValueTransfer {
    /// Amount `spender` may still move out of `owner`.
    fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Amount;

    /// Move `amount` from `from` to `to` on behalf of `spender`, consuming
    /// allowance. Must fail without any partial effect.
    fn transfer_from(
        &self,
        spender: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), TransferError>;
}

impl<T: ValueTransfer + ?Sized> ValueTransfer for std::sync::Arc<T> {
    fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Amount {
        (**self).allowance(owner, spender)
    }

    fn transfer_from(
        &self,
        spender: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), TransferError> {
        (**self).transfer_from(spender, from, to, amount)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenState {
    pub total_supply: Amount,
    pub balances: BTreeMap<AccountId, Amount>,
    pub allowances: BTreeMap<(AccountId, AccountId), Amount>,
}

/// Mintable fungible token kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryToken {
    symbol: String,
    state: Mutex<TokenState>,
}

impl InMemoryToken {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            state: Mutex::new(TokenState::default()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn total_supply(&self) -> Amount {
        self.state.lock().total_supply
    }

    pub fn balance_of(&self, account: &AccountId) -> Amount {
        self.state.lock().balances.get(account).copied().unwrap_or(0)
    }

    pub fn mint(&self, to: &AccountId, amount: Amount) -> Result<(), TransferError> {
        check_account(to)?;
        let mut state = self.state.lock();
        let supply = state
            .total_supply
            .checked_add(amount)
            .ok_or_else(|| TransferError::Overflow { account: to.clone() })?;
        let balance = state.balances.get(to).copied().unwrap_or(0);
        // supply bounds every balance, so this cannot overflow once supply didn't
        state.balances.insert(to.clone(), balance + amount);
        state.total_supply = supply;
        Ok(())
    }

    /// Set (not add to) the amount `spender` may move out of `owner`.
    pub fn approve(
        &self,
        owner: &AccountId,
        spender: &AccountId,
        amount: Amount,
    ) -> Result<(), TransferError> {
        check_account(owner)?;
        check_account(spender)?;
        self.state
            .lock()
            .allowances
            .insert((owner.clone(), spender.clone()), amount);
        Ok(())
    }

    pub fn snapshot(&self) -> TokenState {
        self.state.lock().clone()
    }
}

impl ValueTransfer for InMemoryToken {
    fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Amount {
        self.state
            .lock()
            .allowances
            .get(&(owner.clone(), spender.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn transfer_from(
        &self,
        spender: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), TransferError> {
        check_account(from)?;
        check_account(to)?;
        let mut state = self.state.lock();
        let key = (from.clone(), spender.clone());
        let allowance = state.allowances.get(&key).copied().unwrap_or(0);
        if allowance < amount {
            return Err(TransferError::InsufficientAllowance {
                owner: from.clone(),
                spender: spender.clone(),
                allowance,
                amount,
            });
        }
        let balance = state.balances.get(from).copied().unwrap_or(0);
        if balance < amount {
            return Err(TransferError::InsufficientBalance {
                account: from.clone(),
                balance,
                amount,
            });
        }
        if from != to {
            let credited = state.balances.get(to).copied().unwrap_or(0);
            state.balances.insert(from.clone(), balance - amount);
            state.balances.insert(to.clone(), credited + amount);
        }
        state.allowances.insert(key, allowance - amount);
        Ok(())
    }
}

fn check_account(account: &AccountId) -> Result<(), TransferError> {
    if account.trim().is_empty() {
        return Err(TransferError::InvalidAccount);
    }
    Ok(())
}
