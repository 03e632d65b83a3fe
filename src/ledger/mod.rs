use std::{collections::BTreeMap, fs, path::Path};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{
    allocator::{SlabAllocator, SlabFill, SlabState},
    config::LedgerConfig,
    error::{AllocationError, LedgerError, Result},
    events::{EventSink, LedgerEvent},
    transfer::ValueTransfer,
};

pub type AccountId = String;
pub type Amount = u128;
pub type SlabIndex = usize;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub deposits: u64,
    pub last_slab: Option<SlabIndex>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub config: LedgerConfig,
    pub custodian: AccountId,
    pub meta: SnapshotMetadata,
    pub slabs: SlabState,
    pub depositors: BTreeMap<AccountId, SlabIndex>,
    #[serde(with = "hex_root")]
    pub state_root: [u8; 32],
}

impl LedgerSnapshot {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Re-check the accounting invariants and the recorded root.
    pub fn verify(&self) -> Result<()> {
        self.slabs
            .check_invariants(&self.config)
            .map_err(LedgerError::CorruptSnapshot)?;
        if let Some((account, slab)) = self
            .depositors
            .iter()
            .find(|(_, slab)| **slab >= self.config.max_slab())
        {
            return Err(LedgerError::CorruptSnapshot(format!(
                "depositor {account} recorded in slab {slab} beyond max {}",
                self.config.max_slab()
            )));
        }
        let root = compute_state_root(
            &self.config,
            &self.custodian,
            &self.meta,
            &self.slabs,
            &self.depositors,
        );
        if root != self.state_root {
            return Err(LedgerError::CorruptSnapshot("state root mismatch".into()));
        }
        Ok(())
    }

    pub fn state_root_hex(&self) -> String {
        hex::encode(self.state_root)
    }
}

/// Mutable ledger state. Only [`DepositLedger`] mutates it, under its lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerState {
    pub meta: SnapshotMetadata,
    pub slabs: SlabState,
    pub depositors: BTreeMap<AccountId, SlabIndex>,
}

impl LedgerState {
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            meta: SnapshotMetadata::default(),
            slabs: SlabState::new(config),
            depositors: BTreeMap::new(),
        }
    }
}

/// Custodian-side deposit ledger over a [`ValueTransfer`] collaborator.
pub struct DepositLedger<T, S> {
    allocator: SlabAllocator,
    custodian: AccountId,
    transfer: T,
    sink: S,
    state: Mutex<LedgerState>,
    // taken before the state lock is released so events leave in commit order
    emit_order: Mutex<()>,
}

impl<T: ValueTransfer, S: EventSink> DepositLedger<T, S> {
    pub fn new(config: LedgerConfig, custodian: AccountId, transfer: T, sink: S) -> Self {
        Self {
            allocator: SlabAllocator::new(config),
            state: Mutex::new(LedgerState::new(&config)),
            emit_order: Mutex::new(()),
            custodian,
            transfer,
            sink,
        }
    }

    /// Rebuild a ledger from a verified snapshot.
    pub fn restore(snapshot: LedgerSnapshot, transfer: T, sink: S) -> Result<Self> {
        snapshot.verify()?;
        Ok(Self {
            allocator: SlabAllocator::new(snapshot.config),
            custodian: snapshot.custodian,
            transfer,
            sink,
            state: Mutex::new(LedgerState {
                meta: snapshot.meta,
                slabs: snapshot.slabs,
                depositors: snapshot.depositors,
            }),
            emit_order: Mutex::new(()),
        })
    }

    /// Pull `amount` from `caller` into the custodian and credit it to slabs.
    ///
    /// Returns the highest slab the deposit touched. On any error the ledger
    /// is left unchanged and nothing is emitted. The event is emitted after
    /// the state lock is released, so sinks may call the read-only queries.
    pub fn deposit_token(&self, caller: &AccountId, amount: Amount) -> Result<SlabIndex> {
        let mut state = self.state.lock();
        let outcome = self.try_deposit(&mut state, caller, amount);
        match outcome {
            Ok((slab, fills)) => {
                info!(
                    depositor = %caller,
                    amount = %amount,
                    slab,
                    spans = fills.len(),
                    current_slab = state.slabs.current_slab,
                    total_deposited = %state.slabs.total_deposited,
                    "deposit committed"
                );
                let _order = self.emit_order.lock();
                drop(state);
                self.sink.emit(&LedgerEvent::Deposit {
                    depositor: caller.clone(),
                    amount,
                    slab,
                });
                Ok(slab)
            }
            Err(err) => {
                warn!(depositor = %caller, amount = %amount, error = %err, "deposit rejected");
                Err(err)
            }
        }
    }

    fn try_deposit(
        &self,
        state: &mut LedgerState,
        caller: &AccountId,
        amount: Amount,
    ) -> Result<(SlabIndex, Vec<SlabFill>)> {
        if state.slabs.is_exhausted() {
            return Err(AllocationError::SlabsExhausted {
                max_slab: self.max_slab(),
            }
            .into());
        }
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let allowance = self.transfer.allowance(caller, &self.custodian);
        if allowance < amount {
            return Err(LedgerError::TransferNotApproved {
                custodian: self.custodian.clone(),
                amount,
                allowance,
            });
        }
        // plan before moving value so a capacity failure never strands a transfer
        let allocation = self.allocator.allocate(amount, &state.slabs)?;
        self.transfer
            .transfer_from(&self.custodian, caller, &self.custodian, amount)?;

        state.slabs = allocation.state;
        state.depositors.insert(caller.clone(), allocation.final_slab);
        state.meta.deposits += 1;
        state.meta.last_slab = Some(allocation.final_slab);
        Ok((allocation.final_slab, allocation.fills))
    }

    pub fn custodian(&self) -> &AccountId {
        &self.custodian
    }

    pub fn config(&self) -> &LedgerConfig {
        self.allocator.config()
    }

    pub fn current_slab(&self) -> SlabIndex {
        self.state.lock().slabs.current_slab
    }

    pub fn max_slab(&self) -> SlabIndex {
        self.allocator.config().max_slab()
    }

    pub fn slab_capacity(&self) -> Amount {
        self.allocator.config().slab_capacity()
    }

    /// Last slab credited to `depositor`, `0` when they never deposited.
    ///
    /// Use [`DepositLedger::depositor_slab`] to tell the two apart.
    pub fn user_slabs_deposit_info(&self, depositor: &AccountId) -> SlabIndex {
        self.depositor_slab(depositor).unwrap_or(0)
    }

    pub fn depositor_slab(&self, depositor: &AccountId) -> Option<SlabIndex> {
        self.state.lock().depositors.get(depositor).copied()
    }

    pub fn slab_filled(&self, slab: SlabIndex) -> Option<Amount> {
        self.state.lock().slabs.slab_filled.get(slab).copied()
    }

    pub fn total_deposited(&self) -> Amount {
        self.state.lock().slabs.total_deposited
    }

    pub fn remaining_capacity(&self) -> Amount {
        self.allocator.remaining_capacity(&self.state.lock().slabs)
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.lock().slabs.is_exhausted()
    }

    pub fn state(&self) -> LedgerState {
        self.state.lock().clone()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            config: *self.allocator.config(),
            custodian: self.custodian.clone(),
            meta: state.meta.clone(),
            slabs: state.slabs.clone(),
            depositors: state.depositors.clone(),
            state_root: compute_state_root(
                self.allocator.config(),
                &self.custodian,
                &state.meta,
                &state.slabs,
                &state.depositors,
            ),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }
}

fn compute_state_root(
    config: &LedgerConfig,
    custodian: &AccountId,
    meta: &SnapshotMetadata,
    slabs: &SlabState,
    depositors: &BTreeMap<AccountId, SlabIndex>,
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::new();
    let mut hasher = Sha256::new();
    hasher.update(b"header");
    hasher.update((custodian.len() as u64).to_le_bytes());
    hasher.update(custodian.as_bytes());
    hasher.update((config.max_slab() as u64).to_le_bytes());
    hasher.update(config.slab_capacity().to_le_bytes());
    hasher.update(meta.deposits.to_le_bytes());
    match meta.last_slab {
        Some(slab) => {
            hasher.update([1u8]);
            hasher.update((slab as u64).to_le_bytes());
        }
        None => hasher.update([0u8]),
    }
    leaves.push(hasher.finalize().into());

    let mut hasher = Sha256::new();
    hasher.update(b"cursor");
    hasher.update((slabs.current_slab as u64).to_le_bytes());
    hasher.update(slabs.total_deposited.to_le_bytes());
    leaves.push(hasher.finalize().into());
    for (idx, filled) in slabs.slab_filled.iter().enumerate() {
        let mut hasher = Sha256::new();
        hasher.update(b"slab");
        hasher.update((idx as u64).to_le_bytes());
        hasher.update(filled.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for (account, slab) in depositors {
        let mut hasher = Sha256::new();
        hasher.update(b"depositor");
        hasher.update(account.as_bytes());
        hasher.update((*slab as u64).to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"tokenslab-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

mod hex_root {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("state root must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{events::EventLog, transfer::InMemoryToken};

    type TestLedger = DepositLedger<Arc<InMemoryToken>, Arc<EventLog>>;

    const VAULT: &str = "vault";

    fn acct(name: &str) -> AccountId {
        name.to_string()
    }

    fn setup(max_slab: SlabIndex, capacity: Amount) -> (TestLedger, Arc<InMemoryToken>, Arc<EventLog>) {
        let token = Arc::new(InMemoryToken::new("XT"));
        let log = Arc::new(EventLog::new());
        let config = LedgerConfig::new(max_slab, capacity).unwrap();
        let ledger = DepositLedger::new(config, acct(VAULT), token.clone(), log.clone());
        (ledger, token, log)
    }

    fn fund(token: &InMemoryToken, who: &str, amount: Amount) {
        token.mint(&acct(who), amount).unwrap();
        token.approve(&acct(who), &acct(VAULT), amount).unwrap();
    }

    #[test]
    fn fresh_ledger_reads_empty() {
        let (ledger, _, log) = setup(4, 100);
        assert_eq!(ledger.current_slab(), 0);
        assert_eq!(ledger.max_slab(), 4);
        assert_eq!(ledger.user_slabs_deposit_info(&acct("alice")), 0);
        assert_eq!(ledger.depositor_slab(&acct("alice")), None);
        assert_eq!(ledger.total_deposited(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn exact_fill_moves_next_depositor_to_slab_one() {
        let (ledger, token, log) = setup(4, 100);
        fund(&token, "alice", 1_000);
        fund(&token, "bob", 1_000);

        assert_eq!(ledger.deposit_token(&acct("alice"), 100).unwrap(), 0);
        assert_eq!(ledger.current_slab(), 1);
        assert_eq!(ledger.depositor_slab(&acct("alice")), Some(0));

        assert_eq!(ledger.deposit_token(&acct("bob"), 5).unwrap(), 1);
        assert_eq!(ledger.user_slabs_deposit_info(&acct("bob")), 1);
        assert_eq!(token.balance_of(&acct(VAULT)), 105);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn unapproved_deposit_changes_nothing() {
        let (ledger, token, log) = setup(4, 100);
        token.mint(&acct("alice"), 1_000).unwrap();
        token.approve(&acct("alice"), &acct(VAULT), 99).unwrap();
        let before = ledger.state();

        let err = ledger.deposit_token(&acct("alice"), 100).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::TransferNotApproved { amount: 100, allowance: 99, .. }
        ));
        assert!(err.is_caller_error());
        assert!(err.to_string().contains("please approve"));
        assert_eq!(ledger.state(), before);
        assert_eq!(token.balance_of(&acct("alice")), 1_000);
        assert!(log.is_empty());
    }

    #[test]
    fn zero_amount_is_invalid() {
        let (ledger, _, log) = setup(4, 100);
        assert!(matches!(
            ledger.deposit_token(&acct("alice"), 0),
            Err(LedgerError::InvalidAmount)
        ));
        assert!(log.is_empty());
    }

    #[test]
    fn insufficient_balance_propagates_transfer_error() {
        let (ledger, token, log) = setup(4, 100);
        token.mint(&acct("alice"), 10).unwrap();
        token.approve(&acct("alice"), &acct(VAULT), 50).unwrap();
        let before = ledger.state();
        let err = ledger.deposit_token(&acct("alice"), 50).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Transfer(crate::error::TransferError::InsufficientBalance { .. })
        ));
        assert_eq!(ledger.state(), before);
        assert_eq!(token.allowance(&acct("alice"), &acct(VAULT)), 50);
        assert!(log.is_empty());
    }

    #[test]
    fn overflowing_deposit_keeps_tokens_with_depositor() {
        let (ledger, token, log) = setup(2, 100);
        fund(&token, "alice", 500);
        ledger.deposit_token(&acct("alice"), 150).unwrap();
        let before = ledger.state();

        let err = ledger.deposit_token(&acct("alice"), 51).unwrap_err();
        assert!(err.is_capacity_error());
        assert!(matches!(
            err,
            LedgerError::Allocation(AllocationError::InsufficientCapacity { available: 50, .. })
        ));
        assert_eq!(ledger.state(), before);
        assert_eq!(token.balance_of(&acct("alice")), 350);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn exhaustion_is_terminal() {
        let (ledger, token, log) = setup(2, 100);
        fund(&token, "alice", 1_000);
        assert_eq!(ledger.deposit_token(&acct("alice"), 200).unwrap(), 1);
        assert!(ledger.is_exhausted());
        assert_eq!(ledger.current_slab(), ledger.max_slab());
        let after_fill = ledger.state();

        for amount in [0, 1, 100, 10_000] {
            let err = ledger.deposit_token(&acct("alice"), amount).unwrap_err();
            assert!(matches!(
                err,
                LedgerError::Allocation(AllocationError::SlabsExhausted { max_slab: 2 })
            ));
        }
        // unapproved callers get the capacity error too
        let err = ledger.deposit_token(&acct("mallory"), 1).unwrap_err();
        assert!(err.is_capacity_error());
        assert_eq!(ledger.state(), after_fill);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn events_carry_depositor_amount_and_final_slab() {
        let (ledger, token, log) = setup(4, 100);
        fund(&token, "alice", 1_000);
        ledger.deposit_token(&acct("alice"), 40).unwrap();
        ledger.deposit_token(&acct("alice"), 170).unwrap();
        assert_eq!(
            log.events(),
            vec![
                LedgerEvent::Deposit {
                    depositor: acct("alice"),
                    amount: 40,
                    slab: 0,
                },
                LedgerEvent::Deposit {
                    depositor: acct("alice"),
                    amount: 170,
                    slab: 2,
                },
            ]
        );
        assert_eq!(ledger.depositor_slab(&acct("alice")), Some(2));
        assert_eq!(ledger.current_slab(), 2);
    }

    #[test]
    fn random_sequences_conserve_value() {
        let mut rng = StdRng::seed_from_u64(0x51ab);
        for _ in 0..20 {
            let (ledger, token, log) = setup(rng.gen_range(1..6), rng.gen_range(1..200));
            let depositors = ["alice", "bob", "carol"];
            for who in depositors {
                fund(&token, who, 10_000);
            }
            let mut accepted: Amount = 0;
            let mut last_current = 0;
            for _ in 0..40 {
                let who = depositors[rng.gen_range(0..depositors.len())];
                let amount = rng.gen_range(0..150);
                if ledger.deposit_token(&acct(who), amount).is_ok() {
                    accepted += amount;
                }
                let state = ledger.state();
                state.slabs.check_invariants(ledger.config()).unwrap();
                assert!(state.slabs.current_slab >= last_current);
                last_current = state.slabs.current_slab;
            }
            assert_eq!(ledger.total_deposited(), accepted);
            assert_eq!(token.balance_of(&acct(VAULT)), accepted);
            let from_events: Amount = log
                .events()
                .iter()
                .map(|LedgerEvent::Deposit { amount, .. }| *amount)
                .sum();
            assert_eq!(from_events, accepted);
        }
    }

    #[test]
    fn concurrent_deposits_stay_consistent() {
        let (ledger, token, log) = setup(8, 1_000);
        let ledger = Arc::new(ledger);
        let handles: Vec<_> = (0..4)
            .map(|idx| {
                let who = format!("depositor-{idx}");
                fund(&token, &who, 5_000);
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    let mut ok: Amount = 0;
                    for step in 0..50u128 {
                        let amount = 7 + step % 13;
                        if ledger.deposit_token(&who, amount).is_ok() {
                            ok += amount;
                        }
                    }
                    ok
                })
            })
            .collect();
        let accepted: Amount = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let state = ledger.state();
        state.slabs.check_invariants(ledger.config()).unwrap();
        assert_eq!(state.slabs.total_deposited, accepted);
        assert_eq!(log.len() as u64, state.meta.deposits);
    }

    #[test]
    fn snapshot_restores_and_detects_tampering() {
        let (ledger, token, _) = setup(3, 100);
        fund(&token, "alice", 1_000);
        ledger.deposit_token(&acct("alice"), 130).unwrap();
        let snapshot = ledger.snapshot();
        snapshot.verify().unwrap();

        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: LedgerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snapshot);

        let restored =
            DepositLedger::restore(decoded, token.clone(), Arc::new(EventLog::new())).unwrap();
        assert_eq!(restored.current_slab(), 1);
        assert_eq!(restored.depositor_slab(&acct("alice")), Some(1));
        assert_eq!(restored.deposit_token(&acct("alice"), 70).unwrap(), 1);
        assert_eq!(restored.current_slab(), 2);

        let mut tampered = snapshot.clone();
        tampered.depositors.insert(acct("mallory"), 0);
        assert!(matches!(tampered.verify(), Err(LedgerError::CorruptSnapshot(_))));

        let mut broken = snapshot.clone();
        broken.slabs.slab_filled[0] = 90;
        assert!(matches!(broken.verify(), Err(LedgerError::CorruptSnapshot(_))));

        let mut redirected = snapshot.clone();
        redirected.custodian = acct("mallory");
        assert!(matches!(redirected.verify(), Err(LedgerError::CorruptSnapshot(_))));
        assert!(DepositLedger::restore(redirected, token.clone(), Arc::new(EventLog::new())).is_err());

        assert_eq!(snapshot.meta.last_slab, Some(1));
        let mut relabelled = snapshot.clone();
        relabelled.meta.last_slab = Some(0);
        assert!(matches!(relabelled.verify(), Err(LedgerError::CorruptSnapshot(_))));

        let mut recounted = snapshot.clone();
        recounted.meta.deposits = 999;
        assert!(matches!(recounted.verify(), Err(LedgerError::CorruptSnapshot(_))));

        let mut regrown = snapshot.clone();
        regrown.config = LedgerConfig::new(4, 100).unwrap();
        regrown.slabs.slab_filled.push(0);
        regrown.slabs.check_invariants(&regrown.config).unwrap();
        assert!(matches!(regrown.verify(), Err(LedgerError::CorruptSnapshot(_))));
    }

    struct QueryingSink {
        ledger: std::sync::OnceLock<std::sync::Weak<DepositLedger<Arc<InMemoryToken>, Arc<QueryingSink>>>>,
        seen: Mutex<Vec<(SlabIndex, SlabIndex)>>,
    }

    impl EventSink for QueryingSink {
        fn emit(&self, event: &LedgerEvent) {
            let LedgerEvent::Deposit { slab, .. } = event;
            if let Some(ledger) = self.ledger.get().and_then(|weak| weak.upgrade()) {
                self.seen.lock().push((*slab, ledger.current_slab()));
            }
        }
    }

    #[test]
    fn sink_can_query_ledger_while_emitting() {
        let token = Arc::new(InMemoryToken::new("XT"));
        let sink = Arc::new(QueryingSink {
            ledger: std::sync::OnceLock::new(),
            seen: Mutex::new(Vec::new()),
        });
        let config = LedgerConfig::new(4, 100).unwrap();
        let ledger = Arc::new(DepositLedger::new(config, acct(VAULT), token.clone(), sink.clone()));
        assert!(sink.ledger.set(Arc::downgrade(&ledger)).is_ok());
        fund(&token, "alice", 1_000);

        ledger.deposit_token(&acct("alice"), 100).unwrap();
        ledger.deposit_token(&acct("alice"), 30).unwrap();
        assert_eq!(*sink.seen.lock(), vec![(0, 1), (1, 1)]);
    }
}
