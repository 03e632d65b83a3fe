//! Scripted runs of a ledger against an [`InMemoryToken`].
//!
//! A scenario file fixes the slab geometry and lists ordered steps. Failing
//! steps are recorded and the run continues, the same way independent callers
//! would keep submitting deposits.

use std::{fs, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::LedgerConfig,
    error::Result,
    events::EventSink,
    ledger::{AccountId, Amount, DepositLedger, SlabIndex},
    transfer::InMemoryToken,
};

fn default_custodian() -> AccountId {
    "custodian".to_string()
}

fn default_symbol() -> String {
    "XT".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scenario {
    pub config: LedgerConfig,
    #[serde(default = "default_custodian")]
    pub custodian: AccountId,
    #[serde(default = "default_symbol")]
    pub token_symbol: String,
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Mint { to: AccountId, amount: Amount },
    /// Pre-authorize the custodian to pull `amount` from `owner`.
    Approve { owner: AccountId, amount: Amount },
    Deposit { from: AccountId, amount: Amount },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Deposited { slab: SlabIndex },
    Failed { reason: String },
}

pub struct ScenarioRun<S> {
    pub ledger: DepositLedger<Arc<InMemoryToken>, S>,
    pub token: Arc<InMemoryToken>,
    pub outcomes: Vec<(Step, StepOutcome)>,
}

impl<S> ScenarioRun<S> {
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StepOutcome::Failed { .. }))
            .count()
    }
}

impl Scenario {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn run<S: EventSink>(&self, sink: S) -> ScenarioRun<S> {
        let token = Arc::new(InMemoryToken::new(self.token_symbol.clone()));
        let ledger = DepositLedger::new(self.config, self.custodian.clone(), token.clone(), sink);
        let mut outcomes = Vec::with_capacity(self.steps.len());
        for (idx, step) in self.steps.iter().enumerate() {
            let outcome = match step {
                Step::Mint { to, amount } => match token.mint(to, *amount) {
                    Ok(()) => StepOutcome::Applied,
                    Err(err) => StepOutcome::Failed {
                        reason: err.to_string(),
                    },
                },
                Step::Approve { owner, amount } => {
                    match token.approve(owner, &self.custodian, *amount) {
                        Ok(()) => StepOutcome::Applied,
                        Err(err) => StepOutcome::Failed {
                            reason: err.to_string(),
                        },
                    }
                }
                Step::Deposit { from, amount } => match ledger.deposit_token(from, *amount) {
                    Ok(slab) => StepOutcome::Deposited { slab },
                    Err(err) => StepOutcome::Failed {
                        reason: err.to_string(),
                    },
                },
            };
            debug!(step = idx, outcome = ?outcome, "scenario step");
            outcomes.push((step.clone(), outcome));
        }
        ScenarioRun {
            ledger,
            token,
            outcomes,
        }
    }
}
