use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ledger::{AccountId, Amount, SlabIndex};

/// Notification emitted once a deposit has been committed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Deposit {
        depositor: AccountId,
        amount: Amount,
        slab: SlabIndex,
    },
}

/// Receives committed events in commit order.
///
/// Called after the ledger state lock is released: queries on the emitting
/// ledger are fine, depositing into it from `emit` deadlocks.
pub trait EventSink {
    fn emit(&self, event: &LedgerEvent);
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn emit(&self, event: &LedgerEvent) {
        (**self).emit(event)
    }
}

impl<A: EventSink, B: EventSink> EventSink for (A, B) {
    fn emit(&self, event: &LedgerEvent) {
        self.0.emit(event);
        self.1.emit(event);
    }
}

/// Keeps every event in emission order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<LedgerEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<LedgerEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: &LedgerEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Writes one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::Deposit {
                depositor,
                amount,
                slab,
            } => info!(
                event = "deposit",
                depositor = %depositor,
                amount = %amount,
                slab = *slab,
                "deposit"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deposit_event_json_shape() {
        let event = LedgerEvent::Deposit {
            depositor: "alice".into(),
            amount: 100,
            slab: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "deposit", "depositor": "alice", "amount": 100, "slab": 0})
        );
    }

    #[test]
    fn log_preserves_order() {
        let log = EventLog::new();
        for slab in 0..3 {
            log.emit(&LedgerEvent::Deposit {
                depositor: "bob".into(),
                amount: 1,
                slab,
            });
        }
        let slabs: Vec<_> = log
            .drain()
            .into_iter()
            .map(|LedgerEvent::Deposit { slab, .. }| slab)
            .collect();
        assert_eq!(slabs, vec![0, 1, 2]);
        assert!(log.is_empty());
    }
}
