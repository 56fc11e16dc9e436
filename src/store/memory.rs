//! In-memory [`ReconcileStore`] for tests and local runs without PostgreSQL

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use super::{ReconcileStore, StoreError};
use crate::models::{
    ACCRUAL_SCALE, AccrualReport, Balance, LedgerEntry, Order, OrderStatus, UserId,
};

#[derive(Default)]
struct MemoryState {
    orders: BTreeMap<String, Order>,
    ledger: Vec<LedgerEntry>,
}

/// Same transition and credit rules as the PostgreSQL store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_order(&self, order: Order) {
        self.lock().orders.insert(order.number.clone(), order);
    }

    pub fn order(&self, number: &str) -> Option<Order> {
        self.lock().orders.get(number).cloned()
    }

    pub fn ledger(&self) -> Vec<LedgerEntry> {
        self.lock().ledger.clone()
    }

    pub fn balance(&self, owner: UserId) -> Balance {
        Balance::from_amounts(
            self.lock()
                .ledger
                .iter()
                .filter(|e| e.owner == owner)
                .map(|e| e.amount),
        )
    }
}

#[async_trait]
impl ReconcileStore for MemoryStore {
    async fn pending_orders(&self) -> Result<Vec<Order>, StoreError> {
        let mut pending: Vec<Order> = self
            .lock()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|o| o.submitted_at);
        Ok(pending)
    }

    async fn apply_accrual(
        &self,
        order: &Order,
        report: &AccrualReport,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(stored) = state.orders.get_mut(&order.number) else {
            return Ok(false);
        };
        if !report.status.predecessors().contains(&stored.status) {
            return Ok(false);
        }

        stored.status = report.status;
        stored.accrual = match report.status {
            OrderStatus::Processed => report.accrual.map(|a| a.round_dp(ACCRUAL_SCALE)),
            _ => None,
        };
        let owner = stored.owner;

        if let Some(amount) = report.credit() {
            let credited = state
                .ledger
                .iter()
                .any(|e| e.order_number == order.number && e.amount > Decimal::ZERO);
            if !credited {
                state.ledger.push(LedgerEntry {
                    owner,
                    order_number: order.number.clone(),
                    amount,
                    recorded_at: Utc::now(),
                });
            }
        }
        Ok(true)
    }
}
