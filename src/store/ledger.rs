//! Balance reads and the withdrawal transaction
//!
//! Withdrawals of one user are serialized on that user's `ledger_accounts` row,
//! taken `FOR UPDATE` before the balance is summed. The lock is held until the
//! debit is inserted or the transaction is dropped, so there is no gap between
//! the check and the write. Accrual credits never take this lock.
//!
//! Each order number carries at most one debit. A withdraw that finds its own
//! debit already booked (same owner and amount) reports `Completed` without
//! writing, so replaying the transaction after a lost commit reply is safe.

use rust_decimal::Decimal;
use sqlx::Row;
use tracing::{info, warn};

use super::{PgStore, StoreError, WithdrawError, WithdrawOutcome};
use crate::models::{ACCRUAL_SCALE, Balance, UserId, Withdrawal};
use crate::validation::is_valid_order_number;

/// What the withdraw transaction found or wrote
enum Debit {
    Written,
    /// A debit for this order number exists: (owner, amount)
    Booked((UserId, Decimal)),
    /// Lost the insert race to a concurrent withdrawal
    Taken,
    Insufficient(Decimal),
}

impl PgStore {
    pub async fn get_balance(&self, owner: UserId) -> Result<Balance, StoreError> {
        let pool = self.db.pool();
        let row = self
            .executor
            .execute("get_balance", move || async move {
                sqlx::query(
                    "SELECT COALESCE(SUM(amount), 0) AS current, \
                            COALESCE(SUM(-amount) FILTER (WHERE amount < 0), 0) AS withdrawn \
                     FROM ledger WHERE owner = $1",
                )
                .bind(owner)
                .fetch_one(pool)
                .await
            })
            .await?;

        Ok(Balance {
            current: row.try_get("current")?,
            withdrawn: row.try_get("withdrawn")?,
        })
    }

    /// Debit `amount` from `owner` against `order_number`.
    ///
    /// `amount` must be positive with at most two fractional digits.
    pub async fn withdraw(
        &self,
        owner: UserId,
        order_number: &str,
        amount: Decimal,
    ) -> Result<WithdrawOutcome, WithdrawError> {
        if amount <= Decimal::ZERO || amount.round_dp(ACCRUAL_SCALE) != amount {
            return Err(WithdrawError::InvalidAmount(amount));
        }
        if !is_valid_order_number(order_number) {
            return Err(WithdrawError::InvalidOrderNumber(order_number.to_string()));
        }

        let pool = self.db.pool();
        let outcome = self
            .executor
            .execute("withdraw", move || async move {
                let mut tx = pool.begin().await?;

                sqlx::query("INSERT INTO ledger_accounts (owner) VALUES ($1) ON CONFLICT DO NOTHING")
                    .bind(owner)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("SELECT owner FROM ledger_accounts WHERE owner = $1 FOR UPDATE")
                    .bind(owner)
                    .execute(&mut *tx)
                    .await?;

                let booked = sqlx::query_as::<_, (UserId, Decimal)>(
                    "SELECT owner, -amount FROM ledger WHERE order_number = $1 AND amount < 0",
                )
                .bind(order_number)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(debit) = booked {
                    return Ok(Debit::Booked(debit));
                }

                let balance = sqlx::query_scalar::<_, Decimal>(
                    "SELECT COALESCE(SUM(amount), 0) FROM ledger WHERE owner = $1",
                )
                .bind(owner)
                .fetch_one(&mut *tx)
                .await?;

                if amount > balance {
                    // Dropping `tx` rolls back and releases the lock
                    return Ok(Debit::Insufficient(balance));
                }

                let inserted = sqlx::query(
                    "INSERT INTO ledger (owner, order_number, amount) VALUES ($1, $2, $3) \
                     ON CONFLICT (order_number) WHERE amount < 0 DO NOTHING",
                )
                .bind(owner)
                .bind(order_number)
                .bind(-amount)
                .execute(&mut *tx)
                .await?;
                if inserted.rows_affected() == 0 {
                    // Another owner's withdrawal committed the number first
                    return Ok(Debit::Taken);
                }

                tx.commit().await?;
                Ok::<_, sqlx::Error>(Debit::Written)
            })
            .await
            .map_err(StoreError::from)?;

        let outcome = match outcome {
            Debit::Written => WithdrawOutcome::Completed,
            Debit::Booked((booked_owner, booked_amount))
                if booked_owner == owner && booked_amount == amount =>
            {
                info!(owner, order = order_number, %amount, "Withdrawal already booked");
                return Ok(WithdrawOutcome::Completed);
            }
            Debit::Booked(_) | Debit::Taken => {
                warn!(owner, order = order_number, "Order number already used for a withdrawal");
                return Err(WithdrawError::OrderNumberUsed(order_number.to_string()));
            }
            Debit::Insufficient(balance) => WithdrawOutcome::InsufficientFunds { balance },
        };

        match outcome {
            WithdrawOutcome::Completed => {
                info!(owner, order = order_number, %amount, "Withdrawal completed")
            }
            WithdrawOutcome::InsufficientFunds { balance } => {
                warn!(owner, order = order_number, %amount, %balance, "Insufficient funds")
            }
        }
        Ok(outcome)
    }

    /// Completed withdrawals of `owner`, newest first
    pub async fn list_withdrawals(&self, owner: UserId) -> Result<Vec<Withdrawal>, StoreError> {
        let pool = self.db.pool();
        let rows = self
            .executor
            .execute("list_withdrawals", move || async move {
                sqlx::query(
                    "SELECT order_number, -amount AS amount, recorded_at FROM ledger \
                     WHERE owner = $1 AND amount < 0 ORDER BY recorded_at DESC",
                )
                .bind(owner)
                .fetch_all(pool)
                .await
            })
            .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, StoreError>(Withdrawal {
                    order_number: row.try_get("order_number")?,
                    amount: row.try_get("amount")?,
                    processed_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }
}
