use async_trait::async_trait;
use tracing::{debug, info};

use super::{PgStore, ReconcileStore, StoreError, SubmitError, SubmitOutcome, order_from_row};
use crate::db::classifier::is_unique_violation;
use crate::models::{ACCRUAL_SCALE, AccrualReport, Order, OrderStatus, UserId};
use crate::validation::is_valid_order_number;

impl PgStore {
    /// Register an order number for `owner` in status NEW
    pub async fn submit_order(
        &self,
        owner: UserId,
        number: &str,
    ) -> Result<SubmitOutcome, SubmitError> {
        if !is_valid_order_number(number) {
            return Err(SubmitError::InvalidNumber(number.to_string()));
        }

        let pool = self.db.pool();
        let inserted = self
            .executor
            .execute("insert_order", move || async move {
                sqlx::query("INSERT INTO orders (number, owner, status) VALUES ($1, $2, 'NEW')")
                    .bind(number)
                    .bind(owner)
                    .execute(pool)
                    .await
            })
            .await;

        match inserted {
            Ok(_) => {
                info!(order = number, owner, "Order accepted");
                Ok(SubmitOutcome::Accepted)
            }
            Err(e) if is_unique_violation(&e) => {
                let existing: UserId = self
                    .executor
                    .execute("order_owner", move || async move {
                        sqlx::query_scalar::<_, UserId>("SELECT owner FROM orders WHERE number = $1")
                            .bind(number)
                            .fetch_one(pool)
                            .await
                    })
                    .await
                    .map_err(StoreError::from)?;

                if existing == owner {
                    Ok(SubmitOutcome::AlreadySubmitted)
                } else {
                    Ok(SubmitOutcome::ClaimedByAnotherUser)
                }
            }
            Err(e) => Err(StoreError::from(e).into()),
        }
    }

    /// Orders of `owner`, newest first
    pub async fn list_orders(&self, owner: UserId) -> Result<Vec<Order>, StoreError> {
        let pool = self.db.pool();
        let rows = self
            .executor
            .execute("list_orders", move || async move {
                sqlx::query(
                    "SELECT number, owner, status, accrual, submitted_at FROM orders \
                     WHERE owner = $1 ORDER BY submitted_at DESC",
                )
                .bind(owner)
                .fetch_all(pool)
                .await
            })
            .await?;

        rows.iter().map(order_from_row).collect()
    }
}

#[async_trait]
impl ReconcileStore for PgStore {
    async fn pending_orders(&self) -> Result<Vec<Order>, StoreError> {
        let pool = self.db.pool();
        let rows = self
            .executor
            .execute("pending_orders", move || async move {
                sqlx::query(
                    "SELECT number, owner, status, accrual, submitted_at FROM orders \
                     WHERE status IN ('NEW', 'PROCESSING') ORDER BY submitted_at",
                )
                .fetch_all(pool)
                .await
            })
            .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn apply_accrual(
        &self,
        order: &Order,
        report: &AccrualReport,
    ) -> Result<bool, StoreError> {
        let predecessors: Vec<&str> = report
            .status
            .predecessors()
            .iter()
            .map(OrderStatus::as_str)
            .collect();
        if predecessors.is_empty() {
            return Ok(false);
        }

        let accrual = match report.status {
            OrderStatus::Processed => report.accrual.map(|a| a.round_dp(ACCRUAL_SCALE)),
            _ => None,
        };
        let credit = report.credit();
        let status = report.status.as_str();
        let number = order.number.as_str();
        let predecessors = predecessors.as_slice();
        let pool = self.db.pool();

        let advanced = self
            .executor
            .execute("apply_accrual", move || async move {
                let mut tx = pool.begin().await?;

                let owner = sqlx::query_scalar::<_, UserId>(
                    "UPDATE orders SET status = $1, accrual = $2 \
                     WHERE number = $3 AND status = ANY($4) RETURNING owner",
                )
                .bind(status)
                .bind(accrual)
                .bind(number)
                .bind(predecessors)
                .fetch_optional(&mut *tx)
                .await?;

                let Some(owner) = owner else {
                    // Already at or past this status
                    return Ok(false);
                };

                if let Some(amount) = credit {
                    sqlx::query(
                        "INSERT INTO ledger (owner, order_number, amount) VALUES ($1, $2, $3) \
                         ON CONFLICT (order_number) WHERE amount > 0 DO NOTHING",
                    )
                    .bind(owner)
                    .bind(number)
                    .bind(amount)
                    .execute(&mut *tx)
                    .await?;
                }

                tx.commit().await?;
                Ok::<_, sqlx::Error>(true)
            })
            .await?;

        if advanced {
            info!(
                order = %order.number,
                from = %order.status,
                to = %report.status,
                credit = ?credit,
                "Order advanced"
            );
        } else {
            debug!(order = %order.number, status = %report.status, "Report does not advance order");
        }
        Ok(advanced)
    }
}
