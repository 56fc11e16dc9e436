//! Domain models: orders, accrual reports and ledger movements

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// User ID - owner of orders and ledger entries.
///
/// Assigned by the registration path; the engine never creates users.
pub type UserId = i64;

/// Accrual amounts are kept with two fractional digits.
pub const ACCRUAL_SCALE: u32 = 2;

/// Order lifecycle status.
///
/// Transitions only move forward:
/// `NEW -> PROCESSING -> {PROCESSED | INVALID}` or `NEW -> {PROCESSED | INVALID}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// The accrual service reports freshly registered orders as `REGISTERED`.
    #[serde(alias = "REGISTERED")]
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    pub const PENDING: [OrderStatus; 2] = [OrderStatus::New, OrderStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    /// Terminal statuses are never revisited by the reconciler.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::Processing => 1,
            OrderStatus::Invalid | OrderStatus::Processed => 2,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Statuses an order may currently be in for `self` to be applied.
    pub fn predecessors(&self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::New => &[],
            OrderStatus::Processing => &[OrderStatus::New],
            OrderStatus::Invalid | OrderStatus::Processed => {
                &[OrderStatus::New, OrderStatus::Processing]
            }
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" | "REGISTERED" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A purchase order submitted for loyalty accrual
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub number: String,
    #[serde(skip)]
    pub owner: UserId,
    pub status: OrderStatus,
    /// Meaningful only when `status == PROCESSED`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
    #[serde(rename = "uploaded_at")]
    pub submitted_at: DateTime<Utc>,
}

impl Order {
    pub fn new(number: impl Into<String>, owner: UserId) -> Self {
        Self {
            number: number.into(),
            owner,
            status: OrderStatus::New,
            accrual: None,
            submitted_at: Utc::now(),
        }
    }
}

/// Body of `GET /api/orders/{number}` on the accrual service
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccrualReport {
    pub order: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub accrual: Option<Decimal>,
}

impl AccrualReport {
    /// Accrual to credit: present only for PROCESSED reports with a positive amount.
    pub fn credit(&self) -> Option<Decimal> {
        match (self.status, self.accrual) {
            (OrderStatus::Processed, Some(amount)) if amount > Decimal::ZERO => {
                Some(amount.round_dp(ACCRUAL_SCALE))
            }
            _ => None,
        }
    }
}

/// One signed movement in a user's ledger.
///
/// Positive = accrual credit, negative = withdrawal debit.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub owner: UserId,
    pub order_number: String,
    pub amount: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// Derived balance view
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Balance {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl Balance {
    /// Fold ledger amounts into a balance
    pub fn from_amounts<I: IntoIterator<Item = Decimal>>(amounts: I) -> Self {
        amounts.into_iter().fold(Balance::default(), |mut acc, amount| {
            acc.current += amount;
            if amount < Decimal::ZERO {
                acc.withdrawn += amount.abs();
            }
            acc
        })
    }
}

/// A completed withdrawal as shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Withdrawal {
    #[serde(rename = "order")]
    pub order_number: String,
    #[serde(rename = "sum")]
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}
