//! Storage schema
//!
//! `orders`          - one row per submitted order, status moves forward only
//! `ledger`          - append-only signed movements (credit > 0, debit < 0)
//! `ledger_accounts` - one lock row per user, taken FOR UPDATE by withdrawals

pub const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS orders (
        number       TEXT PRIMARY KEY,
        owner        BIGINT NOT NULL,
        status       TEXT NOT NULL DEFAULT 'NEW'
                     CHECK (status IN ('NEW', 'PROCESSING', 'INVALID', 'PROCESSED')),
        accrual      NUMERIC(14, 2),
        submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS orders_owner_idx ON orders (owner, submitted_at DESC)"#,
    r#"CREATE INDEX IF NOT EXISTS orders_pending_idx ON orders (status)
        WHERE status IN ('NEW', 'PROCESSING')"#,
    r#"CREATE TABLE IF NOT EXISTS ledger (
        id           BIGSERIAL PRIMARY KEY,
        owner        BIGINT NOT NULL,
        order_number TEXT NOT NULL,
        amount       NUMERIC(14, 2) NOT NULL CHECK (amount <> 0),
        recorded_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS ledger_owner_idx ON ledger (owner, recorded_at DESC)"#,
    // At most one accrual credit per order
    r#"CREATE UNIQUE INDEX IF NOT EXISTS ledger_credit_once_idx ON ledger (order_number)
        WHERE amount > 0"#,
    // At most one withdrawal per order number; a replayed withdraw finds it
    r#"CREATE UNIQUE INDEX IF NOT EXISTS ledger_debit_once_idx ON ledger (order_number)
        WHERE amount < 0"#,
    r#"CREATE TABLE IF NOT EXISTS ledger_accounts (
        owner BIGINT PRIMARY KEY
    )"#,
];
