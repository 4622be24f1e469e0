//! Persistence for user balances, processed orders and image projects.
//!
//! ## Design
//! - SQLite-backed (`rusqlite`), one connection behind a `parking_lot::Mutex`
//! - Balances change only through `credits = credits ± ?` statements
//! - Order idempotency via a primary-keyed `processed_orders` table written
//!   in the same transaction as the increment
//! - [`CreditStore`] is the seam the reconciler depends on, so tests can
//!   swap in an in-memory fake

pub mod sqlite;

pub use sqlite::{SqliteStore, User};

/// Errors raised by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No user record matches the given primary key.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// A user with this primary key already exists.
    #[error("user already exists: {0}")]
    UserExists(String),

    /// A debit would take the balance below zero.
    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: u32, available: i64 },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Identifies the external order behind a credit increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderRef<'a> {
    pub order_id: &'a str,
    pub product_id: &'a str,
}

/// Result of a credit increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Increment {
    /// The balance was incremented; carries the new balance.
    Applied { balance: i64 },
    /// The order was already recorded; nothing changed.
    AlreadyProcessed,
}

/// Balance operations the payment reconciler needs.
pub trait CreditStore: Send + Sync {
    /// Atomically add `amount` to the user's balance.
    ///
    /// When `order` is given, the order id is recorded in the same
    /// transaction and a repeated id yields [`Increment::AlreadyProcessed`].
    /// Fails with [`StoreError::UserNotFound`] when no user matches, leaving
    /// both the balance and the order ledger untouched.
    fn increment_credits(
        &self,
        user_id: &str,
        amount: u32,
        order: Option<OrderRef<'_>>,
    ) -> Result<Increment, StoreError>;

    /// Current balance, or `None` if the user does not exist.
    fn credit_balance(&self, user_id: &str) -> Result<Option<i64>, StoreError>;
}

/// Current epoch seconds.
pub(crate) fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
