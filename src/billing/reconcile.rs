//! Payment reconciliation: turn a paid order into a credit increment.
//!
//! Flow per `order.paid` delivery:
//! 1. Require an external customer id (the user's primary key)
//! 2. Resolve credits from the product catalog
//! 3. Apply one atomic increment through the [`CreditStore`]
//!
//! Failures are terminal for the invocation and never retried here; the
//! caller decides whether the billing provider should redeliver.

use super::catalog::ProductCatalog;
use crate::store::{CreditStore, Increment, OrderRef, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A completed payment reported by the billing provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaid {
    /// Provider order id. When present, redelivery is deduplicated.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Expected to equal a user's primary key.
    #[serde(default)]
    pub customer_external_id: Option<String>,
    pub product_id: String,
}

/// What to do with an order for a product the catalog does not know.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownProductPolicy {
    /// Log a warning and apply a zero-credit increment without recording
    /// the order id.
    #[default]
    Ignore,
    /// Fail with [`ReconcileError::UnknownProduct`].
    Reject,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("order has no external customer id")]
    MissingCustomerReference,

    #[error("no user matches external customer id {0}")]
    UserNotFound(String),

    #[error("product {0} is not in the catalog")]
    UnknownProduct(String),

    #[error("credit store failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UserNotFound(id) => Self::UserNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Result of a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Balance incremented (possibly by zero for an ignored product).
    Credited {
        user_id: String,
        credits: u32,
        balance: i64,
    },
    /// The order id was already processed; nothing changed.
    Duplicate { order_id: String },
}

/// Applies paid orders to user balances.
pub struct CreditReconciler {
    store: Arc<dyn CreditStore>,
    catalog: ProductCatalog,
    unknown_product: UnknownProductPolicy,
}

impl CreditReconciler {
    pub fn new(
        store: Arc<dyn CreditStore>,
        catalog: ProductCatalog,
        unknown_product: UnknownProductPolicy,
    ) -> Self {
        Self {
            store,
            catalog,
            unknown_product,
        }
    }

    pub fn catalog(&self) -> &ProductCatalog {
        &self.catalog
    }

    /// Credit the paying user for a completed order.
    pub fn on_order_paid(&self, order: &OrderPaid) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(user_id) = order
            .customer_external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            tracing::error!(
                order_id = order.order_id.as_deref().unwrap_or("-"),
                product_id = %order.product_id,
                "Paid order has no external customer id"
            );
            return Err(ReconcileError::MissingCustomerReference);
        };

        let known = self.catalog.credits_for(&order.product_id);
        let credits = match known {
            Some(credits) => credits,
            None => match self.unknown_product {
                UnknownProductPolicy::Ignore => {
                    tracing::warn!(
                        user_id,
                        product_id = %order.product_id,
                        "Paid order for unknown product; no credits granted"
                    );
                    0
                }
                UnknownProductPolicy::Reject => {
                    tracing::error!(
                        user_id,
                        product_id = %order.product_id,
                        "Paid order for unknown product rejected"
                    );
                    return Err(ReconcileError::UnknownProduct(order.product_id.clone()));
                }
            },
        };

        // Ignored orders stay unrecorded so a replay after a catalog fix still credits.
        let order_ref = known.and(order.order_id.as_deref()).map(|order_id| OrderRef {
            order_id,
            product_id: &order.product_id,
        });

        let increment = self
            .store
            .increment_credits(user_id, credits, order_ref)
            .map_err(|e| {
                tracing::error!(user_id, credits, "Credit increment failed: {e}");
                ReconcileError::from(e)
            })?;

        match increment {
            Increment::Applied { balance } => {
                tracing::info!(user_id, credits, balance, "Credits granted for paid order");
                Ok(ReconcileOutcome::Credited {
                    user_id: user_id.to_string(),
                    credits,
                    balance,
                })
            }
            Increment::AlreadyProcessed => {
                let order_id = order.order_id.clone().unwrap_or_default();
                tracing::info!(user_id, order_id = %order_id, "Duplicate paid order ignored");
                Ok(ReconcileOutcome::Duplicate { order_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::catalog::Product;
    use crate::store::SqliteStore;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    const SMALL: &str = "1abe9287-6989-4203-a36d-0ac1b62caa50";
    const MEDIUM: &str = "8b80fb8a-9ce8-4f1f-a17a-6c187e2f0571";
    const LARGE: &str = "e63b831e-76a9-4a65-9aae-ce415b2961cc";

    /// In-memory store that counts mutations.
    #[derive(Default)]
    struct FakeStore {
        balances: Mutex<HashMap<String, i64>>,
        orders: Mutex<HashSet<String>>,
        mutations: Mutex<usize>,
    }

    impl FakeStore {
        fn with_user(user_id: &str, balance: i64) -> Self {
            let store = Self::default();
            store.balances.lock().insert(user_id.to_string(), balance);
            store
        }

        fn mutations(&self) -> usize {
            *self.mutations.lock()
        }
    }

    impl CreditStore for FakeStore {
        fn increment_credits(
            &self,
            user_id: &str,
            amount: u32,
            order: Option<OrderRef<'_>>,
        ) -> Result<Increment, StoreError> {
            let mut balances = self.balances.lock();
            let Some(balance) = balances.get_mut(user_id) else {
                return Err(StoreError::UserNotFound(user_id.to_string()));
            };
            if let Some(order) = order {
                if !self.orders.lock().insert(order.order_id.to_string()) {
                    return Ok(Increment::AlreadyProcessed);
                }
            }
            *balance += i64::from(amount);
            *self.mutations.lock() += 1;
            Ok(Increment::Applied { balance: *balance })
        }

        fn credit_balance(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
            Ok(self.balances.lock().get(user_id).copied())
        }
    }

    fn order(customer: Option<&str>, product: &str) -> OrderPaid {
        OrderPaid {
            order_id: None,
            customer_external_id: customer.map(str::to_string),
            product_id: product.to_string(),
        }
    }

    fn reconciler(store: Arc<dyn CreditStore>) -> CreditReconciler {
        CreditReconciler::new(store, ProductCatalog::default(), UnknownProductPolicy::Ignore)
    }

    #[test]
    fn each_known_product_grants_its_credits() {
        for (product, credits) in [(SMALL, 50), (MEDIUM, 200), (LARGE, 400)] {
            let store = Arc::new(FakeStore::with_user("u1", 7));
            let outcome = reconciler(store.clone())
                .on_order_paid(&order(Some("u1"), product))
                .unwrap();
            assert_eq!(
                outcome,
                ReconcileOutcome::Credited {
                    user_id: "u1".into(),
                    credits,
                    balance: 7 + i64::from(credits),
                }
            );
            assert_eq!(store.credit_balance("u1").unwrap(), Some(7 + i64::from(credits)));
        }
    }

    #[test]
    fn unknown_product_leaves_balance_unchanged_under_ignore_policy() {
        // Documented gap: unrecognised products are a no-op, not an error.
        let store = Arc::new(FakeStore::with_user("u1", 100));
        let outcome = reconciler(store.clone())
            .on_order_paid(&order(Some("u1"), "not-a-product"))
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Credited {
                user_id: "u1".into(),
                credits: 0,
                balance: 100,
            }
        );
        assert_eq!(store.credit_balance("u1").unwrap(), Some(100));
    }

    #[test]
    fn ignored_order_is_credited_once_catalog_learns_the_product() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.create_user("u1", None, None, 0).unwrap();
        let paid = OrderPaid {
            order_id: Some("ord_9".into()),
            customer_external_id: Some("u1".into()),
            product_id: "new-pack".into(),
        };

        let before = reconciler(store.clone()).on_order_paid(&paid).unwrap();
        assert!(matches!(before, ReconcileOutcome::Credited { credits: 0, balance: 0, .. }));

        let mut products = crate::billing::catalog::default_products();
        products.push(Product {
            id: "new-pack".into(),
            slug: "huge".into(),
            credits: 1000,
        });
        let updated = CreditReconciler::new(
            store.clone(),
            ProductCatalog::new(products).unwrap(),
            UnknownProductPolicy::Ignore,
        );
        let after = updated.on_order_paid(&paid).unwrap();
        assert_eq!(
            after,
            ReconcileOutcome::Credited {
                user_id: "u1".into(),
                credits: 1000,
                balance: 1000,
            }
        );

        assert!(matches!(
            updated.on_order_paid(&paid).unwrap(),
            ReconcileOutcome::Duplicate { .. }
        ));
        assert_eq!(store.credit_balance("u1").unwrap(), Some(1000));
    }

    #[test]
    fn unknown_product_is_rejected_under_reject_policy() {
        let store = Arc::new(FakeStore::with_user("u1", 100));
        let reconciler = CreditReconciler::new(
            store.clone(),
            ProductCatalog::default(),
            UnknownProductPolicy::Reject,
        );
        let err = reconciler
            .on_order_paid(&order(Some("u1"), "not-a-product"))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownProduct(p) if p == "not-a-product"));
        assert_eq!(store.mutations(), 0);
    }

    #[test]
    fn missing_customer_id_fails_without_mutation() {
        let store = Arc::new(FakeStore::with_user("u1", 0));
        let reconciler = reconciler(store.clone());

        for customer in [None, Some(""), Some("   ")] {
            let err = reconciler
                .on_order_paid(&order(customer, MEDIUM))
                .unwrap_err();
            assert!(matches!(err, ReconcileError::MissingCustomerReference));
        }
        assert_eq!(store.mutations(), 0);
        assert_eq!(store.credit_balance("u1").unwrap(), Some(0));
    }

    #[test]
    fn nonexistent_user_fails_without_mutation() {
        let store = Arc::new(FakeStore::with_user("u1", 0));
        let err = reconciler(store.clone())
            .on_order_paid(&order(Some("ghost"), MEDIUM))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::UserNotFound(id) if id == "ghost"));
        assert_eq!(store.mutations(), 0);
    }

    #[test]
    fn redelivery_without_order_id_credits_twice() {
        // Known gap: with no order id there is nothing to deduplicate on.
        let store = Arc::new(FakeStore::with_user("u1", 0));
        let reconciler = reconciler(store.clone());
        let event = order(Some("u1"), MEDIUM);

        reconciler.on_order_paid(&event).unwrap();
        assert_eq!(store.credit_balance("u1").unwrap(), Some(200));
        reconciler.on_order_paid(&event).unwrap();
        assert_eq!(store.credit_balance("u1").unwrap(), Some(400));
    }

    #[test]
    fn redelivery_with_order_id_is_a_successful_noop() {
        let store = Arc::new(FakeStore::with_user("u1", 0));
        let reconciler = reconciler(store.clone());
        let event = OrderPaid {
            order_id: Some("ord_123".into()),
            ..order(Some("u1"), MEDIUM)
        };

        reconciler.on_order_paid(&event).unwrap();
        let second = reconciler.on_order_paid(&event).unwrap();
        assert_eq!(
            second,
            ReconcileOutcome::Duplicate {
                order_id: "ord_123".into()
            }
        );
        assert_eq!(store.credit_balance("u1").unwrap(), Some(200));
        assert_eq!(store.mutations(), 1);
    }

    #[test]
    fn customer_id_is_trimmed() {
        let store = Arc::new(FakeStore::with_user("u1", 0));
        reconciler(store.clone())
            .on_order_paid(&order(Some(" u1 "), SMALL))
            .unwrap();
        assert_eq!(store.credit_balance("u1").unwrap(), Some(50));
    }

    #[test]
    fn concurrent_orders_against_sqlite_do_not_lose_updates() {
        let sqlite = SqliteStore::open_in_memory().unwrap();
        sqlite.create_user("u1", None, None, 0).unwrap();
        let store: Arc<SqliteStore> = Arc::new(sqlite);
        let reconciler = Arc::new(reconciler(store.clone()));

        let handles: Vec<_> = [SMALL, MEDIUM]
            .into_iter()
            .map(|product| {
                let reconciler = Arc::clone(&reconciler);
                std::thread::spawn(move || {
                    reconciler
                        .on_order_paid(&order(Some("u1"), product))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.credit_balance("u1").unwrap(), Some(250));
    }

    #[test]
    fn order_paid_deserializes_with_optional_fields() {
        let parsed: OrderPaid =
            serde_json::from_str(r#"{"product_id": "p"}"#).unwrap();
        assert!(parsed.order_id.is_none());
        assert!(parsed.customer_external_id.is_none());
    }
}
