//! Billing: turns Polar payments into account credits.
//!
//! ## Design
//! - Fixed product catalog (product id → credits), overridable in config
//! - Polar `order.paid` deliveries verified with Standard Webhooks signatures
//! - One atomic balance increment per paid order, deduplicated by order id
//! - Store handle is injected; no process-wide clients

pub mod catalog;
pub mod polar;
pub mod reconcile;

pub use catalog::{Product, ProductCatalog};
pub use polar::{decode_event, verify_signature, SignatureError, SignedHeaders, WebhookEvent};
pub use reconcile::{
    CreditReconciler, OrderPaid, ReconcileError, ReconcileOutcome, UnknownProductPolicy,
};
