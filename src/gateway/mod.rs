//! Outbound payment-processor seam.
//!
//! The engine talks to the processor only through `PaymentGateway`. Amounts
//! cross this boundary in integer minor units (cents). Every mutating call
//! carries an idempotency key; the processor must return the original result
//! when it sees a key again.

pub mod sandbox;

pub use sandbox::{GatewayOp, SandboxGateway};

use crate::error::{Error, Result};
use crate::state::BillingInterval;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Processor transaction the money goes back to.
    pub payment_reference: String,
    pub amount_minor: i64,
    pub currency: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub id: String,
    pub amount_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRequest {
    pub product_name: String,
    pub amount_minor: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub interval_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPrice {
    pub id: String,
    pub product_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub trial_days: u32,
    /// Seeded onto the customer balance before the first invoice.
    pub credit_amount_minor: i64,
    pub currency: String,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSubscription {
    pub id: String,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
}

/// Request/response contract of the payment processor.
///
/// Failures surface as `Error::ExternalService`; nothing local is written by
/// an implementation.
pub trait PaymentGateway: Send + Sync {
    fn gateway_id(&self) -> &'static str;

    fn create_refund(&self, request: &RefundRequest) -> Result<RefundReceipt>;

    /// Reuse the processor's customer for `email` or create one.
    fn find_or_create_customer(&self, email: &str, name: Option<&str>) -> Result<Customer>;

    /// Register a recurring price for a continuity plan.
    fn create_price(&self, request: &PriceRequest) -> Result<ExternalPrice>;

    fn create_subscription(&self, request: &SubscriptionRequest) -> Result<ExternalSubscription>;
}

/// Reject a processor response that carries no usable id.
pub fn require_id(gateway: &str, what: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::ExternalService(format!(
            "{} returned no {} id",
            gateway, what
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_id() {
        assert!(require_id("sandbox", "refund", "re_1").is_ok());
        let err = require_id("sandbox", "refund", "  ").unwrap_err();
        assert_eq!(
            err,
            Error::ExternalService("sandbox returned no refund id".to_string())
        );
    }
}
