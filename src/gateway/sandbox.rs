use crate::error::{Error, Result};
use crate::gateway::{
    Customer, ExternalPrice, ExternalSubscription, PaymentGateway, PriceRequest, RefundReceipt,
    RefundRequest, SubscriptionRequest,
};
use crate::state::BillingInterval;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Gateway operations that can be forced to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOp {
    Refund,
    Customer,
    Price,
    Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRefund {
    pub id: String,
    pub payment_reference: String,
    pub amount_minor: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxCustomer {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    /// Negative means credit owed to the customer.
    pub balance_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPrice {
    pub id: String,
    pub product_id: String,
    pub product_name: String,
    pub amount_minor: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub interval_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSubscription {
    pub id: String,
    pub customer_id: String,
    pub price_id: String,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

/// What an idempotency key was first used for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum IdempotentCall {
    Refund {
        fingerprint: String,
        refund_id: String,
    },
    Subscription {
        fingerprint: String,
        subscription_id: String,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SandboxBook {
    next_object: u64,
    refunds: BTreeMap<String, SandboxRefund>,
    customers: BTreeMap<String, SandboxCustomer>,
    prices: BTreeMap<String, SandboxPrice>,
    subscriptions: BTreeMap<String, SandboxSubscription>,
    idempotency: BTreeMap<String, IdempotentCall>,
    #[serde(skip)]
    fail_next: Option<GatewayOp>,
}

impl SandboxBook {
    fn object_id(&mut self, prefix: &str) -> String {
        self.next_object += 1;
        format!("{}_{:06}", prefix, self.next_object)
    }

    fn check_failure(&mut self, op: GatewayOp) -> Result<()> {
        if self.fail_next == Some(op) {
            self.fail_next = None;
            return Err(Error::ExternalService(format!(
                "sandbox: forced {:?} failure",
                op
            )));
        }
        Ok(())
    }
}

/// Deterministic in-process processor.
///
/// Object ids are sequential (`re_000001`, `cus_000002`, ...). With a backing
/// path the whole book is rewritten as JSON after every successful call.
pub struct SandboxGateway {
    book: Mutex<SandboxBook>,
    path: Option<PathBuf>,
}

impl Default for SandboxGateway {
    fn default() -> Self {
        SandboxGateway::new()
    }
}

impl SandboxGateway {
    /// Memory-only sandbox.
    pub fn new() -> Self {
        SandboxGateway {
            book: Mutex::new(SandboxBook::default()),
            path: None,
        }
    }

    /// Sandbox backed by a JSON file, created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let book = if path.exists() {
            let data = fs::read_to_string(&path)
                .map_err(|e| Error::Storage(format!("Failed to read gateway ledger: {}", e)))?;
            serde_json::from_str(&data)
                .map_err(|e| Error::Storage(format!("Failed to parse gateway ledger: {}", e)))?
        } else {
            SandboxBook::default()
        };
        Ok(SandboxGateway {
            book: Mutex::new(book),
            path: Some(path),
        })
    }

    /// Make the next call of `op` fail with an external-service error.
    pub fn fail_next(&self, op: GatewayOp) {
        self.book.lock().fail_next = Some(op);
    }

    pub fn refunds(&self) -> Vec<SandboxRefund> {
        self.book.lock().refunds.values().cloned().collect()
    }

    pub fn subscriptions(&self) -> Vec<SandboxSubscription> {
        self.book.lock().subscriptions.values().cloned().collect()
    }

    pub fn customer(&self, id: &str) -> Option<SandboxCustomer> {
        self.book.lock().customers.get(id).cloned()
    }

    fn persist(&self, book: &SandboxBook) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_json(path, book)
    }
}

fn write_json(path: &Path, book: &SandboxBook) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;
    }
    let json = serde_json::to_string_pretty(book)
        .map_err(|e| Error::Storage(format!("Failed to serialize gateway ledger: {}", e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)
        .map_err(|e| Error::Storage(format!("Failed to write gateway ledger: {}", e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Storage(format!("Failed to rename gateway ledger: {}", e)))?;
    Ok(())
}

fn refund_fingerprint(request: &RefundRequest) -> String {
    format!(
        "{}:{}:{}",
        request.payment_reference, request.amount_minor, request.currency
    )
}

fn subscription_fingerprint(request: &SubscriptionRequest) -> String {
    format!(
        "{}:{}:{}:{}",
        request.customer_id, request.price_id, request.trial_days, request.credit_amount_minor
    )
}

fn key_reused(key: &str) -> Error {
    Error::ExternalService(format!(
        "sandbox: idempotency key {} was used with different parameters",
        key
    ))
}

impl PaymentGateway for SandboxGateway {
    fn gateway_id(&self) -> &'static str {
        "sandbox"
    }

    fn create_refund(&self, request: &RefundRequest) -> Result<RefundReceipt> {
        let mut book = self.book.lock();
        book.check_failure(GatewayOp::Refund)?;

        let fingerprint = refund_fingerprint(request);
        if let Some(previous) = book.idempotency.get(&request.idempotency_key) {
            return match previous {
                IdempotentCall::Refund {
                    fingerprint: seen,
                    refund_id,
                } if *seen == fingerprint => {
                    let refund = book.refunds.get(refund_id).ok_or_else(|| {
                        Error::ExternalService(format!("sandbox: refund {} vanished", refund_id))
                    })?;
                    tracing::debug!(refund_id = %refund.id, "sandbox refund replayed");
                    Ok(RefundReceipt {
                        id: refund.id.clone(),
                        amount_minor: refund.amount_minor,
                    })
                }
                _ => Err(key_reused(&request.idempotency_key)),
            };
        }

        if request.payment_reference.trim().is_empty() {
            return Err(Error::ExternalService(
                "sandbox: refund requires a payment reference".to_string(),
            ));
        }
        if request.amount_minor <= 0 {
            return Err(Error::ExternalService(format!(
                "sandbox: refund amount must be positive, got {}",
                request.amount_minor
            )));
        }

        let id = book.object_id("re");
        book.refunds.insert(
            id.clone(),
            SandboxRefund {
                id: id.clone(),
                payment_reference: request.payment_reference.clone(),
                amount_minor: request.amount_minor,
                currency: request.currency.clone(),
                created_at: Utc::now(),
            },
        );
        book.idempotency.insert(
            request.idempotency_key.clone(),
            IdempotentCall::Refund {
                fingerprint,
                refund_id: id.clone(),
            },
        );
        self.persist(&book)?;
        Ok(RefundReceipt {
            id,
            amount_minor: request.amount_minor,
        })
    }

    fn find_or_create_customer(&self, email: &str, name: Option<&str>) -> Result<Customer> {
        let mut book = self.book.lock();
        book.check_failure(GatewayOp::Customer)?;

        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(Error::ExternalService(
                "sandbox: customer email is required".to_string(),
            ));
        }
        if let Some(existing) = book.customers.values().find(|c| c.email == email) {
            return Ok(Customer {
                id: existing.id.clone(),
                email: existing.email.clone(),
            });
        }

        let id = book.object_id("cus");
        book.customers.insert(
            id.clone(),
            SandboxCustomer {
                id: id.clone(),
                email: email.clone(),
                name: name.map(str::to_string),
                balance_minor: 0,
            },
        );
        self.persist(&book)?;
        Ok(Customer { id, email })
    }

    fn create_price(&self, request: &PriceRequest) -> Result<ExternalPrice> {
        let mut book = self.book.lock();
        book.check_failure(GatewayOp::Price)?;

        if request.amount_minor < 0 {
            return Err(Error::ExternalService(
                "sandbox: price amount cannot be negative".to_string(),
            ));
        }
        let product_id = book.object_id("prod");
        let id = book.object_id("price");
        book.prices.insert(
            id.clone(),
            SandboxPrice {
                id: id.clone(),
                product_id: product_id.clone(),
                product_name: request.product_name.clone(),
                amount_minor: request.amount_minor,
                currency: request.currency.clone(),
                interval: request.interval,
                interval_count: request.interval_count,
            },
        );
        self.persist(&book)?;
        Ok(ExternalPrice { id, product_id })
    }

    fn create_subscription(&self, request: &SubscriptionRequest) -> Result<ExternalSubscription> {
        let mut book = self.book.lock();
        book.check_failure(GatewayOp::Subscription)?;

        let fingerprint = subscription_fingerprint(request);
        if let Some(previous) = book.idempotency.get(&request.idempotency_key) {
            return match previous {
                IdempotentCall::Subscription {
                    fingerprint: seen,
                    subscription_id,
                } if *seen == fingerprint => {
                    let sub = book.subscriptions.get(subscription_id).ok_or_else(|| {
                        Error::ExternalService(format!(
                            "sandbox: subscription {} vanished",
                            subscription_id
                        ))
                    })?;
                    tracing::debug!(subscription_id = %sub.id, "sandbox subscription replayed");
                    Ok(ExternalSubscription {
                        id: sub.id.clone(),
                        status: sub.status.clone(),
                        current_period_start: sub.current_period_start,
                        current_period_end: sub.current_period_end,
                    })
                }
                _ => Err(key_reused(&request.idempotency_key)),
            };
        }

        let price = book.prices.get(&request.price_id).cloned().ok_or_else(|| {
            Error::ExternalService(format!("sandbox: no such price {}", request.price_id))
        })?;
        if !book.customers.contains_key(&request.customer_id) {
            return Err(Error::ExternalService(format!(
                "sandbox: no such customer {}",
                request.customer_id
            )));
        }

        let start = Utc::now();
        let (status, end) = if request.trial_days > 0 {
            (
                "trialing",
                start + Duration::days(i64::from(request.trial_days)),
            )
        } else {
            ("active", price.interval.advance(start, price.interval_count))
        };

        if request.credit_amount_minor > 0 {
            if let Some(customer) = book.customers.get_mut(&request.customer_id) {
                customer.balance_minor -= request.credit_amount_minor;
            }
        }

        let id = book.object_id("sub");
        book.subscriptions.insert(
            id.clone(),
            SandboxSubscription {
                id: id.clone(),
                customer_id: request.customer_id.clone(),
                price_id: request.price_id.clone(),
                status: status.to_string(),
                current_period_start: start,
                current_period_end: end,
                metadata: request.metadata.clone(),
            },
        );
        book.idempotency.insert(
            request.idempotency_key.clone(),
            IdempotentCall::Subscription {
                fingerprint,
                subscription_id: id.clone(),
            },
        );
        self.persist(&book)?;
        Ok(ExternalSubscription {
            id,
            status: status.to_string(),
            current_period_start: start,
            current_period_end: end,
        })
    }
}
