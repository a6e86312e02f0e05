use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use transita_core::gateway::{
    sign_webhook, verify_webhook, GatewayError, GatewayResult, GatewayStatus, InitiatePayment, PaymentGateway,
    PaymentLink, RefundReceipt, TransactionStatus, Verification,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxCharge {
    pub transaction_id: String,
    pub reference: String,
    pub amount: i64,
    pub currency: String,
    pub status: GatewayStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub refund_id: Option<String>,
}

/// In-process provider with no network behind it. Charges start pending
/// and move only when [`SandboxGateway::settle`] is called, which is how
/// development setups and tests play the customer's side.
pub struct SandboxGateway {
    webhook_secret: String,
    charges: Mutex<HashMap<String, SandboxCharge>>,
    injected: Mutex<VecDeque<GatewayError>>,
    latency: Mutex<Option<Duration>>,
    refunds_settle_immediately: AtomicBool,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SandboxGateway {
    pub fn new(webhook_secret: &str) -> Self {
        Self {
            webhook_secret: webhook_secret.to_string(),
            charges: Mutex::new(HashMap::new()),
            injected: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            refunds_settle_immediately: AtomicBool::new(true),
        }
    }

    /// The next call fails with `err` instead of running.
    pub fn fail_next(&self, err: GatewayError) {
        guard(&self.injected).push_back(err);
    }

    pub fn set_latency(&self, latency: Duration) {
        *guard(&self.latency) = Some(latency);
    }

    /// When false, refunds are acknowledged as pending until settled.
    pub fn set_refunds_settle_immediately(&self, immediate: bool) {
        self.refunds_settle_immediately.store(immediate, Ordering::SeqCst);
    }

    /// Records a charge the customer made outside our initiate flow and
    /// returns its transaction id.
    pub fn register_charge(&self, reference: &str, amount: i64, currency: &str, status: GatewayStatus) -> String {
        let transaction_id = format!("sbx_{}", Uuid::new_v4().simple());
        let paid_at = (status == GatewayStatus::Successful).then(Utc::now);
        guard(&self.charges).insert(
            transaction_id.clone(),
            SandboxCharge {
                transaction_id: transaction_id.clone(),
                reference: reference.to_string(),
                amount,
                currency: currency.to_string(),
                status,
                paid_at,
                failure_reason: None,
                refund_id: None,
            },
        );
        transaction_id
    }

    /// Moves a charge, found by transaction id or reference, to `status`.
    pub fn settle(&self, id_or_reference: &str, status: GatewayStatus) -> bool {
        let mut charges = guard(&self.charges);
        let charge = charges
            .values_mut()
            .find(|c| c.transaction_id == id_or_reference || c.reference == id_or_reference);
        match charge {
            Some(charge) => {
                if status == GatewayStatus::Successful {
                    charge.paid_at = Some(Utc::now());
                }
                if status == GatewayStatus::Failed {
                    charge.failure_reason = Some("declined by issuer".to_string());
                }
                charge.status = status;
                true
            }
            None => false,
        }
    }

    pub fn charge(&self, id_or_reference: &str) -> Option<SandboxCharge> {
        guard(&self.charges)
            .values()
            .find(|c| c.transaction_id == id_or_reference || c.reference == id_or_reference)
            .cloned()
    }

    /// Signs `body` the way the provider signs its webhooks.
    pub fn sign(&self, body: &[u8]) -> String {
        sign_webhook(&self.webhook_secret, body)
    }

    async fn before_call(&self) -> GatewayResult<()> {
        let latency = *guard(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match guard(&self.injected).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    fn name(&self) -> &str {
        "sandbox"
    }

    async fn initiate(&self, request: &InitiatePayment) -> GatewayResult<PaymentLink> {
        self.before_call().await?;
        if request.amount <= 0 {
            return Err(GatewayError::Rejected(format!("invalid amount {}", request.amount)));
        }
        let transaction_id = self.register_charge(&request.reference, request.amount, &request.currency, GatewayStatus::Pending);
        Ok(PaymentLink {
            payment_link: format!("https://sandbox.transita.local/pay/{}", transaction_id),
            transaction_id,
            reference: request.reference.clone(),
        })
    }

    async fn verify(&self, reference: &str, transaction_id: Option<&str>) -> GatewayResult<Verification> {
        self.before_call().await?;
        let charge = match transaction_id {
            Some(id) => self.charge(id),
            None => self.charge(reference),
        };
        Ok(match charge {
            Some(c) => Verification {
                success: c.status == GatewayStatus::Successful,
                status: c.status,
                transaction_id: Some(c.transaction_id),
                amount: c.amount,
                currency: c.currency,
                paid_at: c.paid_at,
            },
            None => Verification {
                success: false,
                status: GatewayStatus::NotFound,
                transaction_id: None,
                amount: 0,
                currency: String::new(),
                paid_at: None,
            },
        })
    }

    async fn refund(&self, transaction_id: &str, amount: Option<i64>, _reason: Option<&str>) -> GatewayResult<RefundReceipt> {
        self.before_call().await?;
        let immediate = self.refunds_settle_immediately.load(Ordering::SeqCst);
        let mut charges = guard(&self.charges);
        let charge = charges
            .get_mut(transaction_id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown transaction {}", transaction_id)))?;
        if charge.status != GatewayStatus::Successful {
            return Err(GatewayError::Rejected(format!("transaction {} is not refundable", transaction_id)));
        }
        if amount.is_some_and(|a| a <= 0 || a > charge.amount) {
            return Err(GatewayError::Rejected("refund amount out of range".to_string()));
        }

        let refund_id = format!("rf_{}", Uuid::new_v4().simple());
        charge.refund_id = Some(refund_id.clone());
        let status = if immediate {
            charge.status = GatewayStatus::Refunded;
            GatewayStatus::Refunded
        } else {
            GatewayStatus::Pending
        };
        Ok(RefundReceipt { refund_id, status })
    }

    async fn get_status(&self, transaction_id: &str) -> GatewayResult<TransactionStatus> {
        self.before_call().await?;
        Ok(match self.charge(transaction_id) {
            Some(c) => TransactionStatus {
                status: c.status,
                amount: c.amount,
                failure_reason: c.failure_reason,
            },
            None => TransactionStatus {
                status: GatewayStatus::NotFound,
                amount: 0,
                failure_reason: None,
            },
        })
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], signature: Option<&str>) -> bool {
        verify_webhook(&self.webhook_secret, raw_body, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transita_core::gateway::Customer;
    use transita_shared::Masked;

    fn request(amount: i64) -> InitiatePayment {
        InitiatePayment {
            amount,
            currency: "NGN".to_string(),
            reference: "TRN-abc".to_string(),
            customer: Customer {
                name: "Ada Obi".to_string(),
                email: Masked::new("ada@example.com".to_string()),
                phone: None,
            },
            redirect_url: "https://example.com/return".to_string(),
            callback_url: "https://example.com/webhook".to_string(),
        }
    }

    #[tokio::test]
    async fn test_charge_lifecycle() {
        let gateway = SandboxGateway::new("whsec");
        let link = gateway.initiate(&request(5_000)).await.unwrap();
        assert!(link.payment_link.ends_with(&link.transaction_id));

        let pending = gateway.verify("TRN-abc", None).await.unwrap();
        assert_eq!(pending.status, GatewayStatus::Pending);
        assert!(!pending.success);

        assert!(gateway.settle("TRN-abc", GatewayStatus::Successful));
        let paid = gateway.verify("TRN-abc", Some(&link.transaction_id)).await.unwrap();
        assert!(paid.success);
        assert!(paid.paid_at.is_some());

        let receipt = gateway.refund(&link.transaction_id, None, Some("cancelled")).await.unwrap();
        assert_eq!(receipt.status, GatewayStatus::Refunded);
        assert!(gateway.refund(&link.transaction_id, None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_transactions_report_not_found() {
        let gateway = SandboxGateway::new("whsec");
        assert_eq!(gateway.get_status("nope").await.unwrap().status, GatewayStatus::NotFound);
        assert_eq!(gateway.verify("TRN-none", None).await.unwrap().status, GatewayStatus::NotFound);
        assert!(matches!(gateway.initiate(&request(0)).await, Err(GatewayError::Rejected(_))));
    }

    #[test]
    fn test_signature_round_trip() {
        let gateway = SandboxGateway::new("whsec");
        let body = br#"{"event":"charge.completed"}"#;
        assert!(gateway.verify_webhook_signature(body, Some(&gateway.sign(body))));
        assert!(!gateway.verify_webhook_signature(body, Some("deadbeef")));
        assert!(!gateway.verify_webhook_signature(body, None));
    }
}
