use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use transita_core::gateway::{
    GatewayError, GatewayResult, InitiatePayment, PaymentGateway, PaymentLink, RefundReceipt, TransactionStatus,
    Verification,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    pub name: String,
    state: RwLock<CircuitState>,
    failure_count: AtomicUsize,
    failure_threshold: usize,
    reset_timeout: Duration,
    last_failure: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: &str, threshold: usize, reset_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicUsize::new(0),
            failure_threshold: threshold.max(1),
            reset_timeout,
            last_failure: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Whether a call may go through now. An open circuit turns half-open
    /// once `reset_timeout` has passed since the last failure.
    pub async fn check(&self) -> bool {
        let state = *self.state.read().await;
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let last_fail = *self.last_failure.read().await;
                match last_fail {
                    Some(instant) if instant.elapsed() >= self.reset_timeout => {
                        *self.state.write().await = CircuitState::HalfOpen;
                        tracing::info!("Circuit breaker [{}] moving to half-open", self.name);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        if *state == CircuitState::HalfOpen {
            tracing::info!("Circuit breaker [{}] recovered to closed", self.name);
        }
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
    }

    pub async fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.write().await;

        if count >= self.failure_threshold || *state == CircuitState::HalfOpen {
            *state = CircuitState::Open;
            *self.last_failure.write().await = Some(Instant::now());
            tracing::error!("Circuit breaker [{}] tripped to open after {} failures", self.name, count);
        }
    }
}

/// Wraps a provider with a per-call timeout and a circuit breaker.
///
/// Timeouts and transport faults count as failures; a `Rejected` answer
/// proves the provider is up and counts as a success.
pub struct GuardedGateway {
    inner: Arc<dyn PaymentGateway>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl GuardedGateway {
    pub fn new(inner: Arc<dyn PaymentGateway>, threshold: usize, reset_timeout: Duration, timeout: Duration) -> Self {
        let breaker = CircuitBreaker::new(inner.name(), threshold, reset_timeout);
        Self { inner, breaker, timeout }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn call<T, Fut>(&self, fut: Fut) -> GatewayResult<T>
    where
        Fut: Future<Output = GatewayResult<T>>,
    {
        if !self.breaker.check().await {
            return Err(GatewayError::Unavailable(format!("circuit [{}] is open", self.breaker.name)));
        }

        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };

        match &result {
            Ok(_) | Err(GatewayError::Rejected(_)) => self.breaker.record_success().await,
            Err(_) => self.breaker.record_failure().await,
        }
        result
    }
}

#[async_trait]
impl PaymentGateway for GuardedGateway {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn initiate(&self, request: &InitiatePayment) -> GatewayResult<PaymentLink> {
        self.call(self.inner.initiate(request)).await
    }

    async fn verify(&self, reference: &str, transaction_id: Option<&str>) -> GatewayResult<Verification> {
        self.call(self.inner.verify(reference, transaction_id)).await
    }

    async fn refund(&self, transaction_id: &str, amount: Option<i64>, reason: Option<&str>) -> GatewayResult<RefundReceipt> {
        self.call(self.inner.refund(transaction_id, amount, reason)).await
    }

    async fn get_status(&self, transaction_id: &str) -> GatewayResult<TransactionStatus> {
        self.call(self.inner.get_status(transaction_id)).await
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], signature: Option<&str>) -> bool {
        self.inner.verify_webhook_signature(raw_body, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sandbox::SandboxGateway;

    #[tokio::test]
    async fn test_breaker_opens_then_recovers() {
        let breaker = CircuitBreaker::new("test", 2, Duration::from_millis(20));
        assert!(breaker.check().await);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.check().await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.check().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(10));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.check().await);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out_and_trips() {
        let sandbox = Arc::new(SandboxGateway::new("whsec"));
        sandbox.set_latency(Duration::from_millis(200));
        let guarded = GuardedGateway::new(sandbox, 1, Duration::from_secs(60), Duration::from_millis(20));

        let err = guarded.get_status("tx-1").await.unwrap_err();
        assert_eq!(err, GatewayError::Timeout);
        assert!(err.is_ambiguous());

        let err = guarded.get_status("tx-1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_rejection_does_not_trip() {
        let sandbox = Arc::new(SandboxGateway::new("whsec"));
        let guarded = GuardedGateway::new(sandbox.clone(), 1, Duration::from_secs(60), Duration::from_secs(1));

        sandbox.fail_next(GatewayError::Rejected("invalid amount".to_string()));
        assert!(matches!(guarded.refund("tx", None, None).await, Err(GatewayError::Rejected(_))));
        assert_eq!(guarded.breaker().state().await, CircuitState::Closed);
    }
}
