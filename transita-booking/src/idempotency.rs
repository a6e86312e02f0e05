use chrono::Duration;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use transita_core::idempotency::{request_hash, IdempotencyRecord, IdempotencyStatus};
use transita_core::repository::IdempotencyRepository;
use transita_core::{Clock, CoreError, CoreResult};

const MAX_KEY_LEN: usize = 255;

/// Runs a mutation at most once per `(key, actor)` and replays its result.
#[derive(Clone)]
pub struct IdempotencyGuard {
    repo: Arc<dyn IdempotencyRepository>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(repo: Arc<dyn IdempotencyRepository>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { repo, clock, ttl }
    }

    /// A SUCCESS record replays its stored response without calling
    /// `handler`. A PENDING record means another attempt is in flight. A
    /// FAILED or expired record is discarded and the request runs fresh.
    /// Reusing a key for a different payload is rejected outright.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        actor_id: &str,
        method: &str,
        endpoint: &str,
        payload: &Value,
        handler: F,
    ) -> CoreResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<Value>>,
    {
        let key = key.trim();
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(CoreError::ValidationError(format!(
                "idempotency key must be 1-{} characters",
                MAX_KEY_LEN
            )));
        }
        let hash = request_hash(method, endpoint, payload);

        // Second pass only happens when a concurrent insert beat ours, so
        // the re-read sees that request's record.
        let mut claimed = false;
        for _ in 0..2 {
            let now = self.clock.now();
            if let Some(existing) = self.repo.get_record(key, actor_id).await? {
                if existing.status == IdempotencyStatus::Failed || existing.is_expired(now) {
                    self.repo.remove_stale(key, actor_id, now).await?;
                } else if existing.request_hash != hash {
                    return Err(CoreError::ValidationError(
                        "idempotency key was already used with a different request payload".to_string(),
                    ));
                } else if existing.status == IdempotencyStatus::Success {
                    debug!(key, actor_id, "replaying stored response");
                    return Ok(existing.response_data.unwrap_or(Value::Null));
                } else {
                    return Err(CoreError::Conflict("request in progress".to_string()));
                }
            }

            let record = IdempotencyRecord::pending(key, actor_id, method, endpoint, hash.clone(), now + self.ttl, now);
            if self.repo.insert_pending(&record).await? {
                claimed = true;
                break;
            }
        }
        if !claimed {
            return Err(CoreError::Conflict("request in progress".to_string()));
        }

        match handler().await {
            Ok(response) => {
                if let Err(e) = self
                    .repo
                    .complete(key, actor_id, IdempotencyStatus::Success, Some(&response), None, self.clock.now())
                    .await
                {
                    // The work is done; the record ages out and a retry re-runs.
                    warn!(key, actor_id, "failed to store idempotent response: {}", e);
                }
                Ok(response)
            }
            Err(err) => {
                let stored = self
                    .repo
                    .complete(key, actor_id, IdempotencyStatus::Failed, None, Some(&err.to_string()), self.clock.now())
                    .await;
                if let Err(e) = stored {
                    warn!(key, actor_id, "failed to record idempotent failure: {}", e);
                }
                Err(err)
            }
        }
    }

    /// Deletes up to `limit` records past their expiry.
    pub async fn purge_expired(&self, limit: i64) -> CoreResult<u64> {
        self.repo.purge_expired(self.clock.now(), limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use transita_core::ManualClock;
    use transita_store::MemoryStore;

    fn guard() -> (IdempotencyGuard, Arc<ManualClock>) {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        (IdempotencyGuard::new(store, clock.clone(), Duration::hours(24)), clock)
    }

    #[tokio::test]
    async fn test_replay_runs_handler_once() {
        let (guard, _) = guard();
        let calls = AtomicUsize::new(0);
        let payload = json!({"lock_id": "l-1"});

        let run = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"pnr": "X1"}))
        };
        let first = guard.execute("k", "actor", "POST", "/v1/bookings/confirm", &payload, run).await.unwrap();
        let second = guard.execute("k", "actor", "POST", "/v1/bookings/confirm", &payload, run).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_payload_is_rejected_without_running() {
        let (guard, _) = guard();
        guard
            .execute("k", "actor", "POST", "/confirm", &json!({"n": 1}), || async { Ok(json!(1)) })
            .await
            .unwrap();

        let calls = AtomicUsize::new(0);
        let err = guard
            .execute("k", "actor", "POST", "/confirm", &json!({"n": 2}), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(2))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::ValidationError(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_keys_are_scoped_per_actor() {
        let (guard, _) = guard();
        let a = guard.execute("k", "actor-a", "POST", "/e", &json!({"n": 1}), || async { Ok(json!("a")) }).await;
        let b = guard.execute("k", "actor-b", "POST", "/e", &json!({"n": 2}), || async { Ok(json!("b")) }).await;
        assert_eq!(a.unwrap(), json!("a"));
        assert_eq!(b.unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let (guard, _) = guard();
        let payload = json!({"n": 1});

        let err = guard
            .execute("k", "actor", "POST", "/e", &payload, || async {
                Err::<Value, _>(CoreError::PaymentError("declined".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PaymentError(_)));

        let retried = guard.execute("k", "actor", "POST", "/e", &payload, || async { Ok(json!("ok")) }).await;
        assert_eq!(retried.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_in_flight_request_conflicts() {
        let (guard, _) = guard();
        let payload = json!({"n": 1});
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = {
            let guard = guard.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                guard
                    .execute("k", "actor", "POST", "/e", &payload, || async move {
                        let _ = started_tx.send(());
                        let _ = finish_rx.await;
                        Ok(json!("slow"))
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        let err = guard
            .execute("k", "actor", "POST", "/e", &payload, || async { Ok(json!("dup")) })
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Conflict("request in progress".to_string()));

        finish_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), json!("slow"));
    }

    #[tokio::test]
    async fn test_abandoned_pending_record_becomes_retryable_after_ttl() {
        let (guard, clock) = guard();
        let payload = json!({"n": 1});
        let record = IdempotencyRecord::pending(
            "k",
            "actor",
            "POST",
            "/e",
            request_hash("POST", "/e", &payload),
            clock.now() + Duration::hours(24),
            clock.now(),
        );
        guard.repo.insert_pending(&record).await.unwrap();

        let blocked = guard.execute("k", "actor", "POST", "/e", &payload, || async { Ok(json!(1)) }).await;
        assert!(matches!(blocked, Err(CoreError::Conflict(_))));

        clock.advance(Duration::hours(25));
        let retried = guard.execute("k", "actor", "POST", "/e", &payload, || async { Ok(json!(2)) }).await;
        assert_eq!(retried.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_purge_only_touches_expired_records() {
        let (guard, clock) = guard();
        guard.execute("old", "actor", "POST", "/e", &json!({}), || async { Ok(json!(1)) }).await.unwrap();
        clock.advance(Duration::hours(23));
        guard.execute("new", "actor", "POST", "/e", &json!({}), || async { Ok(json!(1)) }).await.unwrap();
        clock.advance(Duration::hours(2));

        assert_eq!(guard.purge_expired(100).await.unwrap(), 1);
        assert!(guard.repo.get_record("new", "actor").await.unwrap().is_some());
    }
}
