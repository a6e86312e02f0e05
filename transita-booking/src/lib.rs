pub mod bookings;
pub mod finance;
pub mod gateway;
pub mod idempotency;
pub mod jobs;
pub mod locks;
pub mod payments;
pub mod settlement;

use chrono::Duration;
use std::sync::Arc;

use transita_core::audit::AuditSink;
use transita_core::gateway::PaymentGateway;
use transita_core::{Clock, Repositories};
use transita_store::app_config::Config;

pub use bookings::{BookingResult, BookingService, Caller, ConfirmRequest};
pub use idempotency::IdempotencyGuard;
pub use jobs::{Job, JobLimits, JobReport, LifecycleJobs};
pub use locks::{Availability, LockManager};
pub use payments::{PaymentResolver, WebhookOutcome};
pub use settlement::SettlementService;

/// Tunables the engine reads once at construction.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub hold_duration: Duration,
    pub max_seats_per_lock: usize,
    pub platform_fee_bps: u32,
    pub idempotency_ttl: Duration,
    pub payment_grace: Duration,
    pub redirect_url: String,
    pub callback_url: String,
    pub limits: JobLimits,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_duration: Duration::minutes(15),
            max_seats_per_lock: 10,
            platform_fee_bps: 0,
            idempotency_ttl: Duration::hours(24),
            payment_grace: Duration::hours(1),
            redirect_url: String::new(),
            callback_url: String::new(),
            limits: JobLimits::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let rules = &config.business_rules;
        let jobs = &config.jobs;
        Self {
            hold_duration: Duration::seconds(rules.seat_hold_seconds as i64),
            max_seats_per_lock: rules.max_seats_per_lock,
            platform_fee_bps: rules.platform_fee_bps,
            idempotency_ttl: Duration::seconds(jobs.idempotency_ttl_seconds as i64),
            payment_grace: Duration::seconds(jobs.payment_grace_seconds as i64),
            redirect_url: config.gateway.redirect_url.clone().unwrap_or_default(),
            callback_url: config.gateway.callback_url.clone().unwrap_or_default(),
            limits: JobLimits {
                expire_locks: jobs.expire_locks.batch_size,
                reconcile_payments: jobs.reconcile_payments.batch_size,
                process_refunds: jobs.process_refunds.batch_size,
                calculate_settlements: jobs.calculate_settlements.batch_size,
                cleanup_idempotency: jobs.cleanup_idempotency.batch_size,
            },
        }
    }
}

/// Every service wired over one store client, one gateway and one sink.
#[derive(Clone)]
pub struct Engine {
    pub repos: Repositories,
    pub gateway: Arc<dyn PaymentGateway>,
    pub locks: LockManager,
    pub idempotency: IdempotencyGuard,
    pub payments: PaymentResolver,
    pub bookings: BookingService,
    pub settlements: SettlementService,
    pub jobs: LifecycleJobs,
}

impl Engine {
    pub fn new(
        repos: Repositories,
        gateway: Arc<dyn PaymentGateway>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let locks = LockManager::new(
            repos.clone(),
            audit.clone(),
            clock.clone(),
            settings.hold_duration,
            settings.max_seats_per_lock,
        );
        let idempotency = IdempotencyGuard::new(repos.idempotency.clone(), clock.clone(), settings.idempotency_ttl);
        let payments = PaymentResolver::new(repos.clone(), locks.clone(), gateway.clone(), audit.clone(), clock.clone());
        let bookings = BookingService::new(
            repos.clone(),
            locks.clone(),
            idempotency.clone(),
            payments.clone(),
            gateway.clone(),
            audit.clone(),
            clock.clone(),
            settings.platform_fee_bps,
            settings.redirect_url,
            settings.callback_url,
        );
        let settlements = SettlementService::new(repos.clone(), audit.clone(), clock.clone());
        let jobs = LifecycleJobs::new(
            repos.clone(),
            locks.clone(),
            idempotency.clone(),
            payments.clone(),
            settlements.clone(),
            gateway.clone(),
            audit,
            clock,
            settings.payment_grace,
            settings.limits,
        );

        Self {
            repos,
            gateway,
            locks,
            idempotency,
            payments,
            bookings,
            settlements,
            jobs,
        }
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    use transita_core::audit::RecordingAuditSink;
    use transita_core::booking::{ContactInfo, Passenger};
    use transita_core::gateway::{GatewayStatus, PaymentGateway};
    use transita_core::trip::Trip;
    use transita_core::{Clock, ManualClock};
    use transita_shared::Masked;
    use transita_store::MemoryStore;

    use crate::bookings::{BookingResult, Caller, ConfirmRequest};
    use crate::gateway::{GuardedGateway, SandboxGateway};
    use crate::payments::{OutcomeSource, PaymentOutcome};
    use crate::{Engine, EngineSettings};

    pub const FARE: i64 = 5_000;

    pub fn seats(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    pub fn passengers(list: &[(&str, &str)]) -> Vec<Passenger> {
        list.iter()
            .map(|(name, seat)| Passenger { full_name: name.to_string(), seat_number: seat.to_string() })
            .collect()
    }

    pub fn contact() -> ContactInfo {
        ContactInfo { email: Masked::new("ada@example.com".to_string()), phone: None }
    }

    pub struct TestEngine {
        pub engine: Engine,
        pub clock: Arc<ManualClock>,
        pub audit: Arc<RecordingAuditSink>,
        pub sandbox: Arc<SandboxGateway>,
        pub agency_id: Uuid,
    }

    impl TestEngine {
        pub async fn new() -> Self {
            let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()));
            let audit = Arc::new(RecordingAuditSink::new());
            let sandbox = Arc::new(SandboxGateway::new("whsec_test"));
            let gateway: Arc<dyn PaymentGateway> = Arc::new(GuardedGateway::new(
                sandbox.clone(),
                5,
                std::time::Duration::from_secs(30),
                std::time::Duration::from_millis(100),
            ));
            let settings = EngineSettings { platform_fee_bps: 500, ..EngineSettings::default() };
            let engine = Engine::new(
                MemoryStore::new().repositories(),
                gateway,
                audit.clone(),
                clock.clone(),
                settings,
            );
            Self { engine, clock, audit, sandbox, agency_id: Uuid::new_v4() }
        }

        pub fn holder(&self) -> Caller {
            Caller::user("holder-1")
        }

        pub async fn seed_trip(&self, seat_numbers: &[&str]) -> Trip {
            let trip = Trip::new(
                self.agency_id,
                seats(seat_numbers),
                FARE,
                "NGN",
                self.clock.now() + Duration::days(30),
            );
            self.engine.repos.trips.upsert_trip(&trip).await.unwrap();
            trip
        }

        /// Reserves and confirms `seat_numbers` on a fresh trip, leaving
        /// the payment PENDING behind a sandbox payment link.
        pub async fn confirmed_booking(&self, seat_numbers: &[&str]) -> BookingResult {
            let trip = self.seed_trip(&["1", "2", "3", "4", "5", "6"]).await;
            let caller = self.holder();
            let grant = self
                .engine
                .bookings
                .reserve(&caller, trip.id, &seats(seat_numbers), None)
                .await
                .unwrap();
            let pax = seat_numbers
                .iter()
                .map(|seat| Passenger { full_name: format!("Passenger {}", seat), seat_number: seat.to_string() })
                .collect();
            self.engine
                .bookings
                .confirm(
                    &caller,
                    ConfirmRequest { lock_id: grant.lock_id, passengers: pax, contact: contact(), transaction_id: None },
                )
                .await
                .unwrap()
        }

        /// A confirmed booking whose payment has gone through.
        pub async fn paid_booking(&self, seat_numbers: &[&str]) -> BookingResult {
            let mut result = self.confirmed_booking(seat_numbers).await;
            let tx = result.payment.transaction_id.clone().unwrap();
            self.sandbox.settle(&tx, GatewayStatus::Successful);
            self.engine
                .payments
                .apply(
                    &result.payment,
                    PaymentOutcome::Paid { transaction_id: Some(tx), paid_at: None },
                    OutcomeSource::Webhook,
                )
                .await
                .unwrap();
            result.payment = self.engine.repos.payments.get_payment(result.payment.id).await.unwrap().unwrap();
            result
        }
    }
}
