use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use transita_core::Repositories;

use crate::booking_repo::PgBookingRepository;
use crate::idempotency_repo::PgIdempotencyRepository;
use crate::lock_repo::PgLockRepository;
use crate::payment_repo::PgPaymentRepository;
use crate::settlement_repo::PgSettlementRepository;
use crate::trip_repo::PgTripRepository;

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    /// Postgres-backed handles sharing this client's pool.
    pub fn repositories(&self) -> Repositories {
        Repositories {
            trips: Arc::new(PgTripRepository::new(self.pool.clone())),
            locks: Arc::new(PgLockRepository::new(self.pool.clone())),
            bookings: Arc::new(PgBookingRepository::new(self.pool.clone())),
            payments: Arc::new(PgPaymentRepository::new(self.pool.clone())),
            idempotency: Arc::new(PgIdempotencyRepository::new(self.pool.clone())),
            settlements: Arc::new(PgSettlementRepository::new(self.pool.clone())),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed.");
    }
}
