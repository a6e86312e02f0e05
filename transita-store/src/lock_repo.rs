use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use transita_core::clock::Clock;
use transita_core::lock::{check_acquirable, ConfirmAction, NewLock, SeatLock};
use transita_core::repository::LockRepository;
use transita_core::{CoreError, CoreResult};

use crate::pg::{collect, db_err, lock_for_update, store_lock, trip_for_update, LockRow};

pub struct PgLockRepository {
    pool: PgPool,
}

impl PgLockRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockRepository for PgLockRepository {
    async fn acquire(&self, request: &NewLock, now: DateTime<Utc>) -> CoreResult<SeatLock> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // The trip row is the per-trip critical section: concurrent acquirers
        // queue here and each sees the locks committed before it.
        let trip = trip_for_update(&mut tx, request.trip_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trip {}", request.trip_id)))?;

        let live: Vec<SeatLock> = collect(
            sqlx::query_as::<_, LockRow>(
                "SELECT * FROM seat_locks WHERE trip_id = $1 AND status IN ('HELD', 'CONFIRMED') AND expires_at > $2",
            )
            .bind(request.trip_id)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?,
        )?;

        check_acquirable(&trip, &live, &request.seat_numbers, now)?;

        let lock = SeatLock::held(request, now);
        sqlx::query(
            r#"
            INSERT INTO seat_locks (id, trip_id, holder_id, seat_numbers, status, booking_id, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NULL, $6, $7, $7)
            "#,
        )
        .bind(lock.id)
        .bind(lock.trip_id)
        .bind(&lock.holder_id)
        .bind(&lock.seat_numbers)
        .bind(lock.status.as_str())
        .bind(lock.expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(lock)
    }

    async fn get_lock(&self, id: Uuid) -> CoreResult<Option<SeatLock>> {
        sqlx::query_as::<_, LockRow>("SELECT * FROM seat_locks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(SeatLock::try_from)
            .transpose()
    }

    async fn confirm_lock(
        &self,
        id: Uuid,
        booking_id: Uuid,
        retain_until: DateTime<Utc>,
        clock: &dyn Clock,
    ) -> CoreResult<SeatLock> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut lock = lock_for_update(&mut tx, id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("lock {}", id)))?;
        // Serialize with acquires on the same trip before reading the time.
        trip_for_update(&mut tx, lock.trip_id).await?;

        let now = clock.now();
        if lock.check_confirm(booking_id, now)? == ConfirmAction::Confirm {
            lock.confirm(booking_id, retain_until, now);
            store_lock(&mut tx, &lock).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(lock)
    }

    async fn release_lock(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<(SeatLock, bool)> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut lock = lock_for_update(&mut tx, id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("lock {}", id)))?;

        let changed = lock.release(now);
        if changed {
            store_lock(&mut tx, &lock).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok((lock, changed))
    }

    async fn live_locks(&self, trip_id: Uuid, now: DateTime<Utc>) -> CoreResult<Vec<SeatLock>> {
        let rows = sqlx::query_as::<_, LockRow>(
            "SELECT * FROM seat_locks WHERE trip_id = $1 AND status IN ('HELD', 'CONFIRMED') AND expires_at > $2 ORDER BY created_at",
        )
        .bind(trip_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows)
    }

    async fn release_expired(&self, now: DateTime<Utc>, limit: i64) -> CoreResult<Vec<SeatLock>> {
        // SKIP LOCKED: a lock being confirmed right now is left for the next
        // run, which then sees it CONFIRMED with its extended expiry.
        let rows = sqlx::query_as::<_, LockRow>(
            r#"
            UPDATE seat_locks SET status = 'RELEASED', expires_at = $1, updated_at = $1
            WHERE id IN (
                SELECT id FROM seat_locks
                WHERE status IN ('HELD', 'CONFIRMED') AND expires_at <= $1
                ORDER BY expires_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows)
    }
}
