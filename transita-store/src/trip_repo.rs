use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use transita_core::repository::TripRepository;
use transita_core::trip::Trip;
use transita_core::CoreResult;

use crate::pg::{db_err, TripRow};

pub struct PgTripRepository {
    pool: PgPool,
}

impl PgTripRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TripRepository for PgTripRepository {
    async fn get_trip(&self, id: Uuid) -> CoreResult<Option<Trip>> {
        let row = sqlx::query_as::<_, TripRow>("SELECT * FROM trips WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(Trip::from))
    }

    async fn upsert_trip(&self, trip: &Trip) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trips (id, agency_id, capacity, seat_numbers, available_seats, fare_amount, currency, departs_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                agency_id = EXCLUDED.agency_id,
                capacity = EXCLUDED.capacity,
                seat_numbers = EXCLUDED.seat_numbers,
                available_seats = EXCLUDED.available_seats,
                fare_amount = EXCLUDED.fare_amount,
                currency = EXCLUDED.currency,
                departs_at = EXCLUDED.departs_at
            "#,
        )
        .bind(trip.id)
        .bind(trip.agency_id)
        .bind(trip.capacity)
        .bind(&trip.seat_numbers)
        .bind(&trip.available_seats)
        .bind(trip.fare_amount)
        .bind(&trip.currency)
        .bind(trip.departs_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
