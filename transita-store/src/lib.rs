pub mod app_config;
pub mod booking_repo;
pub mod database;
pub mod events;
pub mod idempotency_repo;
pub mod lock_repo;
pub mod memory;
pub mod payment_repo;
mod pg;
pub mod redis_repo;
pub mod settlement_repo;
pub mod trip_repo;

pub use database::DbClient;
pub use events::{EventProducer, KafkaAuditSink};
pub use memory::MemoryStore;
pub use redis_repo::RedisClient;
