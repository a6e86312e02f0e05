use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    pub business_rules: BusinessRules,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 10 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// Rate limiting is off when unset.
    pub url: Option<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: None, rate_limit_per_minute: default_rate_limit() }
    }
}

fn default_rate_limit() -> i64 { 120 }

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KafkaConfig {
    /// Audit events go to the log when unset.
    pub brokers: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusinessRules {
    #[serde(default = "default_seat_hold")]
    pub seat_hold_seconds: u64,
    /// Platform share of every payment, in basis points.
    #[serde(default)]
    pub platform_fee_bps: u32,
    #[serde(default = "default_max_seats")]
    pub max_seats_per_lock: usize,
}

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            seat_hold_seconds: default_seat_hold(),
            platform_fee_bps: 0,
            max_seats_per_lock: default_max_seats(),
        }
    }
}

fn default_seat_hold() -> u64 { 900 }
fn default_max_seats() -> usize { 10 }

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub provider: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_reset")]
    pub breaker_reset_seconds: u64,
    pub redirect_url: Option<String>,
    pub callback_url: Option<String>,
}

fn default_gateway_timeout() -> u64 { 10_000 }
fn default_breaker_threshold() -> u32 { 5 }
fn default_breaker_reset() -> u64 { 30 }

/// How often a job runs and how much it takes per run.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct JobSchedule {
    pub interval_seconds: u64,
    pub batch_size: i64,
}

impl JobSchedule {
    const fn every(interval_seconds: u64, batch_size: i64) -> Self {
        Self { interval_seconds, batch_size }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_expire_locks")]
    pub expire_locks: JobSchedule,
    #[serde(default = "default_reconcile_payments")]
    pub reconcile_payments: JobSchedule,
    #[serde(default = "default_process_refunds")]
    pub process_refunds: JobSchedule,
    #[serde(default = "default_calculate_settlements")]
    pub calculate_settlements: JobSchedule,
    #[serde(default = "default_cleanup_idempotency")]
    pub cleanup_idempotency: JobSchedule,
    /// Age at which a PENDING payment is abandoned when the gateway has no record of it.
    #[serde(default = "default_payment_grace")]
    pub payment_grace_seconds: u64,
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_seconds: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            expire_locks: default_expire_locks(),
            reconcile_payments: default_reconcile_payments(),
            process_refunds: default_process_refunds(),
            calculate_settlements: default_calculate_settlements(),
            cleanup_idempotency: default_cleanup_idempotency(),
            payment_grace_seconds: default_payment_grace(),
            idempotency_ttl_seconds: default_idempotency_ttl(),
        }
    }
}

fn default_expire_locks() -> JobSchedule { JobSchedule::every(60, 500) }
fn default_reconcile_payments() -> JobSchedule { JobSchedule::every(300, 100) }
fn default_process_refunds() -> JobSchedule { JobSchedule::every(300, 50) }
fn default_calculate_settlements() -> JobSchedule { JobSchedule::every(86_400, 200) }
fn default_cleanup_idempotency() -> JobSchedule { JobSchedule::every(3_600, 1_000) }
fn default_payment_grace() -> u64 { 3_600 }
fn default_idempotency_ttl() -> u64 { 86_400 }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Untracked local overrides
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `TRANSITA_GATEWAY__SECRET_KEY=...` sets `gateway.secret_key`
            .add_source(config::Environment::with_prefix("TRANSITA").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let raw = r#"
            [server]
            port = 8080
            [database]
            url = "postgres://localhost/transita"
            [auth]
            jwt_secret = "secret"
            jwt_expiration_seconds = 3600
            [business_rules]
            platform_fee_bps = 250
            [gateway]
            provider = "sandbox"
        "#;
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.business_rules.seat_hold_seconds, 900);
        assert_eq!(cfg.business_rules.platform_fee_bps, 250);
        assert_eq!(cfg.jobs.payment_grace_seconds, 3_600);
        assert_eq!(cfg.jobs.expire_locks.batch_size, 500);
        assert!(cfg.redis.url.is_none());
        assert!(cfg.kafka.brokers.is_none());
        assert_eq!(cfg.gateway.timeout_ms, 10_000);
    }
}
