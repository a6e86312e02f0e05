pub mod breaker;
pub mod sandbox;

use std::sync::Arc;
use std::time::Duration;

use transita_core::gateway::PaymentGateway;
use transita_core::{CoreError, CoreResult};
use transita_store::app_config::GatewayConfig;

pub use breaker::{CircuitBreaker, CircuitState, GuardedGateway};
pub use sandbox::SandboxGateway;

/// Builds the configured provider behind a timeout and circuit breaker.
/// Unknown providers fail here, at startup.
pub fn build_gateway(config: &GatewayConfig) -> CoreResult<Arc<dyn PaymentGateway>> {
    let provider: Arc<dyn PaymentGateway> = match config.provider.as_str() {
        "sandbox" => {
            if config.webhook_secret.is_empty() {
                return Err(CoreError::ConfigurationError(
                    "gateway.webhook_secret is required".to_string(),
                ));
            }
            Arc::new(SandboxGateway::new(&config.webhook_secret))
        }
        other => {
            return Err(CoreError::ConfigurationError(format!(
                "payment provider '{}' is not available in this build",
                other
            )))
        }
    };

    tracing::info!("Payment gateway: {}", provider.name());
    Ok(Arc::new(GuardedGateway::new(
        provider,
        config.breaker_threshold as usize,
        Duration::from_secs(config.breaker_reset_seconds),
        Duration::from_millis(config.timeout_ms),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> GatewayConfig {
        GatewayConfig {
            provider: provider.to_string(),
            secret_key: String::new(),
            webhook_secret: "whsec".to_string(),
            timeout_ms: 1_000,
            breaker_threshold: 3,
            breaker_reset_seconds: 30,
            redirect_url: None,
            callback_url: None,
        }
    }

    #[test]
    fn test_factory_fails_fast_on_unknown_provider() {
        assert!(build_gateway(&config("sandbox")).is_ok());
        assert!(matches!(build_gateway(&config("paystack")), Err(CoreError::ConfigurationError(_))));

        let mut missing_secret = config("sandbox");
        missing_secret.webhook_secret.clear();
        assert!(build_gateway(&missing_secret).is_err());
    }
}
