use crate::config::ObservabilityConfig;
use crate::error::{Error, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level and `LOG_FORMAT` ("pretty"
/// or "json") the configured format. Fails if a subscriber is already
/// installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| config.log_format.clone());
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        "pretty" => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        other => {
            return Err(Error::Config(format!(
                "Unknown log format '{}', expected 'pretty' or 'json'",
                other
            )))
        }
    };
    installed.map_err(|e| Error::Config(format!("Tracing already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_format() {
        let config = ObservabilityConfig {
            log_format: "xml".to_string(),
            log_level: "info".to_string(),
        };
        if std::env::var("LOG_FORMAT").is_err() {
            assert!(matches!(init_tracing(&config), Err(Error::Config(_))));
        }
    }
}
