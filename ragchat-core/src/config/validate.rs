//! Configuration validation rules.

use super::schema::Config;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();

    let api = config.backend.api_base_url.trim();
    if api.is_empty() {
        errors.push("backend.api_base_url must not be empty".to_string());
    } else if !(api.starts_with("http://") || api.starts_with("https://")) {
        errors.push("backend.api_base_url must start with http:// or https://".to_string());
    }

    let socket = config.backend.socket_url.trim();
    if socket.is_empty() {
        errors.push("backend.socket_url must not be empty".to_string());
    } else if !(socket.starts_with("ws://") || socket.starts_with("wss://")) {
        errors.push("backend.socket_url must start with ws:// or wss://".to_string());
    }

    if config.backend.request_timeout_secs == 0 {
        errors.push("backend.request_timeout_secs must be > 0".to_string());
    }

    if config.transport.reconnect_initial_delay_ms == 0 {
        errors.push("transport.reconnect_initial_delay_ms must be > 0".to_string());
    }
    if config.transport.reconnect_max_delay_ms < config.transport.reconnect_initial_delay_ms {
        errors.push(
            "transport.reconnect_max_delay_ms must be >= transport.reconnect_initial_delay_ms"
                .to_string(),
        );
    }

    if config.chat.history_limit == 0 {
        errors.push("chat.history_limit must be > 0".to_string());
    }

    if config.ingestion.enabled && config.ingestion.poll_interval_secs == 0 {
        errors.push(
            "ingestion.poll_interval_secs must be > 0 when ingestion is enabled".to_string(),
        );
    }

    if !LOG_LEVELS.contains(&config.logging.level.to_ascii_lowercase().as_str()) {
        errors.push(format!(
            "logging.level must be one of {}",
            LOG_LEVELS.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Validation(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_defaults() {
        validate_config(&Config::default()).unwrap();
    }

    #[test]
    fn test_validate_rejects_wrong_socket_scheme() {
        let mut config = Config::default();
        config.backend.socket_url = "http://localhost:3001".to_string();

        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("backend.socket_url"));
    }

    #[test]
    fn test_validate_aggregates_errors() {
        let mut config = Config::default();
        config.chat.history_limit = 0;
        config.transport.reconnect_max_delay_ms = 10;

        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("chat.history_limit"));
        assert!(err.contains("transport.reconnect_max_delay_ms"));
    }
}
