//! Built-in executors.

use serde::Deserialize;

use cadence_infra::jobs::{ExecutorRegistry, RegistryError};

/// Job type of the liveness check.
pub const ENGINE_PING: &str = "ENGINE_PING";

#[derive(Debug, Deserialize)]
struct Ping {
    #[serde(default)]
    message: Option<String>,
}

/// Logs the check and succeeds. An empty payload is accepted; anything else
/// must be a JSON object.
pub async fn engine_ping(payload: String) -> anyhow::Result<()> {
    let ping: Ping = if payload.trim().is_empty() {
        Ping { message: None }
    } else {
        serde_json::from_str(&payload)?
    };
    tracing::info!(note = ping.message.as_deref().unwrap_or(""), "engine ping");
    Ok(())
}

/// Registry with every built-in executor.
pub fn builtin_registry() -> Result<ExecutorRegistry, RegistryError> {
    ExecutorRegistry::new().with(ENGINE_PING, engine_ping)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_accepts_empty_and_json_payloads() {
        assert!(engine_ping(String::new()).await.is_ok());
        assert!(engine_ping(r#"{"message":"hello"}"#.to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn ping_rejects_malformed_payload() {
        assert!(engine_ping("not json".to_string()).await.is_err());
    }

    #[test]
    fn builtins_are_registered() {
        let registry = builtin_registry().unwrap();
        assert_eq!(registry.job_types(), vec![ENGINE_PING]);
    }
}
