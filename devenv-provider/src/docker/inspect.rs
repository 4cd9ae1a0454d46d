//! Container state parsing for health checks
use crate::HealthStatus;
use devenv_core::{DevEnvError, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
    #[serde(default)]
    restarting: bool,
    health: Option<ContainerHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerHealth {
    status: String,
}

/// Interpret the output of `docker inspect --format '{{json .State}}'`.
pub(super) fn health_from_state(raw: &str) -> Result<HealthStatus> {
    let state: ContainerState = serde_json::from_str(raw.trim())
        .map_err(|e| DevEnvError::transient(format!("unparseable container state: {e}")))?;

    if state.restarting || state.status == "created" {
        return Ok(HealthStatus::Starting);
    }
    if !state.running {
        return Ok(HealthStatus::Unreachable);
    }

    Ok(match state.health.as_ref().map(|h| h.status.as_str()) {
        None | Some("healthy") => HealthStatus::Healthy,
        Some("starting") => HealthStatus::Starting,
        Some(_) => HealthStatus::Unreachable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_without_healthcheck_is_healthy() {
        let raw = r#"{"Status":"running","Running":true,"Restarting":false}"#;
        assert_eq!(health_from_state(raw).unwrap(), HealthStatus::Healthy);
    }

    #[test]
    fn test_healthcheck_status_is_respected() {
        let starting = r#"{"Status":"running","Running":true,"Health":{"Status":"starting"}}"#;
        let unhealthy = r#"{"Status":"running","Running":true,"Health":{"Status":"unhealthy"}}"#;
        assert_eq!(health_from_state(starting).unwrap(), HealthStatus::Starting);
        assert_eq!(health_from_state(unhealthy).unwrap(), HealthStatus::Unreachable);
    }

    #[test]
    fn test_created_and_exited() {
        let created = r#"{"Status":"created","Running":false}"#;
        let exited = r#"{"Status":"exited","Running":false}"#;
        assert_eq!(health_from_state(created).unwrap(), HealthStatus::Starting);
        assert_eq!(health_from_state(exited).unwrap(), HealthStatus::Unreachable);
    }

    #[test]
    fn test_garbage_is_transient() {
        assert!(health_from_state("not json").unwrap_err().is_retryable());
    }
}
