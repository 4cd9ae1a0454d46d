//! Environment record and its state graph.

use chrono::{DateTime, Utc};
use devenv_config::BackendKind;
use devenv_core::{ErrorSummary, VolumeRef};
use devenv_provider::BackendHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum EnvironmentState {
    Absent,
    Provisioning,
    Hydrating,
    Running,
    Idle,
    Dehydrating,
    Hibernated,
    Deleting,
    Failed,
}

impl EnvironmentState {
    pub const ALL: [EnvironmentState; 9] = [
        EnvironmentState::Absent,
        EnvironmentState::Provisioning,
        EnvironmentState::Hydrating,
        EnvironmentState::Running,
        EnvironmentState::Idle,
        EnvironmentState::Dehydrating,
        EnvironmentState::Hibernated,
        EnvironmentState::Deleting,
        EnvironmentState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnvironmentState::Absent => "absent",
            EnvironmentState::Provisioning => "provisioning",
            EnvironmentState::Hydrating => "hydrating",
            EnvironmentState::Running => "running",
            EnvironmentState::Idle => "idle",
            EnvironmentState::Dehydrating => "dehydrating",
            EnvironmentState::Hibernated => "hibernated",
            EnvironmentState::Deleting => "deleting",
            EnvironmentState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Edges of the lifecycle graph. Anything else is an invalid transition.
    pub fn can_transition_to(self, next: EnvironmentState) -> bool {
        use EnvironmentState::*;
        matches!(
            (self, next),
            (Absent, Provisioning | Deleting | Failed)
                | (Provisioning, Hydrating | Absent | Hibernated | Failed)
                | (Hydrating, Running | Absent | Hibernated | Failed)
                | (Running, Idle | Dehydrating | Deleting | Failed)
                | (Idle, Running | Dehydrating | Deleting | Failed)
                | (Dehydrating, Hibernated | Running | Idle | Failed)
                | (Hibernated, Provisioning | Deleting | Failed)
                | (Deleting, Absent | Failed)
                | (Failed, Absent | Deleting)
        )
    }

    /// States nobody is working in; everything else is mid-transition.
    pub fn is_resting(self) -> bool {
        matches!(
            self,
            EnvironmentState::Absent
                | EnvironmentState::Running
                | EnvironmentState::Idle
                | EnvironmentState::Hibernated
                | EnvironmentState::Failed
        )
    }

    fn requires_volume(self) -> bool {
        matches!(
            self,
            EnvironmentState::Provisioning
                | EnvironmentState::Hydrating
                | EnvironmentState::Running
                | EnvironmentState::Idle
                | EnvironmentState::Dehydrating
        )
    }

    /// `Some(required)` where the state pins the handle, `None` where either is fine.
    fn handle_rule(self) -> Option<bool> {
        match self {
            EnvironmentState::Absent | EnvironmentState::Hibernated => Some(false),
            EnvironmentState::Hydrating
            | EnvironmentState::Running
            | EnvironmentState::Idle
            | EnvironmentState::Dehydrating => Some(true),
            EnvironmentState::Provisioning
            | EnvironmentState::Deleting
            | EnvironmentState::Failed => None,
        }
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub owner_id: i64,
    pub project_id: i64,
    pub backend_kind: BackendKind,
    pub state: EnvironmentState,
    pub backend_handle: Option<BackendHandle>,
    pub volume_ref: Option<VolumeRef>,
    pub host: Option<String>,
    pub last_active_at: DateTime<Utc>,
    pub version: i64,
    pub last_error: Option<ErrorSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    /// Field rules every persisted record satisfies.
    pub fn check_invariants(&self) -> Result<(), String> {
        let running = self.state == EnvironmentState::Running;
        if self.host.is_some() != running {
            return Err(format!(
                "host must be set exactly when running (state {}, host {:?})",
                self.state, self.host
            ));
        }

        if self.volume_ref.is_some() != self.state.requires_volume() {
            return Err(format!(
                "volume_ref {:?} not allowed in state {}",
                self.volume_ref, self.state
            ));
        }

        if let Some(required) = self.state.handle_rule() {
            if self.backend_handle.is_some() != required {
                return Err(format!(
                    "backend_handle must be {} in state {}",
                    if required { "set" } else { "unset" },
                    self.state
                ));
            }
        }

        Ok(())
    }
}

/// Caller-facing status view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub id: String,
    pub state: EnvironmentState,
    pub host: Option<String>,
    pub last_error: Option<ErrorSummary>,
}

impl From<&Environment> for EnvironmentStatus {
    fn from(env: &Environment) -> Self {
        Self {
            id: env.id.clone(),
            state: env.state,
            host: env.host.clone(),
            last_error: env.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentFilters {
    pub owner_id: Option<i64>,
    pub state: Option<EnvironmentState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnvironmentState::*;

    fn env(state: EnvironmentState) -> Environment {
        let now = Utc::now();
        Environment {
            id: "e".into(),
            owner_id: 1,
            project_id: 2,
            backend_kind: BackendKind::Local,
            state,
            backend_handle: None,
            volume_ref: None,
            host: None,
            last_active_at: now,
            version: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn handle() -> BackendHandle {
        BackendHandle::Container {
            name: "devenv-u1-p2".into(),
            id: "abc".into(),
        }
    }

    #[test]
    fn test_graph_edges() {
        assert!(Absent.can_transition_to(Provisioning));
        assert!(Hibernated.can_transition_to(Provisioning));
        assert!(Dehydrating.can_transition_to(Idle));
        assert!(Failed.can_transition_to(Absent));

        assert!(!Absent.can_transition_to(Running));
        assert!(!Hibernated.can_transition_to(Running));
        assert!(!Running.can_transition_to(Hibernated));
        assert!(!Deleting.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_every_state_can_fail() {
        for state in EnvironmentState::ALL {
            assert!(
                state == Failed || state.can_transition_to(Failed),
                "{state} cannot move to failed"
            );
        }
    }

    #[test]
    fn test_parse_roundtrip() {
        for state in EnvironmentState::ALL {
            assert_eq!(EnvironmentState::parse(state.as_str()), Some(state));
        }
        assert_eq!(EnvironmentState::parse("stopped"), None);
    }

    #[test]
    fn test_invariants() {
        assert!(env(Absent).check_invariants().is_ok());

        let mut running = env(Running);
        running.volume_ref = Some(VolumeRef::for_project(1, 2));
        running.backend_handle = Some(handle());
        assert!(running.check_invariants().is_err(), "running without host");
        running.host = Some("user1-project2.dev.localhost".into());
        assert!(running.check_invariants().is_ok());

        let mut idle = running.clone();
        idle.state = Idle;
        assert!(idle.check_invariants().is_err(), "idle keeps host");
        idle.host = None;
        assert!(idle.check_invariants().is_ok());

        let mut hibernated = env(Hibernated);
        hibernated.backend_handle = Some(handle());
        assert!(hibernated.check_invariants().is_err());

        let mut provisioning = env(Provisioning);
        provisioning.volume_ref = Some(VolumeRef::for_project(1, 2));
        assert!(provisioning.check_invariants().is_ok());
        provisioning.backend_handle = Some(handle());
        assert!(provisioning.check_invariants().is_ok());

        let mut failed = env(Failed);
        failed.backend_handle = Some(handle());
        assert!(failed.check_invariants().is_ok());
    }
}
