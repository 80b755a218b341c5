use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One correlated run of a saga.
///
/// `compensations` is the LIFO stack of registered compensation names; the
/// back of the vector is the top of the stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(serialize = "D: Serialize", deserialize = "D: serde::de::DeserializeOwned"))]
pub struct SagaInstance<D> {
    pub correlation_id: Uuid,
    pub saga_name: String,
    pub current_state: String,
    pub data: D,
    pub completed: bool,
    pub failed: bool,
    pub failure_reason: Option<String>,
    pub compensations: Vec<String>,
    pub state_entered_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<D> SagaInstance<D> {
    pub fn new(
        saga_name: impl Into<String>,
        correlation_id: Uuid,
        initial_state: impl Into<String>,
        data: D,
    ) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            saga_name: saga_name.into(),
            current_state: initial_state.into(),
            data,
            completed: false,
            failed: false,
            failure_reason: None,
            compensations: Vec::new(),
            state_entered_at: now,
            started_at: now,
            updated_at: now,
        }
    }

    /// Terminal instances ignore further events.
    pub fn is_terminal(&self) -> bool {
        self.completed || self.failed
    }
}
