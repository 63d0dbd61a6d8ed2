use serde::ser::SerializeStruct;
use serde::Serialize;

/// Error surfaced to hosts through the control operations.
///
/// Per-request transport and assertion failures are not errors; they are
/// recorded on the [`RequestRecord`](crate::report::RequestRecord) and
/// streamed to subscribers. This type covers control-plane rejections and
/// fatal engine conditions only.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a test is already running")]
    AlreadyRunning,

    #[error("no test is running")]
    NotRunning,

    #[error("plan not found: {0}")]
    PlanNotFound(uuid::Uuid),

    #[error("plan has no enabled thread group with an enabled request")]
    PlanEmpty,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("fatal engine error: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Stable discriminant a host maps to presentation.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::AlreadyRunning => "already_running",
            EngineError::NotRunning => "not_running",
            EngineError::PlanNotFound(_) => "plan_not_found",
            EngineError::PlanEmpty => "plan_empty",
            EngineError::Validation(_) => "validation",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Fatal(_) => "fatal",
        }
    }
}

impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("EngineError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}
