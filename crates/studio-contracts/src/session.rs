use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What the session controller is currently doing. Exactly one value is
/// active at a time; the machine is re-entrant per submission.
///
/// `Uploading` is reserved: no in-scope transition produces it, but the
/// wire shape keeps the variant for forward compatibility with staged
/// uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Uploading,
    Generating,
    Succeeded,
    Failed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Uploading => "uploading",
            SessionPhase::Generating => "generating",
            SessionPhase::Succeeded => "succeeded",
            SessionPhase::Failed => "failed",
        }
    }
}

/// Flat failure taxonomy for a generation attempt. Everything the
/// external service can do wrong collapses into `Generation` with a
/// single human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Please select an image first.")]
    NoImageSelected,
    #[error("{0}")]
    Generation(String),
}

impl SessionError {
    pub fn generation(message: impl Into<String>) -> Self {
        SessionError::Generation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionError, SessionPhase};

    #[test]
    fn phase_names_match_wire_form() {
        assert_eq!(SessionPhase::Idle.as_str(), "idle");
        assert_eq!(SessionPhase::Uploading.as_str(), "uploading");
        assert_eq!(SessionPhase::Generating.as_str(), "generating");
        assert_eq!(SessionPhase::Succeeded.as_str(), "succeeded");
        assert_eq!(SessionPhase::Failed.as_str(), "failed");
        assert_eq!(SessionPhase::default(), SessionPhase::Idle);
    }

    #[test]
    fn phase_serializes_snake_case() -> anyhow::Result<()> {
        let json = serde_json::to_string(&SessionPhase::Generating)?;
        assert_eq!(json, "\"generating\"");
        let parsed: SessionPhase = serde_json::from_str("\"failed\"")?;
        assert_eq!(parsed, SessionPhase::Failed);
        Ok(())
    }

    #[test]
    fn validation_error_carries_fixed_message() {
        assert_eq!(
            SessionError::NoImageSelected.to_string(),
            "Please select an image first."
        );
    }

    #[test]
    fn generation_error_surfaces_its_message() {
        let err = SessionError::generation("quota exceeded");
        assert_eq!(err.to_string(), "quota exceeded");
    }
}
