//! Domain error taxonomy. Startup and storage plumbing use `anyhow`; anything
//! an operator or the schedule engine can trigger is one of these.

use thiserror::Error;

/// Malformed or inconsistent zone / schedule / command definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Publish failed because the broker connection is down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("controller unreachable: {reason}")]
pub struct TransportError {
    pub reason: String,
}

/// Command targets an actuator or controller the hub cannot route to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no controller bound for {target}")]
pub struct StaleControllerError {
    pub target: String,
}

/// Wall clock moved backwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("clock moved backwards by {seconds}s, liveness resynced")]
pub struct ClockAnomalyError {
    pub seconds: i64,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    StaleController(#[from] StaleControllerError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type HubResult<T> = Result<T, HubError>;

pub(crate) fn invalid<T>(msg: impl Into<String>) -> HubResult<T> {
    Err(ValidationError::new(msg).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_reads_as_unreachable() {
        let e = HubError::from(TransportError {
            reason: "broker disconnected".into(),
        });
        assert_eq!(e.to_string(), "controller unreachable: broker disconnected");
    }

    #[test]
    fn validation_message_is_passed_through() {
        let e: HubResult<()> = invalid("end time must be after start time");
        assert_eq!(
            e.unwrap_err().to_string(),
            "end time must be after start time"
        );
    }
}
