//! Domain error types.
//!
//! Every operation names the error set it can produce; nothing is ambient.
//! The variants map one-to-one onto the control plane's HTTP statuses.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    /// Named server absent from the catalog (HTTP 404).
    #[error("server '{0}' not found")]
    NotFound(String),

    /// Operation not valid in the entry's current state (HTTP 409).
    #[error("{0}")]
    Precondition(String),

    /// The child's initialize handshake failed; the start is rejected.
    #[error("failed to initialize '{name}': {reason}")]
    InitializeFailed { name: String, reason: String },

    /// A live child request failed after the restart-and-retry path.
    #[error("request to '{name}' failed: {reason}")]
    RequestFailed { name: String, reason: String },

    /// Unparseable or self-contradictory catalog (HTTP 400).
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Control-plane connectivity failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Process spawn or signal failure.
    #[error("process error: {0}")]
    Process(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// HTTP status for the control plane's error envelope.
    pub fn status_code(&self) -> u16 {
        match self {
            FleetError::NotFound(_) => 404,
            FleetError::Precondition(_) => 409,
            FleetError::ConfigInvalid(_) => 400,
            FleetError::InitializeFailed { .. }
            | FleetError::RequestFailed { .. }
            | FleetError::Transport(_) => 502,
            FleetError::Process(_) | FleetError::Io(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(FleetError::NotFound("x".into()).status_code(), 404);
        assert_eq!(FleetError::Precondition("busy".into()).status_code(), 409);
        assert_eq!(FleetError::ConfigInvalid("dup".into()).status_code(), 400);
        assert_eq!(
            FleetError::InitializeFailed {
                name: "x".into(),
                reason: "eof".into()
            }
            .status_code(),
            502
        );
    }
}
