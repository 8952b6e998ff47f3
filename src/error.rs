use crate::status::Status;

/// Errors returned while setting up a call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("failed to serialize request: {0}")]
    Serialization(Status),
}

impl CallError {
    /// The status describing the failure.
    pub fn status(&self) -> &Status {
        match self {
            CallError::Serialization(status) => status,
        }
    }
}

impl From<CallError> for Status {
    fn from(error: CallError) -> Self {
        match error {
            CallError::Serialization(status) => status,
        }
    }
}
