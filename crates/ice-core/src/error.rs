use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {cmd}: {reason}")]
    Spawn { cmd: String, reason: String },
    #[error("Not found {0}")]
    NotFound(u32),
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    pub fn spawn(cmd: &str, reason: impl ToString) -> Self {
        Self::Spawn {
            cmd: cmd.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Errors the caller caused (bad input or an unknown process), as opposed
    /// to faults of the supervisor itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SupervisorError::NotFound(_)
                | SupervisorError::InvalidSignal(_)
                | SupervisorError::Spawn { .. }
        )
    }
}
