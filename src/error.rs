use thiserror::Error;

/// Simulation error kinds.
///
/// Loader and argument problems are user errors and map to exit code 1 in the
/// binaries; device failures are reported with the backend's message and map
/// to exit code 2. Capacity violations inside a driver are programmer errors
/// and are handled with debug assertions, not with this type.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid arguments: {0}")]
    BadArgs(String),

    #[error("missing or empty input: {0}")]
    InputMissing(String),

    #[error("inconsistent input: {0}")]
    InputInconsistent(String),

    #[error("device error: {0}")]
    Device(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SimError {
    /// Process exit code for this error, following the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            SimError::Device(_) => 2,
            _ => 1,
        }
    }
}
