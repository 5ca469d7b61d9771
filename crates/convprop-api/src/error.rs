use thiserror::Error;

/// Errors surfaced by layer construction and propagation.
///
/// Nothing here is retried: propagation is deterministic, so a rejected build
/// or dispatch is reported to the immediate caller as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvError {
    #[error("invalid layer geometry: {0}")]
    Configuration(String),

    #[error("invalid operand: {0}")]
    InvalidOperand(String),

    #[error("compute device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("kernel '{kernel}' failed to build with options '{options}': {message}")]
    DeviceBuild {
        kernel: String,
        options: String,
        message: String,
    },

    #[error("dispatch of kernel '{kernel}' rejected: {message}")]
    DeviceDispatch { kernel: String, message: String },
}

impl ConvError {
    pub fn build(kernel: &str, options: &str, message: impl Into<String>) -> Self {
        ConvError::DeviceBuild {
            kernel: kernel.to_string(),
            options: options.to_string(),
            message: message.into(),
        }
    }

    pub fn dispatch(kernel: &str, message: impl Into<String>) -> Self {
        ConvError::DeviceDispatch {
            kernel: kernel.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvError>;
