use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompositeError>;

/// Failure of a single render request.
///
/// Everything except [`CompositeError::BackendUnavailable`] is local to the
/// request that produced it. Nothing is retried automatically.
#[derive(Error, Debug)]
pub enum CompositeError {
    /// Malformed or out-of-range template configuration.
    #[error("invalid template field `{field}`: {message}")]
    Validation { field: String, message: String },

    /// Degenerate or unreadable user image.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// The requested operations cannot be expressed as a consistent graph.
    #[error("cannot build filter graph: {0}")]
    GraphBuild(String),

    /// ffmpeg/ffprobe cannot be found or started.
    #[error("media backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend ran and exited with a failure status.
    #[error("encode failed (exit code {code:?}):\n{diagnostics}")]
    Encode {
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("render cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CompositeError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_image(message: impl Into<String>) -> Self {
        Self::InvalidImage(message.into())
    }

    pub fn graph(message: impl Into<String>) -> Self {
        Self::GraphBuild(message.into())
    }

    /// Fatal for the whole process rather than just the current request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }

    /// Offending field for validation failures.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}
