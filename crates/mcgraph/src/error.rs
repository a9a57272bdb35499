use crate::event::Event;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid event {0}")]
    InvalidEvent(Event),

    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(String),

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("config `{0}`")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is a defect in the checker itself (as opposed to a
    /// problem with the user's configuration or input).
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::InvalidEvent(_) | Error::InternalInvariantViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! bug {
    ($($arg:tt)*) => {
        $crate::error::Error::InternalInvariantViolation(format!($($arg)*))
    };
}

pub(crate) use bug;
