use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TyperError {
    #[error("no active editor")]
    NoActiveEditor,
    #[error("no active recording: {0}")]
    NoActiveRecording(String),
    #[error("recording is empty: at least two buffers are required to save")]
    EmptyRecording,
    #[error("save cancelled")]
    SaveCancelled,
    #[error("edit application failed: {0}")]
    EditApplicationFailed(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("buffer list exhausted")]
    BufferListExhausted,
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
}

impl TyperError {
    /// Errors that end the attempted session and leave the controller idle.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::NoActiveEditor | Self::NoActiveRecording(_))
    }
}
