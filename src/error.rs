use thiserror::Error;

#[derive(Error, Debug)]
pub enum IspError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serial channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Chip erase limit reached; restart the programmer to continue")]
    EraseLimitReached,
}

pub type IspResult<T> = std::result::Result<T, IspError>;
