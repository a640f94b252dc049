use std::io;
use thiserror::Error;

/// Central error type for the webserv engine.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pooled external resource had no free handle.
    #[error("Resource pool is busy")]
    PoolBusy,
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let err: ServerError = io::Error::from(io::ErrorKind::AddrInUse).into();
        assert!(matches!(err, ServerError::Io(ref e) if e.kind() == io::ErrorKind::AddrInUse));
    }

    #[test]
    fn display_messages() {
        assert_eq!(ServerError::PoolBusy.to_string(), "Resource pool is busy");
        assert_eq!(
            ServerError::Config("bad port".into()).to_string(),
            "Configuration error: bad port"
        );
    }
}
