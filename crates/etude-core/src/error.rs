use std::io;
use thiserror::Error;

/// Central error type for the etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid startup configuration (thread count, queue depth, document root...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A raw syscall failed; carries the call name for the log line.
    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: io::Error,
    },
}

impl EtudeError {
    pub fn config(msg: impl Into<String>) -> Self {
        EtudeError::Config(msg.into())
    }

    /// Capture `errno` for a failed libc call.
    pub(crate) fn last_os(call: &'static str) -> Self {
        EtudeError::Syscall {
            call,
            source: io::Error::last_os_error(),
        }
    }
}

pub type EtudeResult<T> = Result<T, EtudeError>;
