use std::io;
use std::path::PathBuf;

/// Failures of the physical socket layer, below any framing.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot listen on {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },

    #[error("cannot reach server at {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },

    #[error("accepting a physical connection failed: {0}")]
    Accept(io::Error),

    #[error("physical socket error: {0}")]
    Io(#[from] io::Error),

    /// `sockaddr_un` cannot hold the path.
    #[error("socket path {path} is {len} bytes, the platform allows fewer than {max}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

impl TransportError {
    /// Unwrap the underlying I/O error, if this failure carries one.
    pub fn into_io(self) -> std::result::Result<io::Error, Self> {
        match self {
            Self::Bind { source, .. } | Self::Connect { source, .. } => Ok(source),
            Self::Accept(source) | Self::Io(source) => Ok(source),
            other @ Self::PathTooLong { .. } => Err(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
