use thiserror::Error;

use crate::operations::archive::ArchiveFormat;

/// Errors surfaced by the transfer engines.
///
/// Cancellation is deliberately not represented here: a cancelled operation
/// reports [`Outcome::Cancelled`](crate::operations::Outcome) instead of an
/// error, so it is never shown as a failure.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the local side (content source, process plumbing).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote execution channel reported a failed outcome.
    #[error("{message}")]
    Transport { message: String },

    /// A command could not be spawned at all.
    #[error("failed to spawn command: {message}")]
    Spawn { message: String },

    /// The archive format could not be derived from the file name.
    #[error("unknown archive format: {name}")]
    UnknownFormat { name: String },

    /// The format is recognized but not supported for this operation
    /// (e.g. rar compression).
    #[error("unsupported format: {format}")]
    UnsupportedFormat { format: ArchiveFormat },
}

/// Convenience result type for transferq operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_display_is_bare_message() {
        let err = Error::Transport {
            message: "tar: option requires an argument".into(),
        };
        assert_eq!(err.to_string(), "tar: option requires an argument");
    }

    #[test]
    fn unknown_format_display() {
        let err = Error::UnknownFormat {
            name: "notes.txt".into(),
        };
        assert_eq!(err.to_string(), "unknown archive format: notes.txt");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
