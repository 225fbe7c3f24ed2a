pub mod archive;
pub mod operation;
pub mod scheduler;
pub mod traverse;
pub mod upload;

pub use archive::{ArchiveFormat, AvailableTools};
pub use operation::{
    OperationId, OperationKind, OperationSnapshot, OperationStatus, Outcome, QueueState,
    QueueStatus,
};
pub use scheduler::Scheduler;
pub use traverse::{ensure_directories, traverse, TraversedFile};
pub use upload::CHUNK_SIZE;

/// Quote a string for safe interpolation into a shell command line.
pub(crate) fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::shell_escape;

    #[test]
    fn shell_escape_plain() {
        assert_eq!(shell_escape("/srv/data/report.txt"), "'/srv/data/report.txt'");
    }

    #[test]
    fn shell_escape_embedded_quote() {
        assert_eq!(shell_escape("it's"), r#"'it'\''s'"#);
    }
}
