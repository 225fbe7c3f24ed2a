//! Serial transfer and archive queue for remote file management.
//!
//! A [`Scheduler`] holds a FIFO queue of upload, compress and extract
//! operations and drains it one operation at a time over an
//! [`ExecChannel`](remote::ExecChannel). Progress and completion fan out as
//! [`QueueEvent`]s; cancellation is cooperative and always terminal as
//! `Cancelled`, never as an error.

pub mod error;
pub mod events;
pub mod operations;
pub mod remote;

pub use error::{Error, Result};
pub use events::{ListenerToken, QueueEvent};
pub use operations::{
    ArchiveFormat, AvailableTools, OperationId, OperationKind, OperationSnapshot, OperationStatus,
    QueueState, QueueStatus, Scheduler, CHUNK_SIZE,
};
