use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::operations::archive::ArchiveFormat;
use crate::remote::ContentSource;

/// Unique, monotonically assigned operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Upload,
    Compress,
    Extract,
}

/// Lifecycle of one queued operation. The three terminal states are mutually
/// exclusive and final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
    Error,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

/// Aggregate idle/active state of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Idle,
    Active,
}

/// What a finished engine invocation reports. Failures travel separately as
/// [`Error`](crate::Error); cancellation is an outcome, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
}

/// Kind-specific payload. Each engine only ever receives the shape it
/// expects.
#[derive(Clone)]
pub(crate) enum OperationPayload {
    Upload {
        source: Arc<dyn ContentSource>,
        dest_path: String,
    },
    Compress {
        paths: Vec<String>,
        format: ArchiveFormat,
        output_path: String,
        parent_dir: String,
    },
    Extract {
        archive_path: String,
        dest_dir: String,
    },
}

impl OperationPayload {
    pub(crate) fn kind(&self) -> OperationKind {
        match self {
            Self::Upload { .. } => OperationKind::Upload,
            Self::Compress { .. } => OperationKind::Compress,
            Self::Extract { .. } => OperationKind::Extract,
        }
    }
}

impl fmt::Debug for OperationPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload { dest_path, .. } => {
                f.debug_struct("Upload").field("dest_path", dest_path).finish()
            }
            Self::Compress {
                format,
                output_path,
                ..
            } => f
                .debug_struct("Compress")
                .field("format", format)
                .field("output_path", output_path)
                .finish(),
            Self::Extract {
                archive_path,
                dest_dir,
            } => f
                .debug_struct("Extract")
                .field("archive_path", archive_path)
                .field("dest_dir", dest_dir)
                .finish(),
        }
    }
}

/// One queued unit of work. Mutated only by the scheduler's drain loop and by
/// cancellation requests.
#[derive(Debug, Clone)]
pub(crate) struct Operation {
    pub id: OperationId,
    pub display_name: String,
    pub status: OperationStatus,
    /// 0-100, non-decreasing while running, forced to 100 on success.
    pub progress: u8,
    /// Bytes for uploads, estimated item count for archive operations.
    pub total_units: u64,
    pub processed_units: u64,
    /// Present only when `status == Error`.
    pub error: Option<String>,
    pub payload: OperationPayload,
}

impl Operation {
    pub fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            id: self.id,
            kind: self.payload.kind(),
            display_name: self.display_name.clone(),
            status: self.status,
            progress: self.progress,
            total_units: self.total_units,
            processed_units: self.processed_units,
            error: self.error.clone(),
        }
    }
}

/// Immutable view of one operation, safe to hand to a UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    pub id: OperationId,
    pub kind: OperationKind,
    pub display_name: String,
    pub status: OperationStatus,
    pub progress: u8,
    pub total_units: u64,
    pub processed_units: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Defensive copy of the whole queue: ordered operations plus aggregate
/// status.
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub operations: Vec<OperationSnapshot>,
    pub status: QueueStatus,
}

impl QueueState {
    pub fn done_count(&self) -> usize {
        self.count(OperationStatus::Done)
    }

    pub fn error_count(&self) -> usize {
        self.count(OperationStatus::Error)
    }

    pub fn cancelled_count(&self) -> usize {
        self.count(OperationStatus::Cancelled)
    }

    pub fn running_count(&self) -> usize {
        self.count(OperationStatus::Running)
    }

    /// Sum of upload sizes across the queue, in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.operations
            .iter()
            .filter(|op| op.kind == OperationKind::Upload)
            .map(|op| op.total_units)
            .sum()
    }

    /// Bytes transferred so far across all uploads.
    pub fn processed_bytes(&self) -> u64 {
        self.operations
            .iter()
            .filter(|op| op.kind == OperationKind::Upload)
            .map(|op| op.processed_units)
            .sum()
    }

    fn count(&self, status: OperationStatus) -> usize {
        self.operations
            .iter()
            .filter(|op| op.status == status)
            .count()
    }
}
