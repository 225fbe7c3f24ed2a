//! External collaborators the engines are written against: a remote execution
//! channel, random-access content sources, and batched directory listings.

pub mod local;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

pub use local::{FileSource, LocalDirSource, LocalExecChannel};

/// Options applied to every spawned command.
///
/// `superuser` requests privilege elevation from the channel ("try"
/// semantics: elevate when possible, run unelevated otherwise). Whether and
/// how elevation happens is a property of the channel implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOptions {
    pub superuser: bool,
}

/// A remote execution channel: runs named commands with arguments, optionally
/// piping bytes to stdin, and reports a success/failure exit outcome.
#[async_trait]
pub trait ExecChannel: Send + Sync {
    /// Run a command to completion, returning collected stdout.
    ///
    /// A failed exit maps to [`Error::Transport`](crate::Error::Transport)
    /// carrying the tool's message.
    async fn run(&self, argv: &[String], opts: &SpawnOptions, stdin: Option<&[u8]>)
        -> Result<String>;

    /// Spawn a command whose stdout is consumed line by line while it runs.
    async fn spawn_stream(
        &self,
        argv: &[String],
        opts: &SpawnOptions,
    ) -> Result<Box<dyn ProcessStream>>;
}

/// An in-flight streamed invocation.
#[async_trait]
pub trait ProcessStream: Send {
    /// Next line of output, or `None` once the stream is exhausted.
    async fn next_line(&mut self) -> Result<Option<String>>;

    /// Request termination of the invocation. Best effort.
    async fn terminate(&mut self) -> Result<()>;

    /// Wait for the exit outcome. Must be called after the stream is
    /// exhausted (or after `terminate`).
    async fn wait(&mut self) -> Result<()>;
}

/// A local file handle: reports its byte length and yields byte ranges on
/// demand.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Total byte length of the content.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `len` bytes starting at `offset`. Returns exactly the
    /// requested range unless it extends past the end of the content.
    async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

/// One child of a directory listing.
pub struct Entry {
    pub name: String,
    pub node: EntryNode,
}

/// A directory child is either a leaf with byte content or a directory that
/// can itself be listed.
pub enum EntryNode {
    File(Arc<dyn ContentSource>),
    Dir(Box<dyn EntrySource>),
}

/// A directory's immediate children, read in batches.
///
/// `next_batch` may return results in multiple non-empty calls before
/// signaling exhaustion with an empty one; callers must keep calling until
/// they see an empty batch.
#[async_trait]
pub trait EntrySource: Send {
    async fn next_batch(&mut self) -> Result<Vec<Entry>>;
}
