//! Chunked upload engine: transmits one content source's bytes to a remote
//! destination as an ordered sequence of fixed-size, base64-encoded writes.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

use crate::error::{Error, Result};
use crate::operations::operation::Outcome;
use crate::operations::scheduler::OpContext;
use crate::operations::shell_escape;
use crate::remote::{ContentSource, ExecChannel, SpawnOptions};

/// Bytes per remote write.
pub const CHUNK_SIZE: usize = 256 * 1024;

pub(crate) struct UploadEngine {
    channel: Arc<dyn ExecChannel>,
    opts: SpawnOptions,
}

impl UploadEngine {
    pub fn new(channel: Arc<dyn ExecChannel>, opts: SpawnOptions) -> Self {
        Self { channel, opts }
    }

    /// Upload `source` to `dest_path`, reporting progress in exact bytes.
    ///
    /// The first chunk truncates the destination, every subsequent chunk
    /// appends; remote append has no addressing, so the order is mandatory.
    /// A cancellation mark is honored at the checkpoint before each chunk.
    pub async fn upload(
        &self,
        source: &Arc<dyn ContentSource>,
        dest_path: &str,
        ctx: &OpContext,
    ) -> Result<Outcome> {
        // Parent directory chain must exist (folder uploads land in
        // directories that may not have been created yet).
        if let Some(parent) = parent_dir(dest_path) {
            self.channel
                .run(&mkdir_argv(parent), &self.opts, None)
                .await?;
        }

        let total = source.len();
        debug!(dest = %dest_path, total, "starting upload");

        if total == 0 {
            // One truncating write with an empty payload.
            self.write_chunk(dest_path, b"", true).await?;
            return Ok(Outcome::Completed);
        }

        let mut offset = 0u64;
        let mut first = true;
        while offset < total {
            if ctx.is_cancelled() {
                debug!(dest = %dest_path, offset, "upload cancelled");
                return Ok(Outcome::Cancelled);
            }

            let want = CHUNK_SIZE.min((total - offset) as usize);
            let bytes = source.read_range(offset, want).await?;
            if bytes.is_empty() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("content source ended at {offset} of {total} bytes"),
                )));
            }

            self.write_chunk(dest_path, &bytes, first).await?;
            offset += bytes.len() as u64;
            first = false;

            ctx.advance_bytes(offset);
        }

        Ok(Outcome::Completed)
    }

    async fn write_chunk(&self, dest_path: &str, bytes: &[u8], first: bool) -> Result<()> {
        let encoded = BASE64.encode(bytes);
        let argv = write_argv(dest_path, first);
        self.channel
            .run(&argv, &self.opts, Some(encoded.as_bytes()))
            .await?;
        Ok(())
    }
}

/// The destination's parent directory, if it has one.
fn parent_dir(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

fn mkdir_argv(dir: &str) -> Vec<String> {
    vec!["mkdir".into(), "-p".into(), dir.into()]
}

/// Remote write command: decode base64 from stdin into the destination,
/// truncating on the first chunk and appending afterwards.
fn write_argv(dest_path: &str, first: bool) -> Vec<String> {
    let operator = if first { ">" } else { ">>" };
    vec![
        "bash".into(),
        "-c".into(),
        format!("base64 -d {operator} {}", shell_escape(dest_path)),
    ]
}
