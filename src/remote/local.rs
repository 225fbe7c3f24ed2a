//! Local implementations of the collaborator traits, backed by
//! `tokio::process` and `tokio::fs`. Useful when the "remote" side is the
//! machine the engine runs on, and as the reference for channel semantics.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::remote::{ContentSource, Entry, EntryNode, EntrySource, ExecChannel, ProcessStream, SpawnOptions};

/// Executes commands as local subprocesses.
///
/// Privilege elevation is not performed; a `superuser` request is logged and
/// the command runs as the current user.
#[derive(Debug, Default, Clone)]
pub struct LocalExecChannel;

impl LocalExecChannel {
    pub fn new() -> Self {
        Self
    }

    fn command(argv: &[String], opts: &SpawnOptions) -> Result<Command> {
        let (program, args) = argv.split_first().ok_or_else(|| Error::Spawn {
            message: "empty argv".to_string(),
        })?;
        if opts.superuser {
            debug!(%program, "privilege elevation requested; local channel runs unelevated");
        }
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl ExecChannel for LocalExecChannel {
    async fn run(
        &self,
        argv: &[String],
        opts: &SpawnOptions,
        stdin: Option<&[u8]>,
    ) -> Result<String> {
        let mut cmd = Self::command(argv, opts)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|e| Error::Spawn {
            message: format!("{}: {e}", argv[0]),
        })?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(bytes).await?;
                pipe.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("{} exited with {}", argv[0], output.status)
            } else {
                stderr
            };
            Err(Error::Transport { message })
        }
    }

    async fn spawn_stream(
        &self,
        argv: &[String],
        opts: &SpawnOptions,
    ) -> Result<Box<dyn ProcessStream>> {
        let mut cmd = Self::command(argv, opts)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| Error::Spawn {
            message: format!("{}: {e}", argv[0]),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| Error::Spawn {
            message: "child stdout not captured".to_string(),
        })?;
        let lines = BufReader::new(stdout).lines();

        // Drain stderr concurrently so the child never blocks on it; the
        // collected text becomes the transport error message on failure.
        let stderr_task = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });

        Ok(Box::new(LocalProcessStream {
            program: argv[0].clone(),
            child,
            lines,
            stderr_task,
        }))
    }
}

struct LocalProcessStream {
    program: String,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<String>>,
}

#[async_trait]
impl ProcessStream for LocalProcessStream {
    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.next_line().await?)
    }

    async fn terminate(&mut self) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await?;
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if status.success() {
            Ok(())
        } else {
            let stderr = stderr.trim().to_string();
            let message = if stderr.is_empty() {
                format!("{} exited with {status}", self.program)
            } else {
                stderr
            };
            Err(Error::Transport { message })
        }
    }
}

/// Random-access reader over a local file. The handle is opened once and
/// held for the source's lifetime; the byte length is captured at open time.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: Mutex<fs::File>,
    len: u64,
}

impl FileSource {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = fs::File::open(&path).await?;
        let meta = file.metadata().await?;
        Ok(Self {
            len: meta.len(),
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ContentSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let want = len.min(self.len.saturating_sub(offset) as usize);
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                buf.truncate(filled);
                break;
            }
            filled += n;
        }
        Ok(buf)
    }
}

/// Lists a local directory's immediate children in bounded batches.
pub struct LocalDirSource {
    path: PathBuf,
    reader: Option<fs::ReadDir>,
    batch_size: usize,
    done: bool,
}

impl LocalDirSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            batch_size: 64,
            done: false,
        }
    }
}

#[async_trait]
impl EntrySource for LocalDirSource {
    async fn next_batch(&mut self) -> Result<Vec<Entry>> {
        if self.done {
            return Ok(Vec::new());
        }
        if self.reader.is_none() {
            self.reader = Some(fs::read_dir(&self.path).await?);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            match reader.next_entry().await? {
                Some(entry) => {
                    let file_type = entry.file_type().await?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if file_type.is_dir() {
                        batch.push(Entry {
                            name,
                            node: EntryNode::Dir(Box::new(LocalDirSource::new(entry.path()))),
                        });
                    } else if file_type.is_file() {
                        let source = FileSource::open(entry.path()).await?;
                        batch.push(Entry {
                            name,
                            node: EntryNode::File(Arc::new(source)),
                        });
                    }
                    // Symlinks and special files are not uploadable content.
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        Ok(batch)
    }
}
