//! Directory traversal for recursive uploads: expands a dropped directory
//! into flat (content, relative path) pairs and materializes the remote
//! directory skeleton before any file is queued.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::remote::{ContentSource, EntryNode, EntrySource, ExecChannel, SpawnOptions};

/// One file discovered under a traversal root.
pub struct TraversedFile {
    pub source: Arc<dyn ContentSource>,
    /// Path relative to the traversal root's parent, starting with the root's
    /// own name (`root_name/sub/file.txt`).
    pub relative_path: String,
}

/// Recursively expand a directory into a flat file list.
///
/// The underlying listing API may return children in multiple non-empty
/// batches before signaling exhaustion with an empty one, so each directory
/// is read until an empty batch comes back. Results are sorted by relative
/// path for a stable upload order.
pub async fn traverse(root: Box<dyn EntrySource>, root_name: &str) -> Result<Vec<TraversedFile>> {
    let mut files = Vec::new();
    let mut stack: Vec<(String, Box<dyn EntrySource>)> = vec![(root_name.to_string(), root)];

    while let Some((prefix, mut dir)) = stack.pop() {
        loop {
            let batch = dir.next_batch().await?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                let path = format!("{prefix}/{}", entry.name);
                match entry.node {
                    EntryNode::File(source) => files.push(TraversedFile {
                        source,
                        relative_path: path,
                    }),
                    EntryNode::Dir(sub) => stack.push((path, sub)),
                }
            }
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    debug!(count = files.len(), root = %root_name, "directory traversal complete");
    Ok(files)
}

/// Create every ancestor directory implied by `relative_paths` under
/// `target_path`, parents before children.
///
/// Lexicographic order satisfies the parent-first requirement because a
/// parent path is always a strict string prefix of its children's paths.
pub async fn ensure_directories(
    channel: &dyn ExecChannel,
    opts: &SpawnOptions,
    relative_paths: &[String],
    target_path: &str,
) -> Result<()> {
    let mut dirs = BTreeSet::new();
    for rp in relative_paths {
        let parts: Vec<&str> = rp.split('/').collect();
        // Last segment is the file name; everything before it is a directory
        // chain that must exist.
        for depth in 1..parts.len() {
            dirs.insert(parts[..depth].join("/"));
        }
    }

    for dir in dirs {
        let full = format!("{target_path}/{dir}");
        channel
            .run(&vec!["mkdir".into(), "-p".into(), full], opts, None)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::remote::{Entry, ProcessStream};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticContent(u64);

    #[async_trait]
    impl ContentSource for StaticContent {
        fn len(&self) -> u64 {
            self.0
        }
        async fn read_range(&self, _offset: u64, len: usize) -> Result<Vec<u8>> {
            Ok(vec![0; len])
        }
    }

    /// Serves a fixed set of children split into batches, then an empty batch.
    struct BatchedDir {
        batches: Vec<Vec<Entry>>,
    }

    #[async_trait]
    impl EntrySource for BatchedDir {
        async fn next_batch(&mut self) -> Result<Vec<Entry>> {
            if self.batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(self.batches.remove(0))
            }
        }
    }

    fn file(name: &str) -> Entry {
        Entry {
            name: name.into(),
            node: EntryNode::File(Arc::new(StaticContent(1))),
        }
    }

    fn dir(name: &str, batches: Vec<Vec<Entry>>) -> Entry {
        Entry {
            name: name.into(),
            node: EntryNode::Dir(Box::new(BatchedDir { batches })),
        }
    }

    #[tokio::test]
    async fn collects_files_across_multiple_batches() {
        // Two non-empty batches before exhaustion; a one-call reader would
        // miss b.txt and the subdirectory.
        let root = Box::new(BatchedDir {
            batches: vec![
                vec![file("a.txt")],
                vec![file("b.txt"), dir("sub", vec![vec![file("c.txt")]])],
            ],
        });

        let files = traverse(root, "photos").await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["photos/a.txt", "photos/b.txt", "photos/sub/c.txt"]);
    }

    #[tokio::test]
    async fn empty_directory_yields_nothing() {
        let root = Box::new(BatchedDir { batches: vec![] });
        let files = traverse(root, "empty").await.unwrap();
        assert!(files.is_empty());
    }

    struct RecordingChannel {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ExecChannel for RecordingChannel {
        async fn run(
            &self,
            argv: &[String],
            _opts: &SpawnOptions,
            _stdin: Option<&[u8]>,
        ) -> Result<String> {
            self.calls.lock().unwrap().push(argv.to_vec());
            Ok(String::new())
        }

        async fn spawn_stream(
            &self,
            _argv: &[String],
            _opts: &SpawnOptions,
        ) -> Result<Box<dyn ProcessStream>> {
            Err(Error::Spawn {
                message: "unused".into(),
            })
        }
    }

    #[tokio::test]
    async fn creates_distinct_ancestors_parents_first() {
        let channel = RecordingChannel {
            calls: Mutex::new(Vec::new()),
        };
        let paths = vec![
            "photos/2024/summer/beach.jpg".to_string(),
            "photos/2024/winter/snow.jpg".to_string(),
            "photos/index.txt".to_string(),
        ];

        ensure_directories(&channel, &SpawnOptions::default(), &paths, "/srv/up")
            .await
            .unwrap();

        let calls = channel.calls.lock().unwrap();
        let dirs: Vec<&str> = calls.iter().map(|argv| argv[2].as_str()).collect();
        assert_eq!(
            dirs,
            vec![
                "/srv/up/photos",
                "/srv/up/photos/2024",
                "/srv/up/photos/2024/summer",
                "/srv/up/photos/2024/winter",
            ]
        );
        assert!(calls.iter().all(|argv| argv[0] == "mkdir" && argv[1] == "-p"));
    }
}
