//! End-to-end runs over the local channel: real `bash`, `base64` and `mkdir`
//! subprocesses moving real bytes through the queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use transferq::remote::{FileSource, LocalDirSource, LocalExecChannel, SpawnOptions};
use transferq::{OperationStatus, Scheduler, CHUNK_SIZE};

fn local_scheduler() -> Scheduler {
    Scheduler::with_options(Arc::new(LocalExecChannel::new()), SpawnOptions::default())
}

async fn drained(queue: &Scheduler) {
    tokio::time::timeout(Duration::from_secs(30), queue.drained())
        .await
        .expect("queue did not drain in time");
}

#[tokio::test]
async fn upload_round_trips_through_real_processes() -> Result<()> {
    let src_dir = tempfile::tempdir()?;
    let dst_dir = tempfile::tempdir()?;

    // Larger than two chunks so both the truncating and appending writes run.
    let payload: Vec<u8> = (0..2 * CHUNK_SIZE + 12345).map(|i| (i % 256) as u8).collect();
    let src_path = src_dir.path().join("payload.bin");
    tokio::fs::write(&src_path, &payload).await?;

    let queue = local_scheduler();
    let source = FileSource::open(&src_path).await?;
    let dest = dst_dir.path().join("out").join("payload.bin");
    queue.enqueue_upload(Arc::new(source), dest.to_string_lossy());
    drained(&queue).await;

    let state = queue.state();
    assert_eq!(state.operations[0].status, OperationStatus::Done);
    assert_eq!(state.operations[0].progress, 100);

    let written = tokio::fs::read(&dest).await?;
    assert_eq!(written, payload);
    Ok(())
}

#[tokio::test]
async fn zero_length_upload_creates_an_empty_file() -> Result<()> {
    let src_dir = tempfile::tempdir()?;
    let dst_dir = tempfile::tempdir()?;

    let src_path = src_dir.path().join("empty.bin");
    tokio::fs::write(&src_path, b"").await?;

    let queue = local_scheduler();
    let source = FileSource::open(&src_path).await?;
    let dest = dst_dir.path().join("empty.bin");
    queue.enqueue_upload(Arc::new(source), dest.to_string_lossy());
    drained(&queue).await;

    assert_eq!(queue.state().operations[0].status, OperationStatus::Done);
    let meta = tokio::fs::metadata(&dest).await?;
    assert_eq!(meta.len(), 0);
    Ok(())
}

#[tokio::test]
async fn directory_upload_recreates_the_tree() -> Result<()> {
    let src_dir = tempfile::tempdir()?;
    let dst_dir = tempfile::tempdir()?;

    let root = src_dir.path().join("album");
    tokio::fs::create_dir_all(root.join("2024/summer")).await?;
    tokio::fs::write(root.join("cover.jpg"), b"cover bytes").await?;
    tokio::fs::write(root.join("2024/summer/beach.jpg"), b"beach bytes").await?;

    let queue = local_scheduler();
    let ids = queue
        .enqueue_directory(
            Box::new(LocalDirSource::new(&root)),
            "album",
            &dst_dir.path().to_string_lossy(),
        )
        .await?;
    assert_eq!(ids.len(), 2);
    drained(&queue).await;

    let state = queue.state();
    assert_eq!(state.done_count(), 2);

    let cover = tokio::fs::read(dst_dir.path().join("album/cover.jpg")).await?;
    assert_eq!(cover, b"cover bytes");
    let beach = tokio::fs::read(dst_dir.path().join("album/2024/summer/beach.jpg")).await?;
    assert_eq!(beach, b"beach bytes");
    Ok(())
}
