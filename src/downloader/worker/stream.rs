//! Body streaming into the temp file with periodic durable checkpoints.

use crate::error::TransferError;
use crate::store::ProgressUpdate;
use crate::transport::ByteStream;
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;

use super::context::WorkerContext;

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// How the body stream ended
#[derive(Debug, PartialEq, Eq)]
pub(super) enum StreamEnd {
    /// Every byte was received; carries the file length
    Finished(u64),
    /// A stop signal arrived; everything received was flushed
    Stopped,
}

/// Progress bookkeeping for one body
struct Checkpointer {
    written: u64,
    flushed: u64,
    last_flush: Instant,
    total_bytes: Option<u64>,
    validator: Option<String>,
}

impl Checkpointer {
    fn pending(&self) -> u64 {
        self.written - self.flushed
    }

    async fn flush(
        &mut self,
        ctx: &WorkerContext,
        writer: &mut BufWriter<&mut File>,
    ) -> Result<(), TransferError> {
        writer.flush().await.map_err(|e| TransferError::from_io(&e))?;
        writer
            .get_ref()
            .sync_data()
            .await
            .map_err(|e| TransferError::from_io(&e))?;

        ctx.checkpoint(ProgressUpdate {
            bytes_downloaded: self.written,
            total_bytes: self.total_bytes,
            validator: self.validator.clone(),
            restarted: false,
        })
        .await?;

        self.flushed = self.written;
        self.last_flush = Instant::now();
        Ok(())
    }
}

/// Append `body` to `file`, which is positioned at `start`
///
/// Progress is flushed and recorded every `download.flush_bytes` bytes or
/// `download.flush_interval`, whichever comes first, and once more when the
/// stream ends, fails or is stopped. Bytes beyond a known total are rejected
/// before they reach the file.
pub(super) async fn stream_body(
    ctx: &WorkerContext,
    file: &mut File,
    start: u64,
    total_bytes: Option<u64>,
    validator: Option<String>,
    mut body: ByteStream,
) -> Result<StreamEnd, TransferError> {
    let flush_bytes = ctx.manager.config.download.flush_bytes;
    let flush_interval = ctx.manager.config.download.flush_interval;

    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
    let mut progress = Checkpointer {
        written: start,
        flushed: start,
        last_flush: Instant::now(),
        total_bytes,
        validator,
    };

    loop {
        let deadline = progress.last_flush + flush_interval;
        tokio::select! {
            biased;

            _ = ctx.stop.stopped() => {
                progress.flush(ctx, &mut writer).await?;
                tracing::debug!(task_id = ctx.id.0, bytes = progress.written, "stopped while streaming");
                return Ok(StreamEnd::Stopped);
            }

            _ = tokio::time::sleep_until(deadline), if progress.pending() > 0 => {
                progress.flush(ctx, &mut writer).await?;
            }

            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    let len = bytes.len() as u64;
                    if let Some(total) = progress.total_bytes
                        && progress.written + len > total
                    {
                        return Err(TransferError::LengthMismatch {
                            expected: total,
                            actual: progress.written + len,
                        });
                    }

                    writer
                        .write_all(&bytes)
                        .await
                        .map_err(|e| TransferError::from_io(&e))?;
                    progress.written += len;

                    if progress.pending() >= flush_bytes
                        || progress.last_flush.elapsed() >= flush_interval
                    {
                        progress.flush(ctx, &mut writer).await?;
                    }
                }
                Some(Err(e)) => {
                    // Keep what arrived so the retry resumes after it
                    if let Err(flush_err) = progress.flush(ctx, &mut writer).await {
                        tracing::warn!(
                            task_id = ctx.id.0,
                            error = %flush_err,
                            "final flush after stream error failed"
                        );
                    }
                    return Err(e);
                }
                None => {
                    if progress.pending() > 0 {
                        progress.flush(ctx, &mut writer).await?;
                    }
                    return Ok(StreamEnd::Finished(progress.written));
                }
            }
        }
    }
}
