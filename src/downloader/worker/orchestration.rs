//! Top-level transfer lifecycle -- open the temp file, negotiate the resume,
//! stream, verify and hand the outcome to the exit transition.

use crate::error::TransferError;
use crate::store::ProgressUpdate;
use crate::transport::{FetchRequest, FetchResponse, ResponseMeta};
use crate::types::{ErrorKind, Event};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncSeekExt;
use tokio::sync::OwnedSemaphorePermit;

use super::context::{ResumePoint, WorkerContext, WorkerOutcome};
use super::finalization::{finish, verify_and_move};
use super::stream::{StreamEnd, stream_body};

/// What the response means for the partial file
#[derive(Debug)]
pub(super) enum Negotiation {
    /// The body continues the temp file at the requested offset
    Continue(FetchResponse),
    /// Start over at byte 0, using this full body if present
    Restart {
        /// Why the partial file cannot be continued
        reason: TransferError,
        /// The new version's full body, when the server already sent it
        body: Option<FetchResponse>,
    },
}

/// Run one admitted task until it completes, fails or is stopped
///
/// The permit is the task's worker slot. It is released only after the exit
/// transition has been applied and the task left the active map.
pub(crate) async fn run_transfer(mut ctx: WorkerContext, permit: OwnedSemaphorePermit) {
    let outcome = execute(&mut ctx).await;
    finish(&ctx, outcome).await;
    drop(permit);
}

async fn execute(ctx: &mut WorkerContext) -> WorkerOutcome {
    match transfer(ctx).await {
        Ok(outcome) => outcome,
        Err(e) => WorkerOutcome::Failed(e),
    }
}

async fn transfer(ctx: &mut WorkerContext) -> Result<WorkerOutcome, TransferError> {
    let record = ctx
        .manager
        .store
        .get(ctx.id)
        .await
        .map_err(|e| TransferError::Io(e.to_string()))?;
    let url = record.source_url.clone();
    let mut resume = ResumePoint::from_record(&record);

    let (mut file, offset) = open_temp_file(&ctx.temp_path, resume.offset).await?;
    if offset < resume.offset {
        tracing::warn!(
            task_id = ctx.id.0,
            expected = resume.offset,
            "temp file shorter than resume offset, restarting from 0"
        );
        resume.reset();
        ctx.checkpoint(ProgressUpdate::restart(None, None)).await?;
    }

    tracing::info!(
        task_id = ctx.id.0,
        offset = resume.offset,
        attempt = record.attempt_count + 1,
        "starting transfer"
    );

    // Everything already on disk: skip the network and verify
    if resume.offset > 0 && resume.total_bytes == Some(resume.offset) {
        drop(file);
        return finish_body(ctx, &record.destination_path, resume.offset, resume.total_bytes).await;
    }

    let restart_without_range = ctx.manager.config.download.restart_without_range;
    loop {
        if ctx.stop.is_stopped() {
            return Ok(WorkerOutcome::Stopped);
        }

        let request = FetchRequest {
            url: url.clone(),
            offset: resume.offset,
            validator: resume.validator.clone().filter(|_| resume.offset > 0),
        };

        let result = tokio::select! {
            biased;
            _ = ctx.stop.stopped() => return Ok(WorkerOutcome::Stopped),
            result = ctx.manager.transport.fetch(&request) => result,
        };

        let response = match negotiate(&resume, result, restart_without_range)? {
            Negotiation::Continue(response) => {
                if resume.offset == 0 && !response.meta.supports_range {
                    tracing::debug!(
                        task_id = ctx.id.0,
                        "server does not advertise byte ranges, an interrupted transfer restarts"
                    );
                }
                // Capture what the server now says about the resource
                resume.total_bytes = response.meta.total_bytes.or(resume.total_bytes);
                resume.validator = response.meta.validator.clone().or(resume.validator);
                ctx.checkpoint(ProgressUpdate {
                    bytes_downloaded: resume.offset,
                    total_bytes: resume.total_bytes,
                    validator: resume.validator.clone(),
                    restarted: false,
                })
                .await?;
                response
            }
            Negotiation::Restart { reason, body } => {
                let meta = body.as_ref().map(|response| response.meta.clone());
                restart_from_zero(ctx, &mut file, &mut resume, &reason, meta).await?;
                match body {
                    Some(response) => response,
                    // Fetch the whole resource on the next pass
                    None => continue,
                }
            }
        };

        let end = stream_body(
            ctx,
            &mut file,
            resume.offset,
            resume.total_bytes,
            resume.validator.clone(),
            response.body,
        )
        .await?;

        return match end {
            StreamEnd::Stopped => Ok(WorkerOutcome::Stopped),
            StreamEnd::Finished(written) => {
                drop(file);
                finish_body(ctx, &record.destination_path, written, resume.total_bytes).await
            }
        };
    }
}

async fn finish_body(
    ctx: &WorkerContext,
    destination: &Path,
    written: u64,
    total_bytes: Option<u64>,
) -> Result<WorkerOutcome, TransferError> {
    if verify_and_move(ctx, destination, written, total_bytes).await? {
        Ok(WorkerOutcome::Completed)
    } else {
        Ok(WorkerOutcome::Stopped)
    }
}

/// Truncate the temp file and persist a restart at byte 0
async fn restart_from_zero(
    ctx: &mut WorkerContext,
    file: &mut File,
    resume: &mut ResumePoint,
    reason: &TransferError,
    meta: Option<ResponseMeta>,
) -> Result<(), TransferError> {
    ctx.restarts += 1;
    let limit = ctx.manager.config.download.max_stale_restarts;
    if ctx.restarts > limit {
        return Err(TransferError::TooManyRestarts(ctx.restarts));
    }

    file.set_len(0).await.map_err(|e| TransferError::from_io(&e))?;
    file.seek(SeekFrom::Start(0))
        .await
        .map_err(|e| TransferError::from_io(&e))?;

    resume.reset();
    if let Some(meta) = meta {
        resume.total_bytes = meta.total_bytes;
        resume.validator = meta.validator;
    }

    ctx.checkpoint(ProgressUpdate::restart(
        resume.total_bytes,
        resume.validator.clone(),
    ))
    .await?;

    tracing::info!(
        task_id = ctx.id.0,
        restarts = ctx.restarts,
        reason = %reason,
        "restarting from byte 0"
    );
    ctx.manager.emit_event(Event::TransferRestarted { id: ctx.id });
    Ok(())
}

/// Decide whether a response continues the partial file
///
/// - a stale validator (412, 416 past byte 0) restarts without a body
/// - a 206 must start exactly at the requested offset; a changed validator
///   or total size restarts
/// - a 200 to a range request restarts when the validator changed and is
///   otherwise a range-unsupported failure, unless `restart_without_range`
pub(super) fn negotiate(
    resume: &ResumePoint,
    result: Result<FetchResponse, TransferError>,
    restart_without_range: bool,
) -> Result<Negotiation, TransferError> {
    let response = match result {
        Ok(response) => response,
        Err(e) if e.kind() == ErrorKind::ValidatorStale => {
            tracing::debug!(error = %e, "server reports stale validator");
            return Ok(Negotiation::Restart {
                reason: e,
                body: None,
            });
        }
        Err(e) => return Err(e),
    };

    let meta = &response.meta;
    if resume.offset == 0 {
        if meta.is_partial() && meta.start_offset != 0 {
            return Err(TransferError::ContentRangeMismatch {
                requested: 0,
                actual: meta.start_offset,
            });
        }
        return Ok(Negotiation::Continue(response));
    }

    if meta.is_partial() {
        if meta.start_offset != resume.offset {
            return Err(TransferError::ContentRangeMismatch {
                requested: resume.offset,
                actual: meta.start_offset,
            });
        }
        let validator_changed = matches!(
            (&resume.validator, &meta.validator),
            (Some(stored), Some(current)) if stored != current
        );
        if validator_changed {
            return Ok(Negotiation::Restart {
                reason: changed(resume, meta),
                body: None,
            });
        }
        if let (Some(stored), Some(current)) = (resume.total_bytes, meta.total_bytes)
            && stored != current
        {
            return Ok(Negotiation::Restart {
                reason: TransferError::LengthMismatch {
                    expected: stored,
                    actual: current,
                },
                body: None,
            });
        }
        return Ok(Negotiation::Continue(response));
    }

    // Full body in answer to a range request
    match &resume.validator {
        Some(stored) if meta.validator.as_ref() != Some(stored) => Ok(Negotiation::Restart {
            reason: changed(resume, meta),
            body: Some(response),
        }),
        _ if restart_without_range => Ok(Negotiation::Restart {
            reason: TransferError::RangeUnsupported,
            body: Some(response),
        }),
        _ => Err(TransferError::RangeUnsupported),
    }
}

fn changed(resume: &ResumePoint, meta: &ResponseMeta) -> TransferError {
    TransferError::ValidatorChanged {
        stored: resume.validator.clone(),
        current: meta.validator.clone(),
    }
}

/// Open the temp file positioned at the usable resume offset
///
/// Returns the offset actually usable: 0 when the file is shorter than
/// `resume_offset`. Any unflushed tail past the offset is dropped.
async fn open_temp_file(path: &Path, resume_offset: u64) -> Result<(File, u64), TransferError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| TransferError::from_io(&e))?;

    let len = file
        .metadata()
        .await
        .map_err(|e| TransferError::from_io(&e))?
        .len();
    let offset = if len < resume_offset { 0 } else { resume_offset };

    file.set_len(offset)
        .await
        .map_err(|e| TransferError::from_io(&e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| TransferError::from_io(&e))?;

    Ok((file, offset))
}
