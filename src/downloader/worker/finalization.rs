//! Transfer finalization -- verify the temp file, move it into place and
//! apply the exit transition.

use crate::error::{Result, TransferError};
use crate::retry::RetryDecision;
use crate::store::Transition;
use crate::types::{ErrorKind, Event, Status};
use crate::utils::sha256_file;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::super::StopReason;
use super::context::{WorkerContext, WorkerOutcome};

/// Check length and checksum, then rename the temp file to `destination`
///
/// Returns `false` without touching the destination when a stop signal
/// arrived before the rename.
pub(super) async fn verify_and_move(
    ctx: &WorkerContext,
    destination: &Path,
    written: u64,
    total_bytes: Option<u64>,
) -> std::result::Result<bool, TransferError> {
    if let Some(expected) = total_bytes
        && written != expected
    {
        return Err(TransferError::LengthMismatch {
            expected,
            actual: written,
        });
    }

    let expected_sha256 = ctx
        .manager
        .store
        .get(ctx.id)
        .await
        .map_err(|e| TransferError::Io(e.to_string()))?
        .expected_sha256;
    if let Some(expected) = expected_sha256 {
        let actual = sha256_file(&ctx.temp_path)
            .await
            .map_err(|e| TransferError::from_io(&e))?;
        if !actual.eq_ignore_ascii_case(&expected) {
            return Err(TransferError::ChecksumMismatch { expected, actual });
        }
        tracing::debug!(task_id = ctx.id.0, "checksum verified");
    }

    if ctx.stop.is_stopped() {
        return Ok(false);
    }

    move_into_place(&ctx.temp_path, destination).await?;
    Ok(true)
}

/// Rename `temp` to `destination`, replacing an existing file
///
/// Across filesystems the file is copied next to the destination and that
/// copy renamed, so the destination never holds a partial file.
pub(super) async fn move_into_place(
    temp: &Path,
    destination: &Path,
) -> std::result::Result<(), TransferError> {
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::from_io(&e))?;
    }

    match tokio::fs::rename(temp, destination).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            let sibling = sibling_path(destination);
            let copied = async {
                tokio::fs::copy(temp, &sibling).await?;
                tokio::fs::rename(&sibling, destination).await?;
                tokio::fs::remove_file(temp).await
            }
            .await;

            copied.map_err(|e| {
                let _ = std::fs::remove_file(&sibling);
                TransferError::from_io(&e)
            })
        }
        Err(e) => Err(TransferError::from_io(&e)),
    }
}

fn sibling_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{name}.incoming"))
}

/// First wait before re-trying an exit transition the store could not persist
const EXIT_RETRY_INITIAL: Duration = Duration::from_millis(100);
/// Longest wait between exit transition attempts
const EXIT_RETRY_MAX: Duration = Duration::from_secs(5);

/// Side effects to run once the exit transition is committed
#[derive(Default)]
struct ExitEffects {
    remove_temp: bool,
}

/// Apply the exit transition for `outcome` and release the task
///
/// Runs under the active-transfer lock, so control operations either
/// signalled this worker or see the task's final state. A stop signal wins
/// over a failure but never over a completed rename; a removed task is
/// deleted even when it completed.
///
/// When the store cannot persist the transition the task keeps its entry in
/// the active map (and the caller its slot), admissions are halted and the
/// transition is attempted again until it lands.
pub(super) async fn finish(ctx: &WorkerContext, outcome: WorkerOutcome) {
    let manager = &ctx.manager;
    let id = ctx.id;
    let mut effects = ExitEffects::default();
    let mut delay = EXIT_RETRY_INITIAL;

    loop {
        let mut active = manager.queue_state.active_downloads.lock().await;
        match apply_exit(ctx, &outcome, &mut effects).await {
            Ok(()) => {
                active.remove(&id);
                break;
            }
            Err(e) if e.is_storage() => {
                drop(active);
                tracing::error!(
                    task_id = id.0,
                    error = %e,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "failed to persist exit transition, holding the slot"
                );
                manager.halt_admissions(format!("failed to persist state of task {id}: {e}"));
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(EXIT_RETRY_MAX);
            }
            Err(e) => {
                // The store refused the transition itself; retrying cannot help
                tracing::error!(task_id = id.0, error = %e, "failed to apply exit transition");
                active.remove(&id);
                break;
            }
        }
    }

    if effects.remove_temp {
        manager.remove_temp_file(id).await;
    }
    manager.wake_scheduler();
}

/// One attempt at the exit transition
///
/// Safe to repeat: a transition committed by an earlier attempt is not
/// applied again, only the pending delete of a removed task is.
async fn apply_exit(
    ctx: &WorkerContext,
    outcome: &WorkerOutcome,
    effects: &mut ExitEffects,
) -> Result<()> {
    let store = &ctx.manager.store;
    let id = ctx.id;
    let stop_reason = ctx.stop.reason();

    if store.status(id).await? == Status::Active {
        match (outcome, stop_reason) {
            (WorkerOutcome::Completed, _) => {
                tracing::info!(task_id = id.0, "transfer completed");
                store.update_status(id, Transition::Complete).await?;
            }
            (_, Some(reason)) => stop(ctx, reason, effects).await?,
            (WorkerOutcome::Stopped, None) => {
                // Not reachable through the control surface; keep the task resumable
                store.update_status(id, Transition::Requeue).await?;
            }
            (WorkerOutcome::Failed(error), None) => fail(ctx, error, effects).await?,
        }
    }

    if stop_reason == Some(StopReason::Remove) {
        store.delete(id).await?;
        tracing::info!(task_id = id.0, "transfer removed");
    }
    Ok(())
}

async fn stop(ctx: &WorkerContext, reason: StopReason, effects: &mut ExitEffects) -> Result<()> {
    let store = &ctx.manager.store;
    let id = ctx.id;

    match reason {
        StopReason::Requeue => {
            tracing::info!(task_id = id.0, "transfer requeued");
            store.update_status(id, Transition::Requeue).await?;
        }
        StopReason::Pause => {
            tracing::info!(task_id = id.0, "transfer paused");
            store.update_status(id, Transition::Pause).await?;
        }
        StopReason::Cancel => {
            tracing::info!(task_id = id.0, "transfer cancelled");
            effects.remove_temp = true;
            store.update_status(id, Transition::Cancel).await?;
        }
        StopReason::Remove => {
            // The record itself is deleted once this lands
            effects.remove_temp = true;
            store.update_status(id, Transition::Cancel).await?;
        }
    }
    Ok(())
}

async fn fail(ctx: &WorkerContext, error: &TransferError, effects: &mut ExitEffects) -> Result<()> {
    let manager = &ctx.manager;
    let id = ctx.id;
    let kind = error.kind();
    let attempts = manager.store.get(id).await?.attempt_count.saturating_add(1);
    let message = error.to_string();

    let fail_transition = |discard_partial| Transition::Fail {
        error: message.clone(),
        kind,
        attempts,
        discard_partial,
    };

    match kind {
        ErrorKind::StorageFatal => {
            tracing::error!(task_id = id.0, error = %error, "storage failure, halting admissions");
            manager.store.update_status(id, fail_transition(false)).await?;
            manager.halt_admissions(message.clone());
        }
        ErrorKind::Transient => {
            let decision = {
                let mut rng = manager.rng.lock().await;
                manager.retry.decide(attempts, kind, &mut *rng)
            };

            match decision {
                RetryDecision::Retry(delay) => {
                    let now = Utc::now();
                    let eligible_at = chrono::TimeDelta::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(now);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

                    tracing::warn!(
                        task_id = id.0,
                        attempt = attempts,
                        delay_ms,
                        error = %error,
                        "transient failure, retry scheduled"
                    );
                    manager
                        .store
                        .update_status(
                            id,
                            Transition::RetryLater {
                                error: message.clone(),
                                attempts,
                                eligible_at,
                            },
                        )
                        .await?;
                    manager.emit_event(Event::RetryScheduled {
                        id,
                        attempt: attempts,
                        delay_ms,
                        error: message.clone(),
                    });
                }
                RetryDecision::GiveUp => {
                    tracing::error!(
                        task_id = id.0,
                        attempt = attempts,
                        error = %error,
                        "retries exhausted, transfer failed"
                    );
                    manager.store.update_status(id, fail_transition(false)).await?;
                }
            }
        }
        ErrorKind::Permanent | ErrorKind::ValidatorStale => {
            let discard = error.discards_partial();
            tracing::error!(
                task_id = id.0,
                kind = kind.as_str(),
                error = %error,
                "transfer failed"
            );
            manager.store.update_status(id, fail_transition(discard)).await?;
            effects.remove_temp = discard;
        }
    }
    Ok(())
}
