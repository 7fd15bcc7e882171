//! `ContinueCopy`: resume a checkpointed copy in a fresh invocation.

use super::{WorkerContext, copy_session::run_copy};
use crate::{
    errors::{CopyError, CopyResult},
    models::job::ProblemKind,
    services::job_assignment::JobAssignmentHelper,
};
use tracing::info;

pub async fn continue_copy(ctx: &WorkerContext, job: &JobAssignmentHelper) -> CopyResult<()> {
    let assignment = job.load().await?;
    if assignment.status.is_terminal() {
        info!(status = ?assignment.status, "job assignment already finished, not continuing");
        return Ok(());
    }

    let state = ctx.services.checkpoints().load(job.id()).await?;
    if state.is_empty() {
        return Err(CopyError::rejected(
            ProblemKind::GenericFailure,
            "Failed to retrieve remaining work items from database",
            format!("No checkpoint found for job assignment '{}'", job.id()),
        ));
    }
    info!(
        work_items = state.work_items.len(),
        files_copied = state.files_copied,
        files_total = state.files_total,
        "resuming copy"
    );

    let mut copier = ctx.services.file_copier();
    copier.set_state(state)?;
    run_copy(ctx, job, copier).await
}
