//! `RestoreFolder` profile: restore every archived object under an S3 prefix.

use super::{
    WorkerContext,
    folders::list_folder,
    restore_files::{
        ARCHIVE_STORAGE_CLASSES, parse_locator, required, restore_options, unsupported_locator,
    },
};
use crate::{
    errors::{CopyError, CopyResult},
    models::{job::ProblemKind, locator::Locator},
    services::job_assignment::JobAssignmentHelper,
};
use serde_json::Value;
use tracing::info;

pub async fn restore_folder(ctx: &WorkerContext, job: &JobAssignmentHelper) -> CopyResult<()> {
    let input = job.input::<Value>().await?;
    let folder = parse_locator(required(&input, "folder")?)?;
    let options = restore_options(&input)?;
    if !matches!(folder, Locator::S3(_)) {
        return Err(unsupported_locator(&folder));
    }

    let prefix = folder.object_path().unwrap_or_default().to_string();
    let archived: Vec<Locator> = list_folder(&ctx.services.clients, &folder)
        .await?
        .into_iter()
        .filter(|object| {
            object
                .storage_class
                .as_deref()
                .is_some_and(|class| ARCHIVE_STORAGE_CLASSES.contains(&class))
        })
        .filter_map(|object| {
            let relative = object.key.strip_prefix(&prefix).unwrap_or(&object.key);
            folder.with_path_suffix(relative)
        })
        .collect();
    if archived.is_empty() {
        return Err(CopyError::rejected(
            ProblemKind::NoSuitableObjectsDetected,
            "Provided input folder does not contain any suitable objects for restoring",
            format!("Provided input folder: '{}'", folder.url()),
        ));
    }

    let registry = ctx.services.restore_registry();
    for file in &archived {
        registry
            .request_restore(file, job.id(), options, &ctx.request_id)
            .await?;
    }
    info!(
        folder = folder.url(),
        files = archived.len(),
        priority = %options.priority,
        "folder restores requested, waiting for completion"
    );
    Ok(())
}
