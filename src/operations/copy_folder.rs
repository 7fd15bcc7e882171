//! `CopyFolder` profile.

use super::{WorkerContext, copy_session::run_copy, folders::expand_folder};
use crate::{
    errors::CopyResult, models::locator::Locator, services::job_assignment::JobAssignmentHelper,
};
use serde::Deserialize;
use tracing::info;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CopyFolderInput {
    pub source_folder: Locator,
    pub destination_folder: Locator,
    #[serde(default)]
    pub source_egress_url: Option<String>,
}

pub async fn copy_folder(ctx: &WorkerContext, job: &JobAssignmentHelper) -> CopyResult<()> {
    let input = job.input::<CopyFolderInput>().await?;
    let pairs = expand_folder(
        &ctx.services.clients,
        &input.source_folder,
        &input.destination_folder,
        input.source_egress_url.as_deref(),
    )
    .await?;
    info!(
        source = input.source_folder.url(),
        destination = input.destination_folder.url(),
        files = pairs.len(),
        "copying folder"
    );

    let mut copier = ctx.services.file_copier();
    for (source, destination) in pairs {
        copier.add_file(source, destination);
    }
    run_copy(ctx, job, copier).await
}
