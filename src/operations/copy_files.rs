//! `CopyFiles` profile: a list of transfers, each a file or a whole folder.

use super::{WorkerContext, copy_session::run_copy, folders::expand_folder};
use crate::{
    errors::{CopyError, CopyResult},
    models::{
        job::ProblemKind,
        locator::Locator,
        work_item::{DestinationFile, SourceFile},
    },
    services::job_assignment::JobAssignmentHelper,
};
use serde::Deserialize;
use tracing::info;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub source: Locator,
    #[serde(default)]
    pub source_egress_url: Option<String>,
    pub destination: Locator,
}

impl Transfer {
    fn is_folder(&self) -> bool {
        self.source.object_path().is_some_and(|path| path.ends_with('/'))
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CopyFilesInput {
    #[serde(default)]
    pub transfers: Vec<Transfer>,
}

pub async fn copy_files(ctx: &WorkerContext, job: &JobAssignmentHelper) -> CopyResult<()> {
    let input = job.input::<CopyFilesInput>().await?;
    if input.transfers.is_empty() {
        return Err(CopyError::rejected(
            ProblemKind::InvalidInput,
            "CopyFiles job profile requires property transfers as input with at least 1 element",
            "Property 'transfers' is missing or empty",
        ));
    }

    let mut copier = ctx.services.file_copier();
    let mut files = 0usize;
    for transfer in input.transfers {
        if transfer.is_folder() {
            let pairs = expand_folder(
                &ctx.services.clients,
                &transfer.source,
                &transfer.destination,
                transfer.source_egress_url.as_deref(),
            )
            .await?;
            files += pairs.len();
            for (source, destination) in pairs {
                copier.add_file(source, destination);
            }
        } else {
            let mut source = SourceFile::new(transfer.source);
            source.egress_url = transfer.source_egress_url;
            copier.add_file(source, DestinationFile::new(transfer.destination));
            files += 1;
        }
    }
    info!(files, "copy queued");

    run_copy(ctx, job, copier).await
}
