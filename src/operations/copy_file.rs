//! `CopyFile` profile: one file, copied in a single invocation.

use super::WorkerContext;
use crate::{
    errors::CopyResult,
    models::{
        job::{ProblemDetail, ProblemKind},
        locator::Locator,
        work_item::{DestinationFile, SourceFile},
    },
    services::{job_assignment::JobAssignmentHelper, transfer::TransferOutcome},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CopyFileInput {
    pub source_file: Locator,
    #[serde(alias = "targetFile")]
    pub destination_file: Locator,
    #[serde(default, alias = "alternateUrl")]
    pub source_egress_url: Option<String>,
    #[serde(default, alias = "alternateAuthType")]
    pub source_egress_auth_type: Option<String>,
}

impl CopyFileInput {
    fn into_files(self) -> (SourceFile, DestinationFile) {
        let mut source = SourceFile::new(self.source_file);
        source.egress_url = self.source_egress_url;
        source.egress_auth_type = self.source_egress_auth_type;
        (source, DestinationFile::new(self.destination_file))
    }
}

pub async fn copy_file(ctx: &WorkerContext, job: &JobAssignmentHelper) -> CopyResult<()> {
    let (source, destination) = job.input::<CopyFileInput>().await?.into_files();

    match ctx
        .services
        .transfer_selector()
        .copy_file(&source, &destination)
        .await
    {
        Ok(outcome) => {
            let skipped = outcome == TransferOutcome::Skipped;
            info!(
                source = source.locator.url(),
                destination = destination.locator.url(),
                skipped,
                "file copied"
            );
            job.complete(Some(json!({ "destinationFile": destination.locator })))
                .await
        }
        Err(e) => {
            job.fail(ProblemDetail::new(
                ProblemKind::CopyFailure,
                "Failure while copying file",
                Some(e.to_string()),
            ))
            .await
        }
    }
}
