//! `RestoreFile` and `RestoreFiles` profiles.
//!
//! Both validate every file first and only then register the restores. The
//! job stays running; the restore monitor schedules `CompleteRestore` once
//! every object it waits on is back.

use super::WorkerContext;
use crate::{
    errors::{CopyError, CopyResult},
    models::{job::ProblemKind, locator::Locator, restore::RestorePriority},
    services::{job_assignment::JobAssignmentHelper, restore_registry::RestoreOptions},
};
use serde_json::Value;
use tracing::info;

/// Storage classes whose objects must be restored before they can be read.
pub const ARCHIVE_STORAGE_CLASSES: [&str; 2] = ["GLACIER", "DEEP_ARCHIVE"];

const DEFAULT_DURATION_IN_DAYS: u32 = 3;

pub async fn restore_file(ctx: &WorkerContext, job: &JobAssignmentHelper) -> CopyResult<()> {
    let input = job.input::<Value>().await?;
    let file = parse_locator(required(&input, "file")?)?;
    let options = restore_options(&input)?;
    request_restores(ctx, job, vec![file], options).await
}

pub async fn restore_files(ctx: &WorkerContext, job: &JobAssignmentHelper) -> CopyResult<()> {
    let input = job.input::<Value>().await?;
    let files = match required(&input, "files")? {
        Value::Array(values) if !values.is_empty() => values
            .iter()
            .map(parse_locator)
            .collect::<CopyResult<Vec<_>>>()?,
        _ => return Err(missing("files")),
    };
    let options = restore_options(&input)?;
    request_restores(ctx, job, files, options).await
}

async fn request_restores(
    ctx: &WorkerContext,
    job: &JobAssignmentHelper,
    files: Vec<Locator>,
    options: RestoreOptions,
) -> CopyResult<()> {
    for file in &files {
        check_archived(ctx, file).await?;
    }

    let registry = ctx.services.restore_registry();
    for file in &files {
        registry
            .request_restore(file, job.id(), options, &ctx.request_id)
            .await?;
    }
    info!(
        files = files.len(),
        priority = %options.priority,
        days = options.duration_in_days,
        "restores requested, waiting for completion"
    );
    Ok(())
}

async fn check_archived(ctx: &WorkerContext, file: &Locator) -> CopyResult<()> {
    let Locator::S3(object) = file else {
        return Err(unsupported_locator(file));
    };
    let client = ctx
        .services
        .clients
        .get_s3_client(&object.bucket, object.region.as_deref())
        .await?;
    let metadata = client
        .head_object(object)
        .await?
        .ok_or_else(|| CopyError::InvalidInput(format!("object `{}` does not exist", object.url)))?;

    let storage_class = metadata.storage_class.as_deref().unwrap_or("STANDARD");
    if !ARCHIVE_STORAGE_CLASSES.contains(&storage_class) {
        return Err(CopyError::rejected(
            ProblemKind::ObjectInUnsupportedStorageClass,
            "Provided object is in unsupported storage class",
            format!(
                "Object {} in bucket {} is in storage class {}.",
                object.key, object.bucket, storage_class
            ),
        ));
    }
    Ok(())
}

/// `priority` and `durationInDays` from a restore job input, with defaults.
pub(crate) fn restore_options(input: &Value) -> CopyResult<RestoreOptions> {
    let priority = match input.get("priority") {
        None | Some(Value::Null) => RestorePriority::default(),
        Some(Value::String(s)) => s.parse().map_err(|detail: String| {
            CopyError::rejected(
                ProblemKind::PriorityTypeNotRecognized,
                "Provided input priority is not recognized",
                detail,
            )
        })?,
        Some(other) => {
            return Err(CopyError::rejected(
                ProblemKind::PriorityTypeNotRecognized,
                "Provided input priority is not recognized",
                format!("Value {} is not one of High, Medium, Low", other),
            ));
        }
    };

    let duration_in_days = match input.get("durationInDays") {
        None | Some(Value::Null) => DEFAULT_DURATION_IN_DAYS,
        Some(value) => value
            .as_u64()
            .filter(|days| *days > 0)
            .and_then(|days| u32::try_from(days).ok())
            .ok_or_else(|| {
                CopyError::rejected(
                    ProblemKind::DurationInDaysHasInvalidValue,
                    "Provided input durationInDays does not have a positive integer value",
                    format!("Value {} is not a positive integer", value),
                )
            })?,
    };

    Ok(RestoreOptions {
        priority,
        duration_in_days,
    })
}

pub(crate) fn required<'a>(input: &'a Value, name: &str) -> CopyResult<&'a Value> {
    match input.get(name) {
        None | Some(Value::Null) => Err(missing(name)),
        Some(value) => Ok(value),
    }
}

fn missing(name: &str) -> CopyError {
    CopyError::rejected(
        ProblemKind::MissingInputParameter,
        "Missing input parameter",
        format!("Missing input parameter '{}'", name),
    )
}

pub(crate) fn parse_locator(value: &Value) -> CopyResult<Locator> {
    serde_json::from_value(value.clone())
        .map_err(|e| CopyError::InvalidInput(format!("locator: {}", e)))
}

pub(crate) fn unsupported_locator(locator: &Locator) -> CopyError {
    CopyError::rejected(
        ProblemKind::LocatorTypeNotSupported,
        "Provided input locator type is not supported",
        format!("Locator type '{}' is not supported", locator.type_name()),
    )
}
