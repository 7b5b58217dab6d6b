use tracing::{info, warn};
use uuid::Uuid;

use crate::converter::ConvertRequest;
use crate::runner::{RunContext, RunError, RunResult};
use crate::types_jobs::{ExportSpec, JobEvent, JobKind, JobState};

pub async fn run(ctx: &RunContext, spec: ExportSpec) -> RunResult<JobEvent> {
    let workdir = ctx
        .state
        .cfg
        .converter_workdir
        .join(format!("{}-{}", ctx.name(), Uuid::new_v4()));

    // Dropping the conversion future kills the converter process.
    let outcome = tokio::select! {
        biased;
        _ = ctx.token.cancelled() => Err(RunError::Canceled),
        res = steps(ctx, &spec, &workdir) => res,
    };

    if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(job = %ctx.name(), dir = %workdir.display(), "failed to clean converter workdir: {e}");
        }
    }
    outcome
}

async fn steps(ctx: &RunContext, spec: &ExportSpec, workdir: &std::path::Path) -> RunResult<JobEvent> {
    let state = &ctx.state;
    let format = spec
        .format
        .ok_or_else(|| RunError::Failed("export has no format".to_string()))?;

    let build = state
        .jobs
        .get(JobKind::Build, &spec.source_build_name)
        .await?
        .ok_or_else(|| RunError::Failed(format!("source ImageBuild {:?} not found", spec.source_build_name)))?;
    let image_reference = match (build.state(), build.status.image_reference) {
        (JobState::Completed, Some(r)) => r,
        (s, _) => {
            return Err(RunError::Failed(format!(
                "source ImageBuild {:?} is {s}, not Completed",
                spec.source_build_name
            )))
        }
    };

    tokio::fs::create_dir_all(workdir)
        .await
        .map_err(|e| RunError::Failed(format!("creating converter workdir: {e}")))?;

    ctx.log.append(format!("Converting {image_reference} to {}", format.as_str()));
    let output = state
        .converter
        .convert(
            ConvertRequest {
                image_reference: &image_reference,
                format,
                output_dir: workdir,
            },
            ctx.log.clone(),
        )
        .await?;
    ctx.checkpoint()?;

    let file_name = format!("{}.{}", ctx.name(), format.as_str());
    let artifact = state
        .artifacts
        .store(ctx.name(), &file_name, &output)
        .await
        .map_err(|e| RunError::Failed(format!("storing artifact: {e}")))?;
    if artifact.size == 0 {
        if let Err(e) = state.artifacts.remove(ctx.name()).await {
            warn!(job = %ctx.name(), "failed to remove empty artifact: {e}");
        }
        return Err(RunError::Failed(format!(
            "converter produced an empty {} artifact for {image_reference}",
            format.as_str()
        )));
    }
    ctx.log.append(format!("Stored {} ({} bytes, {})", artifact.file_name, artifact.size, artifact.digest));
    info!(job = %ctx.name(), file = %artifact.file_name, size = artifact.size, "export stored");

    Ok(JobEvent::ExportCompleted { artifact })
}
