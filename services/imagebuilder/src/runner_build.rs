use ociref::ImageReference;
use tracing::info;

use crate::inject;
use crate::jobs;
use crate::repo_store::Repository;
use crate::runner::{RunContext, RunError, RunResult};
use crate::types_jobs::{BuildSpec, ImageTarget, JobEvent, JobState};

/// Pull, rewrite, push. Registry calls are abandoned as soon as the job's
/// token is canceled.
pub async fn run(ctx: &RunContext, spec: BuildSpec) -> RunResult<JobEvent> {
    tokio::select! {
        biased;
        _ = ctx.token.cancelled() => Err(RunError::Canceled),
        res = steps(ctx, spec) => res,
    }
}

async fn steps(ctx: &RunContext, spec: BuildSpec) -> RunResult<JobEvent> {
    let state = &ctx.state;
    let (src_repo, src_ref) = resolve(ctx, "source", &spec.source).await?;
    let (dst_repo, dst_ref) = resolve(ctx, "destination", &spec.destination).await?;

    ctx.log.append(format!("Pulling {src_ref}"));
    let image = state.registry.pull(&src_repo, &src_ref).await?;
    ctx.log.append(format!(
        "Pulled {src_ref} ({} layers, digest {})",
        image.manifest.layers.len(),
        image.digest()
    ));
    ctx.checkpoint()?;

    let image = inject::apply_binding(
        image,
        spec.binding_type,
        spec.user_config.as_ref(),
        &src_ref.to_string(),
    )
    .map_err(RunError::Failed)?;
    ctx.log.append(format!("Applied {} binding", spec.binding_type.as_str()));
    ctx.checkpoint()?;

    let current = jobs::advance(state, ctx.kind(), ctx.name(), JobEvent::Pushing).await?;
    match current {
        Some(r) if r.state() == JobState::Pushing && !r.status.cancel_requested => {}
        Some(r) if r.status.cancel_requested => return Err(RunError::Canceled),
        Some(r) => return Err(RunError::Failed(format!("unexpected state {} before push", r.state()))),
        None => return Err(RunError::Failed("job record disappeared".to_string())),
    }

    ctx.log.append(format!("Pushing {dst_ref} to {}", dst_repo.name));
    let digest = state.registry.push(&dst_repo, &dst_ref, &image).await?;
    ctx.log.append(format!("Pushed {dst_ref}@{digest}"));
    info!(job = %ctx.name(), image = %dst_ref, %digest, "build pushed");

    Ok(JobEvent::BuildCompleted {
        image_reference: dst_ref.to_string(),
        manifest_digest: digest.to_string(),
    })
}

async fn resolve(ctx: &RunContext, section: &str, target: &ImageTarget) -> RunResult<(Repository, ImageReference)> {
    let repo = ctx
        .state
        .repos
        .get(&target.repository)
        .await
        .ok_or_else(|| RunError::Failed(format!("{section} repository {:?} not found", target.repository)))?;
    let reference = ImageReference::new(&repo.registry, &target.image_name, &target.image_tag)
        .map_err(|e| RunError::Failed(format!("invalid {section} image reference: {e}")))?;
    Ok((repo, reference))
}
