use tracing::info;

use super::{Step, StepAction, StepEnv, StepFuture, StepName};
use crate::cloud::{CloudApi, SnapshotSpec};
use crate::context::{BuildContext, ContextField};
use crate::error::BuildError;

/// Captures the stopped server as an image.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateSnapshot;

impl<C> Step<C> for CreateSnapshot
where
    C: CloudApi + Send + Sync,
{
    fn name(&self) -> StepName {
        StepName::CreateSnapshot
    }

    fn reads(&self) -> &'static [ContextField] {
        &[ContextField::Server]
    }

    fn writes(&self) -> &'static [ContextField] {
        &[ContextField::Snapshot]
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, StepAction, C::Error> {
        Box::pin(async move {
            let id = ctx.server()?.id.clone();
            let spec = SnapshotSpec {
                description: env.settings.snapshot_name.clone(),
                labels: env.settings.snapshot_labels.clone(),
            };
            let created = env
                .api
                .create_image(&id, &spec)
                .await
                .map_err(BuildError::request("create_image"))?;
            env.poller
                .wait_for_action(env.api, &created.action, env.action_deadline())
                .await?;
            info!(
                server = %id,
                image = %created.image.id,
                name = %created.image.description,
                "snapshot created"
            );
            ctx.set_snapshot(created.image);
            Ok(StepAction::Continue)
        })
    }
}
