use tracing::{info, warn};

use super::{Step, StepAction, StepEnv, StepFuture, StepName, wait_for_server_state};
use crate::cloud::{CloudApi, ServerRecord, ServerState};
use crate::context::{BuildContext, ContextField};
use crate::error::BuildError;
use crate::ids::ServerId;

/// Stops the server before it is captured.
///
/// A graceful shutdown is requested first; if it does not finish within the
/// shutdown budget the server is powered off.
#[derive(Clone, Copy, Debug, Default)]
pub struct PowerOffServer;

async fn graceful_shutdown<C>(
    env: &StepEnv<'_, C>,
    id: &ServerId,
) -> Result<ServerRecord, BuildError<C::Error>>
where
    C: CloudApi + Send + Sync,
{
    let action = env
        .api
        .shutdown(id)
        .await
        .map_err(BuildError::request("shutdown"))?;
    let deadline = env.deadline_after(env.settings.timing.shutdown_timeout);
    env.poller.wait_for_action(env.api, &action, deadline).await?;
    wait_for_server_state(env, id, ServerState::Stopped, deadline).await
}

async fn hard_power_off<C>(
    env: &StepEnv<'_, C>,
    id: &ServerId,
) -> Result<ServerRecord, BuildError<C::Error>>
where
    C: CloudApi + Send + Sync,
{
    let action = env
        .api
        .power_off(id)
        .await
        .map_err(BuildError::request("power_off"))?;
    let deadline = env.action_deadline();
    env.poller.wait_for_action(env.api, &action, deadline).await?;
    wait_for_server_state(env, id, ServerState::Stopped, deadline).await
}

impl<C> Step<C> for PowerOffServer
where
    C: CloudApi + Send + Sync,
{
    fn name(&self) -> StepName {
        StepName::PowerOffServer
    }

    fn reads(&self) -> &'static [ContextField] {
        &[ContextField::Server]
    }

    fn writes(&self) -> &'static [ContextField] {
        &[ContextField::Server]
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, StepAction, C::Error> {
        Box::pin(async move {
            let id = ctx.server()?.id.clone();
            let stopped = match graceful_shutdown(env, &id).await {
                Ok(record) => record,
                Err(BuildError::PollTimeout { waited, .. }) if !env.build_expired() => {
                    warn!(
                        server = %id,
                        waited_secs = waited.as_secs(),
                        "graceful shutdown did not finish; powering off"
                    );
                    hard_power_off(env, &id).await?
                }
                Err(err) => return Err(err),
            };
            info!(server = %id, "server stopped");
            ctx.set_server(stopped);
            Ok(StepAction::Continue)
        })
    }
}
