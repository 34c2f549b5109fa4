use tracing::info;

use super::{Step, StepAction, StepEnv, StepFuture, StepName, wait_for_server_state};
use crate::cloud::{BootMode, CloudApi, ServerState};
use crate::context::{BuildContext, ContextField};
use crate::error::BuildError;
use crate::ids::KeypairId;
use crate::settings::RescueWait;

/// Reboots the server into the provider's rescue system when requested.
#[derive(Clone, Copy, Debug, Default)]
pub struct OptionalRescueBoot;

impl<C> Step<C> for OptionalRescueBoot
where
    C: CloudApi + Send + Sync,
{
    fn name(&self) -> StepName {
        StepName::OptionalRescueBoot
    }

    fn reads(&self) -> &'static [ContextField] {
        &[
            ContextField::Server,
            ContextField::Keypair,
            ContextField::ServerDeadline,
        ]
    }

    fn writes(&self) -> &'static [ContextField] {
        &[ContextField::Server, ContextField::RescuePassword]
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, StepAction, C::Error> {
        Box::pin(async move {
            let Some(rescue_type) = env.settings.rescue.as_deref() else {
                return Ok(StepAction::Continue);
            };
            let id = ctx.server()?.id.clone();
            let mode = BootMode::Rescue {
                rescue_type: rescue_type.to_owned(),
                ssh_keys: vec![KeypairId::from(ctx.keypair()?.reference.as_str())],
            };
            let deadline = match env.settings.rescue_wait {
                RescueWait::Fresh => env.action_deadline(),
                RescueWait::Shared => *ctx.server_deadline()?,
            };

            let reboot = env
                .api
                .reboot(&id, &mode)
                .await
                .map_err(BuildError::request("reboot"))?;
            if let Some(password) = reboot.root_password {
                env.redactions.add(password.expose());
                ctx.set_rescue_password(password);
            }

            env.poller
                .wait_for_action(env.api, &reboot.action, deadline)
                .await?;
            let record = wait_for_server_state(env, &id, ServerState::Running, deadline).await?;
            info!(server = %id, rescue = rescue_type, "server booted into rescue system");
            ctx.set_server(record);
            Ok(StepAction::Continue)
        })
    }
}
