use tracing::{info, warn};

use super::{Step, StepAction, StepEnv, StepFuture, StepName, wait_for_server_state};
use crate::cloud::{CloudApi, PublicNet, ServerSpec, ServerState};
use crate::context::{BuildContext, ContextField};
use crate::error::BuildError;
use crate::settings::BuildSettings;

/// Submits the create-server request.
///
/// Cleanup deletes the server unless it is kept or never came into
/// existence.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateServer;

fn server_spec(
    settings: &BuildSettings,
    image: &str,
    primary_key: &str,
) -> Result<ServerSpec, crate::cloud::SpecError> {
    let networking = &settings.networking;
    let ssh_keys = std::iter::once(primary_key.to_owned())
        .chain(settings.extra_ssh_keys.iter().cloned())
        .collect();
    ServerSpec::builder()
        .name(settings.server_name.as_str())
        .server_type(settings.server_type.as_str())
        .location(settings.location.as_str())
        .image(image)
        .labels(settings.server_labels.clone())
        .user_data(settings.user_data.clone())
        .ssh_keys(ssh_keys)
        .networks(networking.networks.clone())
        .firewalls(networking.firewalls.clone())
        .volumes(networking.volumes.clone())
        .public_net(PublicNet {
            enable_ipv4: networking.public_ipv4,
            enable_ipv6: networking.public_ipv6,
            ipv4: networking.primary_ipv4.clone(),
            ipv6: networking.primary_ipv6.clone(),
        })
        .build()
}

impl<C> Step<C> for CreateServer
where
    C: CloudApi + Send + Sync,
{
    fn name(&self) -> StepName {
        StepName::CreateServer
    }

    fn reads(&self) -> &'static [ContextField] {
        &[ContextField::Keypair, ContextField::SourceImage]
    }

    fn writes(&self) -> &'static [ContextField] {
        &[ContextField::Server, ContextField::CreateAction]
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, StepAction, C::Error> {
        Box::pin(async move {
            let spec = server_spec(
                env.settings,
                ctx.source_image()?,
                &ctx.keypair()?.reference,
            )?;
            let created = env
                .api
                .create_server(&spec)
                .await
                .map_err(BuildError::request("create_server"))?;
            info!(
                server = %created.server.id,
                name = %created.server.name,
                server_type = %spec.server_type,
                location = %spec.location,
                "created server"
            );
            ctx.set_server(created.server);
            ctx.set_create_action(created.action);
            Ok(StepAction::Continue)
        })
    }

    fn cleanup<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, (), C::Error> {
        Box::pin(async move {
            let Some(server) = ctx.server_opt() else {
                return Ok(());
            };
            if server.state == ServerState::Deleted {
                return Ok(());
            }
            let id = server.id.clone();
            if env.settings.keep_server {
                info!(server = %id, "keeping server");
                return Ok(());
            }
            env.api
                .delete_server(&id)
                .await
                .map_err(BuildError::request("delete_server"))?;
            ctx.server_mut()?.state = ServerState::Deleted;
            info!(server = %id, "deleted server");
            Ok(())
        })
    }
}

/// Waits for the creation action and then for the server to run.
///
/// When the provider reports the creation failed, the server is marked as
/// deleted so cleanup does not try to remove it.
#[derive(Clone, Copy, Debug, Default)]
pub struct PollUntilRunning;

impl<C> Step<C> for PollUntilRunning
where
    C: CloudApi + Send + Sync,
{
    fn name(&self) -> StepName {
        StepName::PollUntilRunning
    }

    fn reads(&self) -> &'static [ContextField] {
        &[ContextField::Server, ContextField::CreateAction]
    }

    fn writes(&self) -> &'static [ContextField] {
        &[ContextField::Server, ContextField::ServerDeadline]
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, StepAction, C::Error> {
        Box::pin(async move {
            let action = ctx.create_action()?.clone();
            let id = ctx.server()?.id.clone();
            let deadline = env.action_deadline();
            ctx.set_server_deadline(deadline);

            if let Err(err) = env.poller.wait_for_action(env.api, &action, deadline).await {
                if matches!(err, BuildError::ActionFailed { .. }) {
                    warn!(server = %id, "server creation failed; nothing to delete");
                    ctx.server_mut()?.state = ServerState::Deleted;
                }
                return Err(err);
            }

            let record = wait_for_server_state(env, &id, ServerState::Running, deadline).await?;
            info!(
                server = %id,
                ipv4 = ?record.public_ipv4,
                ipv6 = ?record.public_ipv6,
                "server is running"
            );
            ctx.set_server(record);
            Ok(StepAction::Continue)
        })
    }
}

/// Switches the running server to a larger type, keeping its disk size.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChangeServerType;

impl<C> Step<C> for ChangeServerType
where
    C: CloudApi + Send + Sync,
{
    fn name(&self) -> StepName {
        StepName::ChangeServerType
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
            let Some(target) = env.settings.upgrade_server_type.as_deref() else {
                return Ok(StepAction::Continue);
            };
            let api = env.api;
            let id = ctx.server()?.id.clone();

            let off = api
                .power_off(&id)
                .await
                .map_err(BuildError::request("power_off"))?;
            let off_deadline = env.action_deadline();
            env.poller.wait_for_action(api, &off, off_deadline).await?;
            let stopped = wait_for_server_state(env, &id, ServerState::Stopped, off_deadline).await?;
            ctx.set_server(stopped);

            let change = api
                .change_server_type(&id, target, false)
                .await
                .map_err(BuildError::request("change_server_type"))?;
            env.poller
                .wait_for_action(api, &change, env.action_deadline())
                .await?;
            info!(server = %id, server_type = target, "changed server type");

            let on = api
                .power_on(&id)
                .await
                .map_err(BuildError::request("power_on"))?;
            let on_deadline = env.action_deadline();
            env.poller.wait_for_action(api, &on, on_deadline).await?;
            let running = wait_for_server_state(env, &id, ServerState::Running, on_deadline).await?;
            ctx.set_server(running);
            Ok(StepAction::Continue)
        })
    }
}
