use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use super::{Step, StepAction, StepEnv, StepFuture, StepName};
use crate::cloud::CloudApi;
use crate::context::{BuildContext, ContextField};
use crate::error::BuildError;
use crate::poll::Probe;
use crate::transport::{Communicator, Credentials, Endpoint, ProvisionOutcome};

/// Resolves the server's endpoint and waits until it accepts connections.
///
/// Public IPv4 is preferred, then public IPv6, then the first private
/// address.
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitForConnectivity;

fn resolve_endpoint<E>(ctx: &BuildContext, communicator: &Communicator) -> Result<Endpoint, BuildError<E>>
where
    E: std::error::Error + 'static,
{
    let server = ctx.server()?;
    let address = server
        .preferred_address()
        .ok_or_else(|| BuildError::MissingAddress {
            server: server.id.to_string(),
        })?;
    let credentials = match communicator {
        Communicator::Ssh { username, .. } => Credentials::SshKey {
            username: username.clone(),
            private_key: ctx.keypair()?.private_key.clone(),
        },
        Communicator::WinRm {
            username, password, ..
        } => Credentials::Password {
            username: username.clone(),
            password: password.clone(),
        },
    };
    Ok(Endpoint {
        address,
        port: communicator.port(),
        credentials,
        rescue_password: ctx.rescue_password_opt().cloned(),
    })
}

impl<C> Step<C> for WaitForConnectivity
where
    C: CloudApi + Send + Sync,
{
    fn name(&self) -> StepName {
        StepName::WaitForConnectivity
    }

    fn reads(&self) -> &'static [ContextField] {
        &[ContextField::Server, ContextField::Keypair]
    }

    fn writes(&self) -> &'static [ContextField] {
        &[ContextField::Endpoint]
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, StepAction, C::Error> {
        Box::pin(async move {
            let endpoint = resolve_endpoint::<C::Error>(ctx, &env.settings.communicator)?;
            let deadline = env.deadline_after(env.settings.timing.connectivity_timeout);
            let last_error: Mutex<Option<String>> = Mutex::new(None);
            let transport = env.transport;
            let target = &endpoint;
            let last = &last_error;
            let waiting_for = format!("{} to accept connections", target.socket_addr());

            let outcome: Result<(), BuildError<C::Error>> = env
                .poller
                .poll_until(&waiting_for, deadline, move || async move {
                    match transport.probe(target).await {
                        Ok(()) => Ok(Probe::Ready(())),
                        Err(err) => {
                            debug!(address = %target.socket_addr(), error = %err, "not reachable yet");
                            *last.lock().unwrap_or_else(PoisonError::into_inner) =
                                Some(err.message);
                            Ok(Probe::Pending)
                        }
                    }
                })
                .await;

            match outcome {
                Ok(()) => {}
                Err(BuildError::PollTimeout { .. }) if !env.build_expired() => {
                    let last_seen = last_error
                        .into_inner()
                        .unwrap_or_else(PoisonError::into_inner)
                        .unwrap_or_else(|| String::from("no connection attempt completed"));
                    return Err(BuildError::ConnectivityTimeout {
                        address: endpoint.address.to_string(),
                        port: endpoint.port,
                        last_error: last_seen,
                    });
                }
                Err(err) => return Err(err),
            }

            info!(address = %endpoint.address, port = endpoint.port, "server accepts connections");
            ctx.set_endpoint(endpoint);
            Ok(StepAction::Continue)
        })
    }
}

/// Hands the reachable server to the external provisioner.
#[derive(Clone, Copy, Debug, Default)]
pub struct Provision;

impl<C> Step<C> for Provision
where
    C: CloudApi + Send + Sync,
{
    fn name(&self) -> StepName {
        StepName::Provision
    }

    fn reads(&self) -> &'static [ContextField] {
        &[ContextField::Endpoint]
    }

    fn writes(&self) -> &'static [ContextField] {
        &[]
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, StepAction, C::Error> {
        Box::pin(async move {
            let endpoint = ctx.endpoint()?;
            info!(address = %endpoint.address, port = endpoint.port, "provisioning server");
            match env.provisioner.provision(endpoint).await? {
                ProvisionOutcome::Completed => Ok(StepAction::Continue),
                ProvisionOutcome::Halt => {
                    info!("provisioner requested the build to stop");
                    Ok(StepAction::Halt)
                }
            }
        })
    }
}
