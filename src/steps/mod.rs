//! Build steps and the contract the pipeline runner drives them through.
//!
//! A step performs one side-effecting part of the build in `run` and undoes
//! it in `cleanup`. Cleanup is invoked for every step whose `run` started, in
//! reverse order, and must be a no-op when `run` produced nothing to undo.

mod connectivity;
mod image;
mod keypair;
mod power;
mod rescue;
mod server;
mod snapshot;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

pub use connectivity::{Provision, WaitForConnectivity};
pub use image::{ResolveImage, select_image};
pub use keypair::GenerateOrImportKeypair;
pub use power::PowerOffServer;
pub use rescue::OptionalRescueBoot;
pub use server::{ChangeServerType, CreateServer, PollUntilRunning};
pub use snapshot::CreateSnapshot;

use crate::cloud::{CloudApi, ServerRecord, ServerState};
use crate::context::{BuildContext, ContextField};
use crate::error::BuildError;
use crate::ids::ServerId;
use crate::keygen::KeyGenerator;
use crate::logging::Redactions;
use crate::poll::{Poller, Probe};
use crate::settings::BuildSettings;
use crate::transport::{Provisioner, SessionTransport};

/// Future returned by step operations.
pub type StepFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, BuildError<E>>> + Send + 'a>>;

/// Identifies a step in logs, reports and failures.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    /// Generates and uploads a key, or passes operator key material through.
    GenerateOrImportKeypair,
    /// Resolves the source image.
    ResolveImage,
    /// Submits the create-server request.
    CreateServer,
    /// Waits for the new server to run.
    PollUntilRunning,
    /// Switches to a larger server type.
    ChangeServerType,
    /// Boots the rescue system.
    OptionalRescueBoot,
    /// Waits until the server accepts connections.
    WaitForConnectivity,
    /// Runs the external provisioner.
    Provision,
    /// Stops the server before capture.
    PowerOffServer,
    /// Captures the image.
    CreateSnapshot,
}

impl StepName {
    /// Returns the snake case name of the step.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GenerateOrImportKeypair => "generate_or_import_keypair",
            Self::ResolveImage => "resolve_image",
            Self::CreateServer => "create_server",
            Self::PollUntilRunning => "poll_until_running",
            Self::ChangeServerType => "change_server_type",
            Self::OptionalRescueBoot => "optional_rescue_boot",
            Self::WaitForConnectivity => "wait_for_connectivity",
            Self::Provision => "provision",
            Self::PowerOffServer => "power_off_server",
            Self::CreateSnapshot => "create_snapshot",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// What the pipeline should do after a step succeeds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepAction {
    /// Run the next step.
    Continue,
    /// Stop here without failing; cleanup still runs.
    Halt,
}

/// Collaborators and settings available to every step.
pub struct StepEnv<'e, C: ?Sized> {
    /// Cloud client.
    pub api: &'e C,
    /// Validated build settings.
    pub settings: &'e BuildSettings,
    /// Transport used to probe connectivity.
    pub transport: &'e (dyn SessionTransport + Send + Sync),
    /// External provisioning phase.
    pub provisioner: &'e (dyn Provisioner + Send + Sync),
    /// Generator for ephemeral keys.
    pub keygen: &'e (dyn KeyGenerator + Send + Sync),
    /// Shared poller carrying the interval and cancellation token.
    pub poller: &'e Poller,
    /// Secrets to scrub from logs.
    pub redactions: &'e Redactions,
    /// Instant by which the whole build must finish, if bounded.
    pub build_deadline: Option<Instant>,
}

impl<C: ?Sized> StepEnv<'_, C> {
    /// Returns a deadline `budget` from now, capped at the build deadline.
    ///
    /// Steps never abandon a provider request midway; waits are where the
    /// build deadline takes effect.
    #[must_use]
    pub fn deadline_after(&self, budget: Duration) -> Instant {
        let local = Instant::now() + budget;
        self.build_deadline
            .map_or(local, |build| local.min(build))
    }

    /// Returns a fresh deadline for one provider action.
    #[must_use]
    pub fn action_deadline(&self) -> Instant {
        self.deadline_after(self.settings.timing.action_timeout)
    }

    /// Returns `true` once the build deadline has passed.
    #[must_use]
    pub fn build_expired(&self) -> bool {
        self.build_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// One side-effecting stage of a build.
pub trait Step<C>: Send + Sync
where
    C: CloudApi + Send + Sync,
{
    /// Name used in logs and reports.
    fn name(&self) -> StepName;

    /// Context slots this step requires.
    fn reads(&self) -> &'static [ContextField];

    /// Context slots this step fills.
    fn writes(&self) -> &'static [ContextField];

    /// Performs the step.
    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, StepAction, C::Error>;

    /// Undoes whatever `run` created. The default does nothing.
    fn cleanup<'a>(
        &'a self,
        _ctx: &'a mut BuildContext,
        _env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, (), C::Error> {
        Box::pin(async { Ok(()) })
    }
}

/// Polls the server until it reaches `target`, returning the fresh record.
pub(crate) async fn wait_for_server_state<C>(
    env: &StepEnv<'_, C>,
    id: &ServerId,
    target: ServerState,
    deadline: Instant,
) -> Result<ServerRecord, BuildError<C::Error>>
where
    C: CloudApi + Send + Sync,
{
    let api = env.api;
    let waiting_for = format!("server {id} to be {}", target.as_str());
    env.poller
        .poll_until(&waiting_for, deadline, move || async move {
            let server = api
                .get_server(id)
                .await
                .map_err(BuildError::request("get_server"))?;
            match server {
                Some(record) if record.state == target => Ok(Probe::Ready(record)),
                Some(_) => Ok(Probe::Pending),
                None => Err(BuildError::ActionFailed {
                    action: String::from("get_server"),
                    message: format!("server {id} no longer exists"),
                }),
            }
        })
        .await
}
