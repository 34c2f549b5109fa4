//! Assembles and drives one image build.
//!
//! The orchestrator turns [`BuildSettings`] into an ordered pipeline of
//! steps, runs it against the configured collaborators, and reports either
//! the resulting [`BuildArtifact`] or a [`BuildFailure`] that keeps the
//! primary cause separate from any cleanup failures.

use std::fmt;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cloud::{CloudApi, ImageRecord, ServerRecord, ServerState};
use crate::context::{BuildContext, MissingStateError};
use crate::error::{BuildError, CleanupFailure, append_cleanup_note};
use crate::keygen::{KeyGenerator, SshKeygen};
use crate::logging::Redactions;
use crate::poll::Poller;
use crate::runner::{Pipeline, RunOutcome};
use crate::settings::BuildSettings;
use crate::steps::{
    ChangeServerType, CreateServer, CreateSnapshot, GenerateOrImportKeypair, OptionalRescueBoot,
    PollUntilRunning, PowerOffServer, Provision, ResolveImage, Step, StepEnv, StepName,
    WaitForConnectivity,
};
use crate::transport::{Communicator, NoopProvisioner, Provisioner, SessionTransport, TcpProbe};

/// Result of a build that finished without errors.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BuildArtifact {
    /// Captured image, absent when snapshots are skipped or the build halted
    /// early.
    pub image: Option<ImageRecord>,
    /// Server left behind when it is kept.
    pub server: Option<ServerRecord>,
    /// Step that stopped the build early, if any.
    pub halted_at: Option<StepName>,
}

/// Failed build with its primary cause and any cleanup failures.
#[derive(Debug)]
pub struct BuildFailure<E>
where
    E: std::error::Error + 'static,
{
    /// Step that failed, or whose cleanup failed after a successful run.
    pub step: StepName,
    /// Primary cause.
    pub error: BuildError<E>,
    /// Further cleanup failures, in cleanup order.
    pub cleanup_errors: Vec<CleanupFailure<E>>,
    /// Whatever the build produced before failing.
    pub artifact: Box<BuildArtifact>,
}

impl<E> fmt::Display for BuildFailure<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = format!("build failed at {}: {}", self.step, self.error);
        formatter.write_str(&append_cleanup_note(message, &self.cleanup_errors))
    }
}

impl<E> std::error::Error for BuildFailure<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Builds machine images from disposable servers.
#[derive(Debug)]
pub struct BuildOrchestrator<C, T = TcpProbe, P = NoopProvisioner, K = SshKeygen> {
    api: C,
    transport: T,
    provisioner: P,
    keygen: K,
    redactions: Redactions,
    cancel: CancellationToken,
}

impl<C> BuildOrchestrator<C>
where
    C: CloudApi + Send + Sync,
{
    /// Creates an orchestrator probing TCP reachability, skipping
    /// provisioning and generating keys with `ssh-keygen`.
    #[must_use]
    pub fn new(api: C) -> Self {
        Self {
            api,
            transport: TcpProbe::new(),
            provisioner: NoopProvisioner,
            keygen: SshKeygen::default(),
            redactions: Redactions::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl<C, T, P, K> BuildOrchestrator<C, T, P, K> {
    /// Replaces the connectivity transport.
    #[must_use]
    pub fn with_transport<T2>(self, transport: T2) -> BuildOrchestrator<C, T2, P, K> {
        BuildOrchestrator {
            api: self.api,
            transport,
            provisioner: self.provisioner,
            keygen: self.keygen,
            redactions: self.redactions,
            cancel: self.cancel,
        }
    }

    /// Replaces the provisioner.
    #[must_use]
    pub fn with_provisioner<P2>(self, provisioner: P2) -> BuildOrchestrator<C, T, P2, K> {
        BuildOrchestrator {
            api: self.api,
            transport: self.transport,
            provisioner,
            keygen: self.keygen,
            redactions: self.redactions,
            cancel: self.cancel,
        }
    }

    /// Replaces the key generator.
    #[must_use]
    pub fn with_keygen<K2>(self, keygen: K2) -> BuildOrchestrator<C, T, P, K2> {
        BuildOrchestrator {
            api: self.api,
            transport: self.transport,
            provisioner: self.provisioner,
            keygen,
            redactions: self.redactions,
            cancel: self.cancel,
        }
    }

    /// Shares a redaction list, typically the one given to
    /// [`crate::logging::init`].
    #[must_use]
    pub fn with_redactions(mut self, redactions: Redactions) -> Self {
        self.redactions = redactions;
        self
    }

    /// Uses `cancel` to stop builds from outside.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the redaction list secrets are registered with.
    #[must_use]
    pub const fn redactions(&self) -> &Redactions {
        &self.redactions
    }

    /// Returns the token that cancels running builds.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the cloud client.
    #[must_use]
    pub const fn api(&self) -> &C {
        &self.api
    }
}

impl<C, T, P, K> BuildOrchestrator<C, T, P, K>
where
    C: CloudApi + Send + Sync,
    T: SessionTransport + Send + Sync,
    P: Provisioner + Send + Sync,
    K: KeyGenerator + Send + Sync,
{
    /// Builds the step pipeline for `settings`.
    ///
    /// Optional steps are only included when configured: the server type
    /// change, the rescue boot, the power off (skipped when the server is
    /// kept without a snapshot) and the snapshot itself.
    #[must_use]
    pub fn assemble(settings: &BuildSettings) -> Pipeline<C> {
        let mut steps: Vec<Box<dyn Step<C>>> = vec![
            Box::new(GenerateOrImportKeypair),
            Box::new(ResolveImage),
            Box::new(CreateServer),
            Box::new(PollUntilRunning),
        ];
        if settings.upgrade_server_type.is_some() {
            steps.push(Box::new(ChangeServerType));
        }
        if settings.rescue.is_some() {
            steps.push(Box::new(OptionalRescueBoot));
        }
        steps.push(Box::new(WaitForConnectivity));
        steps.push(Box::new(Provision));
        if settings.needs_power_off() {
            steps.push(Box::new(PowerOffServer));
        }
        if !settings.skip_snapshot {
            steps.push(Box::new(CreateSnapshot));
        }
        Pipeline::new(steps)
    }

    /// Runs one build.
    ///
    /// Cleanup always runs: the server is deleted unless kept and a
    /// generated key is always deleted. A build whose steps succeeded but
    /// whose cleanup failed is reported as a failure carrying the artifact.
    ///
    /// # Errors
    ///
    /// Returns [`BuildFailure`] when a step or a cleanup fails, or when the
    /// build is cancelled or times out.
    pub async fn build(&self, settings: &BuildSettings) -> Result<BuildArtifact, BuildFailure<C::Error>> {
        if let Communicator::WinRm { password, .. } = &settings.communicator {
            self.redactions.add(password.expose());
        }

        let pipeline = Self::assemble(settings);
        if let Err(err) = pipeline.verify_ordering() {
            return Err(BuildFailure {
                step: err.step,
                error: BuildError::MissingState(MissingStateError { field: err.field }),
                cleanup_errors: Vec::new(),
                artifact: Box::new(empty_artifact()),
            });
        }

        let poller = Poller::new(settings.timing.poll_interval, self.cancel.clone());
        let build_deadline = settings.timing.build_timeout.map(|budget| Instant::now() + budget);
        let env = StepEnv {
            api: &self.api,
            settings,
            transport: &self.transport,
            provisioner: &self.provisioner,
            keygen: &self.keygen,
            poller: &poller,
            redactions: &self.redactions,
            build_deadline,
        };
        let mut ctx = BuildContext::new();

        info!(
            server = %settings.server_name,
            location = %settings.location,
            server_type = %settings.server_type,
            steps = ?pipeline.names(),
            "starting build"
        );
        let report = pipeline.run(&mut ctx, &env).await;

        let mut artifact = artifact_from(&ctx);
        let mut cleanup_errors = report.cleanup_errors.into_iter();
        let failed = match report.outcome {
            RunOutcome::Failed { step, error } => Some((step, error)),
            RunOutcome::Halted { step } => {
                artifact.halted_at = Some(step);
                None
            }
            RunOutcome::Completed => None,
        };
        let Some((step, error)) =
            failed.or_else(|| cleanup_errors.next().map(|first| (first.step, first.error)))
        else {
            info!(
                image = ?artifact.image.as_ref().map(|image| image.id.as_str()),
                halted_at = ?artifact.halted_at,
                "build finished"
            );
            return Ok(artifact);
        };

        let failure = BuildFailure {
            step,
            error,
            cleanup_errors: cleanup_errors.collect(),
            artifact: Box::new(artifact),
        };
        error!(error = %failure, "build failed");
        Err(failure)
    }
}

fn artifact_from(ctx: &BuildContext) -> BuildArtifact {
    BuildArtifact {
        image: ctx.snapshot_opt().cloned(),
        server: ctx
            .server_opt()
            .filter(|server| server.state != ServerState::Deleted)
            .cloned(),
        halted_at: None,
    }
}

const fn empty_artifact() -> BuildArtifact {
    BuildArtifact {
        image: None,
        server: None,
        halted_at: None,
    }
}
