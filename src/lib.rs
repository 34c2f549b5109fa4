//! Bake reusable machine images from disposable cloud servers.
//!
//! A build provisions a temporary server, waits for it to boot and accept
//! connections, hands it to an external provisioner, captures it as a
//! snapshot image and then removes everything it created. Every provider
//! operation is asynchronous, so each step submits a request and polls the
//! resulting action until it settles. Cleanup runs in reverse order whenever
//! the build stops, whether it succeeded, halted early or failed.
//!
//! The cloud control plane, the remote transport and the provisioner are
//! traits ([`CloudApi`], [`SessionTransport`], [`Provisioner`]); the
//! [`BuildOrchestrator`] wires them together.

pub mod cloud;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod keygen;
pub mod logging;
pub mod orchestrator;
pub mod poll;
pub mod runner;
pub mod secret;
pub mod settings;
pub mod steps;
#[cfg(test)]
mod test_helpers;
pub mod test_support;
pub mod transport;
pub mod user_data;

pub use cloud::{
    ActionHandle, ActionStatus, BootMode, CloudApi, CloudFuture, ImageRecord, ServerRecord,
    ServerSpec, ServerState,
};
pub use config::{BuildConfig, ConfigError};
pub use context::BuildContext;
pub use error::{BuildError, CleanupFailure};
pub use ids::{ActionId, ImageId, KeypairId, ServerId};
pub use keygen::{KeyGenerator, SshKeygen};
pub use logging::Redactions;
pub use orchestrator::{BuildArtifact, BuildFailure, BuildOrchestrator};
pub use runner::{Pipeline, RunOutcome, RunReport};
pub use secret::SecretString;
pub use settings::{BuildSettings, ImageFilter, ImageSelection, KeySource, RescueWait};
pub use steps::{Step, StepName};
pub use transport::{
    Communicator, Endpoint, NoopProvisioner, ProvisionOutcome, Provisioner, SessionTransport,
    TcpProbe,
};
