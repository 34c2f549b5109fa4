//! Shared fixtures for build BDD scenarios.

use std::cell::RefCell;
use std::time::Duration;

use kiln::test_support::{
    FixedKeyGenerator, RecordingProvisioner, ScriptedCloud, ScriptedCloudError, ScriptedTransport,
};
use kiln::{BuildArtifact, BuildFailure, BuildOrchestrator, BuildSettings, ImageSelection};
use rstest::fixture;

/// Outcome of the build run by a scenario.
pub type BuildResult = Result<BuildArtifact, BuildFailure<ScriptedCloudError>>;

/// Collaborators and results shared by the steps of one scenario.
#[derive(Debug)]
pub struct BuildWorld {
    pub cloud: ScriptedCloud,
    pub transport: RefCell<ScriptedTransport>,
    pub settings: RefCell<BuildSettings>,
    pub outcome: RefCell<Option<BuildResult>>,
}

impl BuildWorld {
    pub fn orchestrator(
        &self,
    ) -> BuildOrchestrator<ScriptedCloud, ScriptedTransport, RecordingProvisioner, FixedKeyGenerator>
    {
        BuildOrchestrator::new(self.cloud.clone())
            .with_transport(self.transport.borrow().clone())
            .with_provisioner(RecordingProvisioner::completing())
            .with_keygen(FixedKeyGenerator::new())
    }
}

#[fixture]
pub fn build_world() -> BuildWorld {
    let mut settings = BuildSettings::new(
        "nbg1",
        "cx11",
        ImageSelection::Direct(String::from("ubuntu-22.04")),
    );
    settings.timing.poll_interval = Duration::from_millis(1);
    BuildWorld {
        cloud: ScriptedCloud::new(),
        transport: RefCell::new(ScriptedTransport::reachable()),
        settings: RefCell::new(settings),
        outcome: RefCell::new(None),
    }
}
