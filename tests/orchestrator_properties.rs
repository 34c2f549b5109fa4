//! End-to-end properties of complete builds against the scripted cloud.

use std::time::Duration;

use kiln::cloud::ActionStatus;
use kiln::secret::SecretString;
use kiln::settings::{ImageFilter, OperatorKey};
use kiln::test_support::{
    FixedKeyGenerator, RecordingProvisioner, ScriptedCloud, ScriptedTransport,
};
use kiln::{
    BuildError, BuildOrchestrator, BuildSettings, Communicator, ImageSelection, KeySource,
    ServerState, StepName,
};
use rstest::{fixture, rstest};

type Orchestrator =
    BuildOrchestrator<ScriptedCloud, ScriptedTransport, RecordingProvisioner, FixedKeyGenerator>;

#[fixture]
fn cloud() -> ScriptedCloud {
    ScriptedCloud::new()
}

#[fixture]
fn settings() -> BuildSettings {
    BuildSettings::new(
        "nbg1",
        "cx11",
        ImageSelection::Direct(String::from("ubuntu-22.04")),
    )
}

fn orchestrator(cloud: &ScriptedCloud, provisioner: RecordingProvisioner) -> Orchestrator {
    BuildOrchestrator::new(cloud.clone())
        .with_transport(ScriptedTransport::reachable())
        .with_provisioner(provisioner)
        .with_keygen(FixedKeyGenerator::new())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn skipped_snapshot_build_removes_server_and_key(
    cloud: ScriptedCloud,
    mut settings: BuildSettings,
) {
    settings.skip_snapshot = true;

    let artifact = orchestrator(&cloud, RecordingProvisioner::completing())
        .build(&settings)
        .await
        .expect("build should succeed");

    assert_eq!(artifact.image, None);
    assert_eq!(artifact.server, None);
    assert_eq!(artifact.halted_at, None);
    assert_eq!(
        cloud.mutations(),
        vec![
            "create_keypair",
            "create_server",
            "shutdown",
            "delete_server",
            "delete_keypair",
        ]
    );
    assert!(cloud.live_servers().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn quota_failure_removes_key_but_never_deletes_a_server(
    cloud: ScriptedCloud,
    settings: BuildSettings,
) {
    cloud.queue_action_statuses(
        "create_server",
        [ActionStatus::Failed {
            message: String::from("quota exceeded"),
        }],
    );

    let failure = orchestrator(&cloud, RecordingProvisioner::completing())
        .build(&settings)
        .await
        .expect_err("build should fail");

    assert_eq!(failure.step, StepName::PollUntilRunning);
    let BuildError::ActionFailed { ref message, .. } = failure.error else {
        panic!("expected ActionFailed, got {:?}", failure.error);
    };
    assert_eq!(message, "quota exceeded");
    assert!(failure.cleanup_errors.is_empty());
    assert_eq!(cloud.count("delete_server"), 0);
    assert_eq!(cloud.count("delete_keypair"), 1);
    assert_eq!(failure.artifact.server, None);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn kept_server_survives_while_key_is_removed(
    cloud: ScriptedCloud,
    mut settings: BuildSettings,
) {
    settings.keep_server = true;

    let artifact = orchestrator(&cloud, RecordingProvisioner::completing())
        .build(&settings)
        .await
        .expect("build should succeed");

    let image = artifact.image.expect("snapshot should be captured");
    assert_eq!(image.description, settings.snapshot_name);
    let server = artifact.server.expect("server should be reported");
    assert_eq!(server.state, ServerState::Stopped);
    assert_eq!(cloud.count("delete_server"), 0);
    assert_eq!(cloud.count("delete_keypair"), 1);
    assert_eq!(cloud.live_servers().len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn default_build_snapshots_then_cleans_up(cloud: ScriptedCloud, settings: BuildSettings) {
    let provisioner = RecordingProvisioner::completing();

    let artifact = orchestrator(&cloud, provisioner.clone())
        .build(&settings)
        .await
        .expect("build should succeed");

    assert!(artifact.image.is_some());
    assert_eq!(cloud.count("list_images"), 0);
    assert_eq!(
        cloud.mutations(),
        vec![
            "create_keypair",
            "create_server",
            "shutdown",
            "create_image",
            "delete_server",
            "delete_keypair",
        ]
    );
    assert_eq!(provisioner.endpoints().len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn zero_matching_images_stop_before_server_creation(
    cloud: ScriptedCloud,
    mut settings: BuildSettings,
) {
    settings.image = ImageSelection::Filter(ImageFilter {
        with_selector: String::from("role=base"),
        most_recent: true,
    });

    let failure = orchestrator(&cloud, RecordingProvisioner::completing())
        .build(&settings)
        .await
        .expect_err("build should fail");

    assert_eq!(failure.step, StepName::ResolveImage);
    assert!(matches!(
        failure.error,
        BuildError::NoMatchingImage { ref selector } if selector == "role=base"
    ));
    assert_eq!(
        cloud.mutations(),
        vec!["create_keypair", "list_images", "delete_keypair"]
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn operator_keys_are_never_uploaded_or_deleted(
    cloud: ScriptedCloud,
    mut settings: BuildSettings,
) {
    settings.skip_snapshot = true;
    settings.key_source = KeySource::Operator(OperatorKey {
        private_key: SecretString::new("operator-private"),
        provider_key: String::from("ops"),
    });

    orchestrator(&cloud, RecordingProvisioner::completing())
        .build(&settings)
        .await
        .expect("build should succeed");

    assert_eq!(cloud.count("create_keypair"), 0);
    assert_eq!(cloud.count("delete_keypair"), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn provisioner_halt_skips_snapshot_and_still_cleans_up(
    cloud: ScriptedCloud,
    settings: BuildSettings,
) {
    let artifact = orchestrator(&cloud, RecordingProvisioner::halting())
        .build(&settings)
        .await
        .expect("halt is not a failure");

    assert_eq!(artifact.halted_at, Some(StepName::Provision));
    assert_eq!(artifact.image, None);
    assert_eq!(cloud.count("shutdown"), 0);
    assert_eq!(cloud.count("create_image"), 0);
    assert_eq!(cloud.count("delete_server"), 1);
    assert_eq!(cloud.count("delete_keypair"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cleanup_failure_after_success_keeps_the_artifact(
    cloud: ScriptedCloud,
    settings: BuildSettings,
) {
    cloud.fail_operation("delete_keypair", "key is gone");

    let failure = orchestrator(&cloud, RecordingProvisioner::completing())
        .build(&settings)
        .await
        .expect_err("cleanup failure should surface");

    assert_eq!(failure.step, StepName::GenerateOrImportKeypair);
    assert!(matches!(
        failure.error,
        BuildError::ProviderRequest {
            operation: "delete_keypair",
            ..
        }
    ));
    assert!(failure.artifact.image.is_some());
    assert_eq!(cloud.count("delete_server"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cleanup_failures_are_reported_alongside_the_primary_cause(
    cloud: ScriptedCloud,
    settings: BuildSettings,
) {
    cloud.fail_operation("delete_server", "locked");

    let failure = orchestrator(&cloud, RecordingProvisioner::failing("playbook exploded"))
        .build(&settings)
        .await
        .expect_err("build should fail");

    assert_eq!(failure.step, StepName::Provision);
    assert!(matches!(failure.error, BuildError::Provisioning(_)));
    assert_eq!(failure.cleanup_errors.len(), 1);
    let message = failure.to_string();
    assert!(message.contains("playbook exploded"), "{message}");
    assert!(message.contains("cleanup also failed"), "{message}");
    assert!(message.contains("locked"), "{message}");
    assert_eq!(cloud.count("delete_keypair"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn build_timeout_during_a_slow_create_still_deletes_the_server(
    cloud: ScriptedCloud,
    mut settings: BuildSettings,
) {
    settings.timing.build_timeout = Some(Duration::from_secs(10));
    cloud.delay_response("create_server", Duration::from_secs(30));

    let failure = orchestrator(&cloud, RecordingProvisioner::completing())
        .build(&settings)
        .await
        .expect_err("build should time out");

    assert_eq!(failure.step, StepName::PollUntilRunning);
    assert!(matches!(failure.error, BuildError::PollTimeout { .. }));
    assert!(failure.cleanup_errors.is_empty());
    assert_eq!(cloud.count("delete_server"), 1);
    assert_eq!(cloud.count("delete_keypair"), 1);
    assert!(cloud.live_servers().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cancelled_builds_touch_nothing(cloud: ScriptedCloud, settings: BuildSettings) {
    let orchestrator = orchestrator(&cloud, RecordingProvisioner::completing());
    orchestrator.cancel_token().cancel();

    let failure = orchestrator
        .build(&settings)
        .await
        .expect_err("cancelled build fails");

    assert!(matches!(failure.error, BuildError::Cancelled));
    assert!(cloud.calls().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn winrm_passwords_are_registered_for_redaction(
    cloud: ScriptedCloud,
    mut settings: BuildSettings,
) {
    settings.skip_snapshot = true;
    settings.communicator = Communicator::WinRm {
        username: String::from("Administrator"),
        password: SecretString::new("hunter2"),
        port: 5985,
    };
    let orchestrator = orchestrator(&cloud, RecordingProvisioner::completing());

    orchestrator
        .build(&settings)
        .await
        .expect("build should succeed");

    assert_eq!(
        orchestrator.redactions().scrub("password=hunter2"),
        "password=[REDACTED]"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn artifacts_serialise_for_reporting(cloud: ScriptedCloud, settings: BuildSettings) {
    let artifact = orchestrator(&cloud, RecordingProvisioner::completing())
        .build(&settings)
        .await
        .expect("build should succeed");

    let json = serde_json::to_value(&artifact).expect("artifact serialises");

    assert_eq!(
        json["image"]["description"],
        serde_json::Value::String(settings.snapshot_name.clone())
    );
    assert!(json["server"].is_null());
    assert!(json["halted_at"].is_null());
}
