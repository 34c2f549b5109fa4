//! BDD step definitions for complete builds.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln::cloud::ActionStatus;
use kiln::settings::ImageFilter;
use kiln::test_support::{CloudCall, ScriptedTransport};
use kiln::ImageSelection;
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::BuildWorld;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<(), StepError> {
    if condition {
        Ok(())
    } else {
        Err(StepError::Assertion(message()))
    }
}

#[given("a build of \"{image}\" on \"{server_type}\" in \"{location}\"")]
fn build_of(build_world: &BuildWorld, image: String, server_type: String, location: String) {
    let mut settings = build_world.settings.borrow_mut();
    settings.image = ImageSelection::Direct(image);
    settings.server_type = server_type;
    settings.location = location;
}

#[given("a build filtering images by \"{selector}\"")]
fn build_filtering(build_world: &BuildWorld, selector: String) {
    build_world.settings.borrow_mut().image = ImageSelection::Filter(ImageFilter {
        with_selector: selector,
        most_recent: true,
    });
}

#[given("an image \"{id}\" created at \"{created}\"")]
fn image_exists(build_world: &BuildWorld, id: String, created: String) -> Result<(), StepError> {
    let timestamp: DateTime<Utc> = created
        .parse()
        .map_err(|err| StepError::Assertion(format!("invalid timestamp {created:?}: {err}")))?;
    build_world.cloud.add_image(&id, timestamp);
    Ok(())
}

#[given("the snapshot is skipped")]
fn snapshot_skipped(build_world: &BuildWorld) {
    build_world.settings.borrow_mut().skip_snapshot = true;
}

#[given("the server is kept")]
fn server_kept(build_world: &BuildWorld) {
    build_world.settings.borrow_mut().keep_server = true;
}

#[given("server creation fails with \"{message}\"")]
fn creation_fails(build_world: &BuildWorld, message: String) {
    build_world
        .cloud
        .queue_action_statuses("create_server", [ActionStatus::Failed { message }]);
}

#[given("the server never accepts connections")]
fn never_reachable(build_world: &BuildWorld) {
    *build_world.transport.borrow_mut() = ScriptedTransport::unreachable();
    build_world.settings.borrow_mut().timing.connectivity_timeout = Duration::from_millis(50);
}

#[when("the build runs")]
fn build_runs(build_world: &BuildWorld) -> Result<(), StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let orchestrator = build_world.orchestrator();
    let settings = build_world.settings.borrow().clone();
    let result = runtime.block_on(async move { orchestrator.build(&settings).await });
    *build_world.outcome.borrow_mut() = Some(result);
    Ok(())
}

#[then("the build succeeds without an image")]
fn succeeds_without_image(build_world: &BuildWorld) -> Result<(), StepError> {
    match build_world.outcome.borrow().as_ref() {
        Some(Ok(artifact)) => check(artifact.image.is_none(), || {
            format!("expected no image, got {:?}", artifact.image)
        }),
        Some(Err(failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {failure}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the build succeeds with an image")]
fn succeeds_with_image(build_world: &BuildWorld) -> Result<(), StepError> {
    match build_world.outcome.borrow().as_ref() {
        Some(Ok(artifact)) => check(artifact.image.is_some(), || {
            String::from("expected a snapshot image")
        }),
        Some(Err(failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {failure}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the build fails at \"{step}\" with \"{fragment}\"")]
fn fails_at(build_world: &BuildWorld, step: String, fragment: String) -> Result<(), StepError> {
    let outcome = build_world.outcome.borrow();
    let Some(Err(failure)) = outcome.as_ref() else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    check(failure.step.as_str() == step, || {
        format!("expected failure at {step}, got {}", failure.step)
    })?;
    let message = failure.error.to_string();
    check(message.contains(&fragment), || {
        format!("expected error containing {fragment:?}, got {message:?}")
    })
}

#[then("the server is deleted")]
fn server_deleted(build_world: &BuildWorld) -> Result<(), StepError> {
    let deletes = build_world.cloud.count("delete_server");
    check(deletes == 1, || format!("expected one delete_server, got {deletes}"))?;
    check(build_world.cloud.live_servers().is_empty(), || {
        String::from("no server should remain")
    })
}

#[then("no server is deleted")]
fn no_server_deleted(build_world: &BuildWorld) -> Result<(), StepError> {
    let deletes = build_world.cloud.count("delete_server");
    check(deletes == 0, || format!("expected no delete_server, got {deletes}"))
}

#[then("no server is created")]
fn no_server_created(build_world: &BuildWorld) -> Result<(), StepError> {
    let creates = build_world.cloud.count("create_server");
    check(creates == 0, || format!("expected no create_server, got {creates}"))
}

#[then("the generated key is deleted")]
fn key_deleted(build_world: &BuildWorld) -> Result<(), StepError> {
    let deletes = build_world.cloud.count("delete_keypair");
    check(deletes == 1, || format!("expected one delete_keypair, got {deletes}"))
}

#[then("the server was created from \"{image}\"")]
fn created_from(build_world: &BuildWorld, image: String) -> Result<(), StepError> {
    let used: Vec<String> = build_world
        .cloud
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            CloudCall::CreateServer(spec) => Some(spec.image),
            _ => None,
        })
        .collect();
    check(used == [image.clone()], || {
        format!("expected creation from {image}, got {used:?}")
    })
}
