//! BDD scenarios for complete builds.

use rstest_bdd_macros::scenario;

use super::test_helpers::{BuildWorld, build_world};

#[scenario(
    path = "tests/features/build.feature",
    name = "Skipping the snapshot still removes every temporary resource"
)]
fn scenario_skip_snapshot(build_world: BuildWorld) {
    drop(build_world);
}

#[scenario(
    path = "tests/features/build.feature",
    name = "A failed server creation removes the key but no server"
)]
fn scenario_creation_failure(build_world: BuildWorld) {
    drop(build_world);
}

#[scenario(
    path = "tests/features/build.feature",
    name = "A kept server outlives the build"
)]
fn scenario_keep_server(build_world: BuildWorld) {
    drop(build_world);
}

#[scenario(
    path = "tests/features/build.feature",
    name = "An image filter without matches stops before creating a server"
)]
fn scenario_no_matching_image(build_world: BuildWorld) {
    drop(build_world);
}

#[scenario(
    path = "tests/features/build.feature",
    name = "The newest matching image is used"
)]
fn scenario_newest_image(build_world: BuildWorld) {
    drop(build_world);
}

#[scenario(
    path = "tests/features/build.feature",
    name = "An unreachable server times out and is cleaned up"
)]
fn scenario_unreachable_server(build_world: BuildWorld) {
    drop(build_world);
}
