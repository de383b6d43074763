//! BDD scenarios for the build pipeline.

use rstest_bdd_macros::scenario;

use super::test_helpers::{BuildContext, build_context};

#[scenario(
    path = "tests/features/build.feature",
    name = "Build an image in the home region"
)]
fn scenario_build_home_image(build_context: BuildContext) {
    let _ = build_context;
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Copy the image to further regions"
)]
fn scenario_copy_to_regions(build_context: BuildContext) {
    let _ = build_context;
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Remove every image when a region copy fails"
)]
fn scenario_partial_copy_failure(build_context: BuildContext) {
    let _ = build_context;
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Halt on a failing provisioning command"
)]
fn scenario_provisioning_failure(build_context: BuildContext) {
    let _ = build_context;
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Fail cleanly when the source image is missing"
)]
fn scenario_missing_source_image(build_context: BuildContext) {
    let _ = build_context;
}
