//! BDD step definitions for the build pipeline.

use std::sync::Arc;

use kiln::test_support::{fast_timing, image};
use kiln::{Builder, CancelLatch, FirstSubnet};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{BuildContext, BuildResult, HOME_REGION};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a source image in the home region")]
fn source_image_exists(build_context: BuildContext) -> BuildContext {
    build_context.cloud.add_image(
        HOME_REGION,
        image("img-source", "ubuntu-22.04", "", "2024-01-01T00:00:00Z"),
    );
    build_context
}

#[given("no source image exists")]
fn no_source_image(build_context: BuildContext) -> BuildContext {
    build_context
}

#[given("the image is copied to \"{regions}\"")]
fn image_is_copied(mut build_context: BuildContext, regions: String) -> BuildContext {
    build_context.config.image_regions = Some(regions);
    build_context
}

#[given("copies never reach \"{region}\"")]
fn copies_never_reach(build_context: BuildContext, region: String) -> BuildContext {
    build_context.cloud.skip_copies_to(region.trim());
    build_context
}

#[given("the provisioning command \"{command}\" fails with exit code {code:i32}")]
fn provisioning_command_fails(
    mut build_context: BuildContext,
    command: String,
    code: i32,
) -> BuildContext {
    build_context.config.provision_commands = Some(command);
    build_context.communicator.push_exit_code(code);
    build_context
}

#[when("I run the build")]
fn run_build(mut build_context: BuildContext) -> Result<BuildContext, StepError> {
    let settings = build_context
        .config
        .settings(&mut FirstSubnet)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let builder = Builder::new(
        settings,
        Arc::new(build_context.cloud.clone()),
        Arc::new(build_context.communicator.clone()),
    )
    .with_timing(fast_timing());
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let result = runtime.block_on(builder.run(&CancelLatch::new()));
    build_context.outcome = Some(match result {
        Ok(output) => BuildResult::Success {
            images: output.artifact.images().clone(),
            warnings: output
                .warnings
                .into_iter()
                .map(|warning| warning.message)
                .collect(),
        },
        Err(failure) => BuildResult::Failure {
            message: failure.to_string(),
        },
    });
    Ok(build_context)
}

#[then("the build produces images in {count:u32} regions")]
fn produces_images(build_context: &BuildContext, count: u32) -> Result<(), StepError> {
    let Some(BuildResult::Success { images, warnings }) = build_context.outcome.as_ref() else {
        return Err(StepError::Assertion(format!(
            "expected a successful build, got {:?}",
            build_context.outcome
        )));
    };
    if !warnings.is_empty() {
        return Err(StepError::Assertion(format!(
            "unexpected cleanup warnings: {warnings:?}"
        )));
    }
    if usize::try_from(count).ok() == Some(images.len()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected images in {count} regions, got {images:?}"
        )))
    }
}

#[then("the build fails mentioning \"{text}\"")]
fn build_fails(build_context: &BuildContext, text: String) -> Result<(), StepError> {
    match build_context.outcome.as_ref() {
        Some(BuildResult::Failure { message }) if message.contains(text.as_str()) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a failure mentioning `{text}`, got {other:?}"
        ))),
    }
}

#[then("no image named \"{name}\" remains in \"{region}\"")]
fn no_image_remains(
    build_context: &BuildContext,
    name: String,
    region: String,
) -> Result<(), StepError> {
    let leftovers: Vec<String> = build_context
        .cloud
        .images(&region)
        .into_iter()
        .filter(|image| image.name == name)
        .map(|image| image.id)
        .collect();
    if leftovers.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "images left in {region}: {leftovers:?}"
        )))
    }
}

#[then("no temporary resources remain")]
fn no_temporary_resources(build_context: &BuildContext) -> Result<(), StepError> {
    let instances = build_context.cloud.instance_ids();
    let key_pairs = build_context.cloud.key_pair_ids();
    if instances.is_empty() && key_pairs.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "left behind instances {instances:?} and key pairs {key_pairs:?}"
        )))
    }
}

#[then("no instance was launched")]
fn no_instance_launched(build_context: &BuildContext) -> Result<(), StepError> {
    if build_context.cloud.launches().is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "an instance was launched",
        )))
    }
}
