//! End-to-end tests for the build pipeline against the in-memory cloud.

use std::sync::Arc;

use rstest::{fixture, rstest};

use super::*;
use crate::client::image_state;
use crate::config::{BuildConfig, FirstSubnet};
use crate::pipeline::StepStatus;
use crate::poll::PollError;
use crate::retry::RetryError;
use crate::test_support::{
    FAKE_PRIVATE_IP, FAKE_PUBLIC_IP, FakeCloud, FakeCommunicator, api_error, fast_timing, image,
    sample_config,
};

struct Harness {
    cloud: FakeCloud,
    communicator: FakeCommunicator,
}

impl Harness {
    fn builder(&self, config: &BuildConfig) -> Builder {
        let settings = config.settings(&mut FirstSubnet).expect("valid configuration");
        Builder::new(
            settings,
            Arc::new(self.cloud.clone()),
            Arc::new(self.communicator.clone()),
        )
        .with_timing(fast_timing())
    }

    async fn run(&self, config: &BuildConfig) -> Result<BuildOutput, BuildFailure> {
        self.builder(config).run(&CancelLatch::new()).await
    }

    fn assert_nothing_left_running(&self) {
        assert!(self.cloud.instance_ids().is_empty(), "instances left behind");
        assert!(self.cloud.key_pair_ids().is_empty(), "key pairs left behind");
    }

    fn image_names(&self, region: &str) -> Vec<String> {
        self.cloud
            .images(region)
            .into_iter()
            .map(|image| image.name)
            .collect()
    }
}

#[fixture]
fn harness() -> Harness {
    let cloud = FakeCloud::new("home");
    cloud.add_image(
        "home",
        image("img-source", "ubuntu-22.04", "", "2024-01-01T00:00:00Z"),
    );
    Harness {
        cloud,
        communicator: FakeCommunicator::new(),
    }
}

fn status_of(steps: &[StepRecord], name: &str) -> StepStatus {
    steps
        .iter()
        .find(|record| record.name == name)
        .map(|record| record.status)
        .expect("step is part of the pipeline")
}

#[rstest]
fn steps_run_in_build_order(harness: Harness) {
    assert_eq!(
        harness.builder(&sample_config()).step_names(),
        vec![
            "pre_validate",
            "source_image",
            "key_pair",
            "run_instance",
            "connect",
            "provision",
            "stop_instance",
            "deregister_image",
            "create_image",
            "region_copy",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn successful_build_produces_home_image_and_cleans_up(harness: Harness) {
    let output = harness.run(&sample_config()).await.expect("build succeeds");

    let images = output.artifact.images();
    assert_eq!(images.keys().collect::<Vec<_>>(), vec!["home"]);
    let image_id = images.get("home").expect("home image");
    let created = harness
        .cloud
        .images("home")
        .into_iter()
        .find(|image| &image.id == image_id)
        .expect("image exists");
    assert_eq!(created.name, "kiln-web");
    assert_eq!(created.state, image_state::NORMAL);

    assert!(output.warnings.is_empty(), "{:?}", output.warnings);
    assert!(
        output
            .steps
            .iter()
            .all(|record| record.status == StepStatus::Completed)
    );
    harness.assert_nothing_left_running();
    assert_eq!(
        harness.communicator.connections(),
        vec![(FAKE_PUBLIC_IP.to_owned(), 22, String::from("root"))]
    );
}

#[rstest]
#[tokio::test]
async fn launch_uses_source_image_and_temporary_key(harness: Harness) {
    harness.run(&sample_config()).await.expect("build succeeds");

    let launches = harness.cloud.launches();
    let request = launches.first().expect("one launch");
    assert_eq!(request.image_id, "img-source");
    assert_eq!(request.zone, "home-1");
    assert_eq!(request.subnet_id, "subnet-a");
    assert_eq!(request.key_ids.len(), 1);
    assert!(request.instance_name.starts_with("kiln_"));
}

#[rstest]
#[tokio::test]
async fn temporary_key_is_unbound_after_stop_and_deleted(harness: Harness) {
    harness.run(&sample_config()).await.expect("build succeeds");

    let operations = harness.cloud.operations();
    let position = |name: &str| {
        operations
            .iter()
            .position(|operation| *operation == name)
            .unwrap_or_else(|| panic!("{name} was never called"))
    };
    assert!(position("stop_instances") < position("disassociate_key_pairs"));
    assert!(position("disassociate_key_pairs") < position("create_image"));
    assert!(position("terminate_instances") < position("delete_key_pairs"));
    assert_eq!(harness.cloud.count("home", "disassociate_key_pairs"), 1);
}

#[rstest]
#[tokio::test]
async fn provisioning_commands_run_with_build_environment(harness: Harness) {
    let mut config = sample_config();
    config.provision_commands = Some(String::from("apt-get update;;touch /etc/baked"));

    harness.run(&config).await.expect("build succeeds");

    assert_eq!(
        harness.communicator.commands(),
        vec![
            "export KILN_BUILD_NAME=kiln; export KILN_IMAGE_NAME=kiln-web; apt-get update",
            "export KILN_BUILD_NAME=kiln; export KILN_IMAGE_NAME=kiln-web; touch /etc/baked",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn failing_command_halts_before_image_creation(harness: Harness) {
    let mut config = sample_config();
    config.provision_commands = Some(String::from("false;;echo never"));
    harness.communicator.push_exit_code(3);

    let failure = harness.run(&config).await.expect_err("build fails");

    assert_eq!(
        failure.error,
        BuildError::Provision {
            command: String::from("false"),
            code: Some(3),
            stderr: String::new(),
        }
    );
    assert_eq!(status_of(&failure.steps, "provision"), StepStatus::Failed);
    assert_eq!(status_of(&failure.steps, "create_image"), StepStatus::NotRun);
    assert_eq!(harness.communicator.commands().len(), 1);
    assert_eq!(harness.cloud.count("home", "create_image"), 0);
    harness.assert_nothing_left_running();
}

#[rstest]
#[tokio::test]
async fn private_interface_connects_to_private_address(harness: Harness) {
    let mut config = sample_config();
    config.ssh_interface = String::from("private_ip");

    harness.run(&config).await.expect("build succeeds");

    assert_eq!(
        harness.communicator.connections(),
        vec![(FAKE_PRIVATE_IP.to_owned(), 22, String::from("root"))]
    );
}

#[rstest]
#[tokio::test]
async fn missing_address_fails_after_redescribing(harness: Harness) {
    harness
        .cloud
        .set_instance_addresses(Vec::new(), vec![FAKE_PRIVATE_IP.to_owned()]);

    let failure = harness.run(&sample_config()).await.expect_err("build fails");

    assert!(matches!(failure.error, BuildError::NoAddress { .. }));
    assert!(harness.communicator.connections().is_empty());
    harness.assert_nothing_left_running();
}

#[rstest]
#[tokio::test]
async fn communicator_none_skips_remote_access(harness: Harness) {
    let mut config = sample_config();
    config.communicator = String::from("none");

    harness.run(&config).await.expect("build succeeds");

    assert!(harness.communicator.connections().is_empty());
    harness.assert_nothing_left_running();
}

#[rstest]
#[tokio::test]
async fn skipped_stop_never_calls_stop(harness: Harness) {
    let mut config = sample_config();
    config.skip_stop_instance = true;

    harness.run(&config).await.expect("build succeeds");

    assert_eq!(harness.cloud.count("home", "stop_instances"), 0);
}

#[rstest]
#[tokio::test]
async fn unknown_source_image_halts_before_launch(harness: Harness) {
    let mut config = sample_config();
    config.source_image_id = Some(String::from("img-missing"));

    let failure = harness.run(&config).await.expect_err("build fails");

    assert!(matches!(failure.error, BuildError::SourceImage(_)));
    assert!(harness.cloud.launches().is_empty());
    assert_eq!(status_of(&failure.steps, "key_pair"), StepStatus::NotRun);
}

#[rstest]
#[tokio::test]
async fn empty_launch_response_is_reported(harness: Harness) {
    harness.cloud.launch_returns_nothing();

    let failure = harness.run(&sample_config()).await.expect_err("build fails");

    assert_eq!(failure.error, BuildError::NoInstance);
    assert!(harness.cloud.key_pair_ids().is_empty());
}

#[rstest]
#[tokio::test]
async fn image_creation_is_retried_then_reported(harness: Harness) {
    harness
        .cloud
        .fail_always("home", "create_image", api_error("CreateImage"));

    let failure = harness.run(&sample_config()).await.expect_err("build fails");

    assert_eq!(
        failure.error,
        BuildError::CreateImage(RetryError::Exhausted { attempts: 3 })
    );
    assert_eq!(harness.cloud.count("home", "create_image"), 3);
    harness.assert_nothing_left_running();
}

#[rstest]
#[tokio::test]
async fn image_is_copied_to_extra_regions(harness: Harness) {
    let mut config = sample_config();
    config.image_regions = Some(String::from("home,far,near"));

    let output = harness.run(&config).await.expect("build succeeds");

    assert_eq!(
        output.artifact.images().keys().collect::<Vec<_>>(),
        vec!["far", "home", "near"]
    );
    assert_eq!(harness.image_names("far"), vec!["kiln-web"]);
    assert_eq!(harness.image_names("near"), vec!["kiln-web"]);
}

#[rstest]
#[tokio::test]
async fn partial_replication_failure_removes_every_image(harness: Harness) {
    let mut config = sample_config();
    config.image_regions = Some(String::from("far,near"));
    harness.cloud.skip_copies_to("near");

    let failure = harness.run(&config).await.expect_err("build fails");

    let BuildError::Replication(err) = &failure.error else {
        panic!("expected a replication error, got {:?}", failure.error);
    };
    assert!(err.resolved().is_some_and(|resolved| resolved.contains_key("far")));
    assert!(harness.image_names("far").is_empty());
    assert!(!harness.image_names("home").contains(&String::from("kiln-web")));
    assert!(failure.warnings.is_empty(), "{:?}", failure.warnings);
    harness.assert_nothing_left_running();
}

#[rstest]
#[tokio::test]
async fn forced_deregistration_replaces_existing_images(harness: Harness) {
    let mut config = sample_config();
    config.force_deregister = true;
    config.image_regions = Some(String::from("far"));
    harness.cloud.add_image(
        "home",
        image("img-old-home", "kiln-web", "", "2023-01-01T00:00:00Z"),
    );
    harness.cloud.add_image(
        "far",
        image("img-old-far", "kiln-web", "", "2023-01-01T00:00:00Z"),
    );

    let output = harness.run(&config).await.expect("build succeeds");

    for region in ["home", "far"] {
        let ids: Vec<String> = harness
            .cloud
            .images(region)
            .into_iter()
            .filter(|image| image.name == "kiln-web")
            .map(|image| image.id)
            .collect();
        assert_eq!(ids.len(), 1, "{region}: {ids:?}");
        assert_eq!(output.artifact.images().get(region), ids.first());
    }
}

#[rstest]
#[tokio::test]
async fn existing_images_are_kept_without_force(harness: Harness) {
    harness.cloud.add_image(
        "home",
        image("img-old-home", "kiln-web", "", "2023-01-01T00:00:00Z"),
    );

    harness.run(&sample_config()).await.expect("build succeeds");

    assert_eq!(harness.cloud.count("home", "delete_images"), 0);
}

#[rstest]
#[tokio::test]
async fn cancelled_build_reports_cancellation(harness: Harness) {
    let cancel = CancelLatch::new();
    cancel.cancel();

    let failure = harness
        .builder(&sample_config())
        .run(&cancel)
        .await
        .expect_err("build is cancelled");

    assert_eq!(failure.error, BuildError::Cancelled);
    assert!(
        failure
            .steps
            .iter()
            .all(|record| record.status == StepStatus::NotRun)
    );
    assert!(harness.cloud.launches().is_empty());
}

#[rstest]
#[tokio::test]
async fn cleanup_failures_are_reported_as_warnings(harness: Harness) {
    let mut config = sample_config();
    config.provision_commands = Some(String::from("false"));
    harness.communicator.push_exit_code(1);
    harness
        .cloud
        .fail_always("home", "delete_key_pairs", api_error("DeleteKeyPairs"));

    let failure = harness.run(&config).await.expect_err("build fails");

    assert!(matches!(failure.error, BuildError::Provision { .. }));
    assert_eq!(failure.warnings.len(), 1);
    let warning = failure.warnings.first().expect("one warning");
    assert_eq!(warning.step, "key_pair");
    assert!(failure.to_string().contains("cleanup warning (key_pair)"));
    assert_eq!(harness.cloud.key_pair_ids().len(), 1);
}

#[rstest]
#[tokio::test]
async fn cancellation_during_launch_wait_terminates_the_instance(harness: Harness) {
    let cancel = CancelLatch::new();
    harness.cloud.launch_pending();
    harness.cloud.cancel_on("describe_instances", 1, &cancel);

    let failure = harness
        .builder(&sample_config())
        .run(&cancel)
        .await
        .expect_err("build is cancelled");

    assert_eq!(failure.error, BuildError::Cancelled);
    assert_eq!(harness.cloud.count("home", "terminate_instances"), 1);
    assert_eq!(status_of(&failure.steps, "connect"), StepStatus::NotRun);
    assert!(failure.warnings.is_empty(), "{:?}", failure.warnings);
    harness.assert_nothing_left_running();
}

#[rstest]
#[tokio::test]
async fn cancellation_stops_waiting_for_an_address(harness: Harness) {
    let cancel = CancelLatch::new();
    harness.cloud.set_instance_addresses(Vec::new(), Vec::new());
    // Launch wait and post-launch describe come first; the third call is the
    // first re-describe made while looking for an address.
    harness.cloud.cancel_on("describe_instances", 3, &cancel);

    let failure = harness
        .builder(&sample_config())
        .run(&cancel)
        .await
        .expect_err("build is cancelled");

    assert_eq!(failure.error, BuildError::Cancelled);
    assert!(harness.communicator.connections().is_empty());
    let operations = harness.cloud.operations();
    let third_describe = operations
        .iter()
        .enumerate()
        .filter(|(_, operation)| **operation == "describe_instances")
        .nth(2)
        .map(|(index, _)| index)
        .expect("three describe calls");
    assert_eq!(
        operations.get(third_describe + 1),
        Some(&"disassociate_key_pairs"),
        "{operations:?}"
    );
    harness.assert_nothing_left_running();
}

#[rstest]
#[tokio::test]
async fn cancellation_after_image_request_removes_the_image(harness: Harness) {
    let cancel = CancelLatch::new();
    harness.cloud.cancel_on("create_image", 1, &cancel);

    let failure = harness
        .builder(&sample_config())
        .run(&cancel)
        .await
        .expect_err("build is cancelled");

    assert_eq!(failure.error, BuildError::Cancelled);
    assert_eq!(harness.image_names("home"), vec!["ubuntu-22.04"]);
    assert_eq!(harness.cloud.count("home", "delete_images"), 1);
    assert!(failure.warnings.is_empty(), "{:?}", failure.warnings);
    harness.assert_nothing_left_running();
}

#[rstest]
#[tokio::test]
async fn image_that_appears_late_is_removed_after_the_wait_times_out(harness: Harness) {
    // Outlasts the six observations of the build's existence wait but not the
    // cleanup lookup.
    harness.cloud.hide_new_images_for(8);

    let failure = harness.run(&sample_config()).await.expect_err("build fails");

    let BuildError::ImageWait { image_name, source } = &failure.error else {
        panic!("expected an image wait error, got {:?}", failure.error);
    };
    assert_eq!(image_name, "kiln-web");
    assert!(matches!(source, PollError::Timeout { .. }), "{source:?}");
    assert_eq!(harness.image_names("home"), vec!["ubuntu-22.04"]);
    assert!(failure.warnings.is_empty(), "{:?}", failure.warnings);
    harness.assert_nothing_left_running();
}

#[rstest]
#[tokio::test]
async fn image_that_never_appears_is_reported_as_a_warning(harness: Harness) {
    harness.cloud.hide_new_images_for(u32::MAX);

    let failure = harness.run(&sample_config()).await.expect_err("build fails");

    assert!(matches!(failure.error, BuildError::ImageWait { .. }));
    let warning = failure.warnings.first().expect("one warning");
    assert_eq!(warning.step, "create_image");
    assert!(warning.message.contains("kiln-web"), "{}", warning.message);
    harness.assert_nothing_left_running();
}

#[rstest]
#[tokio::test]
async fn failed_copy_removes_copies_in_every_region(harness: Harness) {
    let mut config = sample_config();
    config.image_regions = Some(String::from("far,near"));
    harness.cloud.break_copies_to("near");

    let failure = harness.run(&config).await.expect_err("build fails");

    let BuildError::Replication(err) = &failure.error else {
        panic!("expected a replication error, got {:?}", failure.error);
    };
    let resolved = err.resolved().expect("resolved copies");
    assert!(resolved.contains_key("far") && resolved.contains_key("near"));
    assert!(err.to_string().contains("near"), "{err}");
    assert_eq!(harness.cloud.count("far", "delete_images"), 1);
    assert_eq!(harness.cloud.count("near", "delete_images"), 1);
    for region in ["home", "far", "near"] {
        assert!(
            !harness.image_names(region).contains(&String::from("kiln-web")),
            "{region} still holds the image"
        );
    }
    assert!(failure.warnings.is_empty(), "{:?}", failure.warnings);
    harness.assert_nothing_left_running();
}
