//! Snapshotting the stopped instance into the output image.

use std::sync::Arc;

use tracing::info;

use super::super::{BuildError, BuildState};
use super::{into_action, retry_transient};
use crate::client::{UNASSIGNED_IMAGE_ID, image_state};
use crate::pipeline::{CleanupFuture, Step, StepFuture, Unwind};
use crate::poll::{self, StateChange};

/// Creates the image in the home region and waits until it is usable.
///
/// The image is deleted again when a later step fails or the build is
/// cancelled. Once the provider accepted the request the image is tracked by
/// name, so an image that never showed up during the build is still found
/// and removed.
#[derive(Debug, Default)]
pub(crate) struct CreateImage {
    requested_name: Option<String>,
    image_id: Option<String>,
}

impl CreateImage {
    async fn execute(&mut self, state: &mut BuildState) -> Result<(), BuildError> {
        let instance_id = state
            .instance_id()
            .map(ToOwned::to_owned)
            .ok_or(BuildError::MissingState("instance"))?;
        let name = state.settings.image.name.clone();
        let description = state.settings.image.description.clone();
        let client = Arc::clone(&state.client);
        let cancel = state.cancel.clone();
        let settings = state.timing.poll.settings();

        info!(instance_id = %instance_id, image_name = %name, "creating image");
        retry_transient(state.timing.api_retry, Some(&cancel), "create image", || {
            client.create_image(&instance_id, &name, &description)
        })
        .await
        .map_err(BuildError::CreateImage)?;
        self.requested_name = Some(name.clone());

        let wait_error = |source| BuildError::ImageWait {
            image_name: name.clone(),
            source,
        };
        let image = poll::wait_for_exists(Some(&cancel), settings, || {
            poll::image_by_name(client.as_ref(), &name)
        })
        .await
        .map_err(wait_error)?;
        self.image_id = Some(image.id.clone());
        state
            .images
            .insert(state.settings.auth.region.clone(), image.id.clone());

        info!(image_id = %image.id, "waiting for image to become usable");
        let pending = [image_state::SYNCING, image_state::PENDING];
        let change = StateChange::new(&pending, image_state::NORMAL).cancellable(&cancel);
        poll::wait_for_state(change, settings, || poll::image_by_id(client.as_ref(), &image.id))
            .await
            .map_err(wait_error)?;
        info!(image_id = %image.id, image_name = %name, "image created");
        Ok(())
    }

    async fn discard(&mut self, state: &mut BuildState, unwind: Unwind) -> Vec<String> {
        let mut problems = Vec::new();
        let requested_name = self.requested_name.take();
        if !unwind.is_failure() {
            return problems;
        }
        let client = Arc::clone(&state.client);
        let image_id = match (self.image_id.take(), requested_name) {
            (Some(image_id), _) => image_id,
            (None, Some(name)) => {
                info!(image_name = %name, "looking up image requested by failed build");
                let settings = state.timing.poll.settings();
                let (cloud, wanted) = (client.as_ref(), name.as_str());
                let lookup = poll::wait_for_exists(None, settings, || async move {
                    poll::image_by_name(cloud, wanted).await.map(|found| {
                        found.filter(|observed| observed.resource.id != UNASSIGNED_IMAGE_ID)
                    })
                })
                .await;
                match lookup {
                    Ok(image) => image.id,
                    Err(err) => {
                        problems.push(format!("could not find image {name} to delete it: {err}"));
                        return problems;
                    }
                }
            }
            (None, None) => return problems,
        };
        info!(image_id = %image_id, "deleting image from failed build");
        let ids = [image_id.clone()];
        match client.delete_images(&ids).await {
            Ok(()) => {
                let home = state.settings.auth.region.clone();
                state.images.remove(&home);
            }
            Err(err) => problems.push(format!("could not delete image {image_id}: {err}")),
        }
        problems
    }
}

impl Step<BuildState, BuildError> for CreateImage {
    fn name(&self) -> &'static str {
        "create_image"
    }

    fn run<'a>(&'a mut self, state: &'a mut BuildState) -> StepFuture<'a, BuildError> {
        Box::pin(async move { into_action(self.execute(state).await) })
    }

    fn cleanup<'a>(&'a mut self, state: &'a mut BuildState, unwind: Unwind) -> CleanupFuture<'a> {
        Box::pin(self.discard(state, unwind))
    }
}
