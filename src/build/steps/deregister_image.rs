//! Removing images that would clash with the new image's name.

use std::sync::Arc;

use tracing::info;

use super::super::{BuildError, BuildState};
use super::into_action;
use crate::client::ImageQuery;
use crate::pipeline::{Step, StepFuture};

/// Deletes private images named like the output in every target region.
/// Only active with `force_deregister`.
pub(crate) struct DeregisterImages;

fn regions_to_clean(home: &str, targets: &[String]) -> Vec<String> {
    let mut regions: Vec<String> = Vec::with_capacity(targets.len() + 1);
    for region in targets.iter().map(String::as_str).chain(std::iter::once(home)) {
        if !regions.iter().any(|seen| seen == region) {
            regions.push(region.to_owned());
        }
    }
    regions
}

impl DeregisterImages {
    async fn execute(state: &mut BuildState) -> Result<(), BuildError> {
        if !state.settings.image.force_deregister {
            return Ok(());
        }
        let name = state.settings.image.name.clone();
        let client = Arc::clone(&state.client);
        let query = ImageQuery::private_named(name.as_str());
        for region in regions_to_clean(state.home_region(), &state.settings.image.regions) {
            let regional = client.for_region(&region);
            let page = regional
                .describe_images(&query)
                .await
                .map_err(|source| BuildError::Deregister {
                    region: region.clone(),
                    source,
                })?;
            for image in page.images.into_iter().filter(|image| image.name == name) {
                info!(region = %region, image_id = %image.id, image_name = %name, "deleting existing image");
                let ids = [image.id];
                regional
                    .delete_images(&ids)
                    .await
                    .map_err(|source| BuildError::Deregister {
                        region: region.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }
}

impl Step<BuildState, BuildError> for DeregisterImages {
    fn name(&self) -> &'static str {
        "deregister_image"
    }

    fn run<'a>(&'a mut self, state: &'a mut BuildState) -> StepFuture<'a, BuildError> {
        Box::pin(async move { into_action(Self::execute(state).await) })
    }
}
