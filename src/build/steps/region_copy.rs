//! Copying the image to the extra regions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::super::{BuildError, BuildState};
use super::into_action;
use crate::pipeline::{CleanupFuture, Step, StepFuture, Unwind};
use crate::replication::{ReplicationRequest, replicate};

/// Replicates the home image and records every copy in the state.
///
/// Copies found before a failure are deleted during cleanup; successful
/// copies stay with the artifact.
#[derive(Debug, Default)]
pub(crate) struct ReplicateImage {
    copies: BTreeMap<String, String>,
}

impl ReplicateImage {
    async fn execute(&mut self, state: &mut BuildState) -> Result<(), BuildError> {
        if state.settings.image.regions.is_empty() {
            return Ok(());
        }
        let home = state.home_region().to_owned();
        let image_id = state
            .images
            .get(&home)
            .cloned()
            .ok_or(BuildError::MissingState("home region image"))?;
        let client = Arc::clone(&state.client);
        let cancel = state.cancel.clone();
        let request = ReplicationRequest {
            image_id: &image_id,
            image_name: &state.settings.image.name,
            regions: &state.settings.image.regions,
        };
        match replicate(
            client.as_ref(),
            request,
            state.timing.replication,
            state.timing.poll,
            &cancel,
        )
        .await
        {
            Ok(copies) => {
                state.images.extend(copies);
                Ok(())
            }
            Err(err) => {
                if let Some(resolved) = err.resolved() {
                    self.copies.clone_from(resolved);
                }
                Err(BuildError::from(err))
            }
        }
    }

    async fn discard(&mut self, state: &mut BuildState, unwind: Unwind) -> Vec<String> {
        let mut problems = Vec::new();
        if !unwind.is_failure() {
            return problems;
        }
        let client = Arc::clone(&state.client);
        for (region, image_id) in std::mem::take(&mut self.copies) {
            info!(region = %region, image_id = %image_id, "deleting image copy from failed build");
            let ids = [image_id.clone()];
            let regional = client.for_region(&region);
            if let Err(err) = regional.delete_images(&ids).await {
                warn!(region = %region, image_id = %image_id, error = %err, "could not delete image copy");
                problems.push(format!(
                    "could not delete image copy {image_id} in region {region}: {err}"
                ));
            }
            state.images.remove(&region);
        }
        problems
    }
}

impl Step<BuildState, BuildError> for ReplicateImage {
    fn name(&self) -> &'static str {
        "region_copy"
    }

    fn run<'a>(&'a mut self, state: &'a mut BuildState) -> StepFuture<'a, BuildError> {
        Box::pin(async move { into_action(self.execute(state).await) })
    }

    fn cleanup<'a>(&'a mut self, state: &'a mut BuildState, unwind: Unwind) -> CleanupFuture<'a> {
        Box::pin(self.discard(state, unwind))
    }
}
