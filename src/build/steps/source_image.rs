//! Source image resolution.

use std::sync::Arc;

use tracing::info;

use super::super::{BuildError, BuildState};
use super::into_action;
use crate::image_filter::resolve_source_image;
use crate::pipeline::{Step, StepFuture};

/// Resolves the configured source image into a concrete image.
pub(crate) struct ResolveSourceImage;

impl ResolveSourceImage {
    async fn execute(state: &mut BuildState) -> Result<(), BuildError> {
        let client = Arc::clone(&state.client);
        let image = resolve_source_image(client.as_ref(), &state.settings.source)
            .await
            .map_err(BuildError::SourceImage)?;
        info!(image_id = %image.id, image_name = %image.name, "using source image");
        state.source_image = Some(image);
        Ok(())
    }
}

impl Step<BuildState, BuildError> for ResolveSourceImage {
    fn name(&self) -> &'static str {
        "source_image"
    }

    fn run<'a>(&'a mut self, state: &'a mut BuildState) -> StepFuture<'a, BuildError> {
        Box::pin(async move { into_action(Self::execute(state).await) })
    }
}
