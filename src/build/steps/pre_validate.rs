//! Up-front checks that need no remote calls.

use tracing::warn;

use super::super::{BuildError, BuildState};
use crate::pipeline::{Step, StepAction, StepFuture};

/// Warns when existing images are about to be replaced.
pub(crate) struct PreValidate;

impl Step<BuildState, BuildError> for PreValidate {
    fn name(&self) -> &'static str {
        "pre_validate"
    }

    fn run<'a>(&'a mut self, state: &'a mut BuildState) -> StepFuture<'a, BuildError> {
        if state.settings.image.force_deregister {
            warn!(
                image_name = %state.settings.image.name,
                "force deregister is set; existing images with this name will be deleted"
            );
        }
        Box::pin(std::future::ready(StepAction::Continue))
    }
}
