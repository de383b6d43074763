//! Concrete build steps, in pipeline order.

use std::future::Future;

use tracing::warn;

use super::{BuildError, BuildState};
use crate::cancel::CancelLatch;
use crate::client::ClientError;
use crate::pipeline::{Pipeline, StepAction};
use crate::retry::{RetryError, RetryPolicy, retry};

mod connect;
mod create_image;
mod deregister_image;
mod key_pair;
mod pre_validate;
mod provision;
mod region_copy;
mod run_instance;
mod source_image;
mod stop_instance;

pub(super) use connect::Connect;
pub(super) use create_image::CreateImage;
pub(super) use deregister_image::DeregisterImages;
pub(super) use key_pair::KeyMaterial;
pub(super) use pre_validate::PreValidate;
pub(super) use provision::Provision;
pub(super) use region_copy::ReplicateImage;
pub(super) use run_instance::LaunchInstance;
pub(super) use source_image::ResolveSourceImage;
pub(super) use stop_instance::StopInstance;

/// Assembles the build pipeline.
pub(super) fn pipeline() -> Pipeline<BuildState, BuildError> {
    let mut pipeline = Pipeline::new();
    pipeline.push(PreValidate);
    pipeline.push(ResolveSourceImage);
    pipeline.push(KeyMaterial::default());
    pipeline.push(LaunchInstance::default());
    pipeline.push(Connect);
    pipeline.push(Provision);
    pipeline.push(StopInstance);
    pipeline.push(DeregisterImages);
    pipeline.push(CreateImage::default());
    pipeline.push(ReplicateImage::default());
    pipeline
}

fn into_action(result: Result<(), BuildError>) -> StepAction<BuildError> {
    match result {
        Ok(()) => StepAction::Continue,
        Err(err) => StepAction::Halt(err),
    }
}

/// Retries `call` under `policy`, treating every provider error as
/// transient.
async fn retry_transient<F, Fut>(
    policy: RetryPolicy,
    cancel: Option<&CancelLatch>,
    operation: &'static str,
    mut call: F,
) -> Result<(), RetryError<ClientError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ClientError>>,
{
    retry(policy, cancel, |attempt| {
        let pending = call();
        async move {
            match pending.await {
                Ok(()) => Ok(true),
                Err(err) => {
                    warn!(operation, attempt, error = %err, "call failed; will retry");
                    Ok(false)
                }
            }
        }
    })
    .await
}
