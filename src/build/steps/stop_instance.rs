//! Stopping the instance before it is snapshotted.

use std::sync::Arc;

use tracing::{info, warn};

use super::super::{BuildError, BuildState};
use super::{into_action, retry_transient};
use crate::client::instance_state;
use crate::config::StopMode;
use crate::pipeline::{Step, StepFuture};
use crate::poll::{self, StateChange};

/// Stops the instance, or waits for someone else to, then unbinds the
/// temporary key so it can be deleted.
pub(crate) struct StopInstance;

impl StopInstance {
    async fn execute(state: &mut BuildState) -> Result<(), BuildError> {
        let mode = state.settings.run.stop;
        if mode == StopMode::Skip {
            info!("instance stop skipped");
            return Ok(());
        }
        let instance_id = state
            .instance_id()
            .map(ToOwned::to_owned)
            .ok_or(BuildError::MissingState("instance"))?;
        let client = Arc::clone(&state.client);
        let cancel = state.cancel.clone();
        let instance_ids = [instance_id.clone()];

        if mode == StopMode::Manual {
            warn!(
                instance_id = %instance_id,
                "automatic stop disabled; stop the instance from the provisioning commands or by hand"
            );
        } else {
            info!(instance_id = %instance_id, "stopping instance");
            retry_transient(state.timing.stop_retry, Some(&cancel), "stop instance", || {
                client.stop_instances(&instance_ids)
            })
            .await
            .map_err(|source| BuildError::Stop {
                instance_id: instance_id.clone(),
                source,
            })?;
        }

        info!(instance_id = %instance_id, "waiting for instance to stop");
        let pending = [instance_state::RUNNING, instance_state::STOPPING];
        let change = StateChange::new(&pending, instance_state::STOPPED).cancellable(&cancel);
        let stopped = poll::wait_for_state(change, state.timing.poll.settings(), || {
            poll::instance_by_id(client.as_ref(), &instance_id)
        })
        .await
        .map_err(|source| BuildError::StopWait {
            instance_id: instance_id.clone(),
            source,
        })?;
        state.instance = Some(stopped);

        if state.temporary_key_attached
            && let Some(key_id) = state.temporary_key_id.clone()
        {
            let key_ids = [key_id];
            let unbound = retry_transient(state.timing.api_retry, None, "disassociate key pair", || {
                client.disassociate_key_pairs(&instance_ids, &key_ids, false)
            })
            .await;
            match unbound {
                Ok(()) => state.temporary_key_attached = false,
                Err(err) => {
                    warn!(instance_id = %instance_id, error = %err, "could not disassociate temporary key pair");
                }
            }
        }
        Ok(())
    }
}

impl Step<BuildState, BuildError> for StopInstance {
    fn name(&self) -> &'static str {
        "stop_instance"
    }

    fn run<'a>(&'a mut self, state: &'a mut BuildState) -> StepFuture<'a, BuildError> {
        Box::pin(async move { into_action(Self::execute(state).await) })
    }
}
