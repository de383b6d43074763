//! Launching and tearing down the build instance.

use std::sync::Arc;

use tracing::{info, warn};

use super::super::{BuildError, BuildState};
use super::{into_action, retry_transient};
use crate::client::{Instance, LaunchRequest, instance_state};
use crate::config::{UserData, generated_name};
use crate::fs_util;
use crate::pipeline::{CleanupFuture, Step, StepFuture, Unwind};
use crate::poll::{self, StateChange};

/// Launches the instance and waits for it to run.
#[derive(Debug, Default)]
pub(crate) struct LaunchInstance {
    instance_id: Option<String>,
}

fn resolve_user_data(source: &UserData) -> Result<Option<String>, BuildError> {
    match source {
        UserData::None => Ok(None),
        UserData::Inline(payload) => Ok(Some(payload.clone())),
        UserData::File(path) => fs_util::read_to_string(path)
            .map(Some)
            .map_err(|message| BuildError::UserData {
                path: path.clone(),
                message,
            }),
    }
}

fn launch_request(state: &BuildState, image_id: String, user_data: Option<String>) -> LaunchRequest {
    let run = &state.settings.run;
    LaunchRequest {
        zone: run.availability_zone.clone(),
        project_id: state.settings.auth.project,
        image_id,
        instance_charge_type: run.instance_charge_type.clone(),
        instance_type: run.instance_type.clone(),
        system_disk_type: run.system_disk_type.clone(),
        system_disk_size: run.system_disk_size,
        vpc_id: run.vpc_id.clone(),
        subnet_id: run.subnet_id.clone(),
        internet_charge_type: run.internet_charge_type.clone(),
        internet_max_bandwidth_out: run.internet_max_bandwidth_out,
        public_ip_assigned: run.public_ip_assigned,
        instance_name: generated_name(),
        key_ids: state.key_ids.clone(),
        security_group_ids: run.security_group_ids.clone(),
        user_data,
    }
}

fn log_addresses(instance: &Instance) {
    if let Some(address) = instance.private_ips.first() {
        info!(instance_id = %instance.id, private_ip = %address, "instance private address");
    }
    if let Some(address) = instance.public_ips.first() {
        info!(instance_id = %instance.id, public_ip = %address, "instance public address");
    }
}

impl LaunchInstance {
    async fn execute(&mut self, state: &mut BuildState) -> Result<(), BuildError> {
        let image_id = state
            .source_image
            .as_ref()
            .map(|image| image.id.clone())
            .ok_or(BuildError::MissingState("source image"))?;
        let user_data = resolve_user_data(&state.settings.run.user_data)?;
        let request = launch_request(state, image_id, user_data);
        let client = Arc::clone(&state.client);

        info!(instance_name = %request.instance_name, "launching source instance");
        let instance_id = client
            .run_instances(&request)
            .await
            .map_err(BuildError::Launch)?
            .into_iter()
            .next()
            .ok_or(BuildError::NoInstance)?;
        self.instance_id = Some(instance_id.clone());
        state.temporary_key_attached = state.temporary_key_id.is_some();
        info!(instance_id = %instance_id, "waiting for instance to become ready");

        let pending = [instance_state::PENDING];
        let change = StateChange::new(&pending, instance_state::RUNNING).cancellable(&state.cancel);
        poll::wait_for_state(change, state.timing.poll.settings(), || {
            poll::instance_by_id(client.as_ref(), &instance_id)
        })
        .await
        .map_err(|source| BuildError::InstanceWait {
            instance_id: instance_id.clone(),
            source,
        })?;

        let instance = poll::describe_instance(client.as_ref(), &instance_id)
            .await
            .map_err(|source| BuildError::Describe {
                instance_id: instance_id.clone(),
                source,
            })?
            .ok_or_else(|| BuildError::InstanceMissing {
                instance_id: instance_id.clone(),
            })?
            .resource;
        log_addresses(&instance);
        state.instance = Some(instance);
        Ok(())
    }

    async fn teardown(&mut self, state: &mut BuildState) -> Vec<String> {
        let mut problems = Vec::new();
        let Some(instance_id) = self.instance_id.take() else {
            return problems;
        };
        let client = Arc::clone(&state.client);
        let instance_ids = [instance_id.clone()];

        if state.temporary_key_attached
            && let Some(key_id) = state.temporary_key_id.clone()
        {
            info!(key_id = %key_id, instance_id = %instance_id, "disassociating key before termination");
            let key_ids = [key_id.clone()];
            let unbound = retry_transient(state.timing.api_retry, None, "disassociate key pair", || {
                client.disassociate_key_pairs(&instance_ids, &key_ids, true)
            })
            .await;
            match unbound {
                Ok(()) => state.temporary_key_attached = false,
                Err(err) => problems.push(format!(
                    "could not disassociate key pair {key_id} from instance {instance_id}: {err}"
                )),
            }
        }

        info!(instance_id = %instance_id, "terminating source instance");
        let terminated = retry_transient(state.timing.api_retry, None, "terminate instance", || {
            client.terminate_instances(&instance_ids)
        })
        .await;
        if let Err(err) = terminated {
            problems.push(format!("could not terminate instance {instance_id}: {err}"));
            return problems;
        }

        info!(instance_id = %instance_id, "waiting for instance to cease existence");
        let gone = poll::wait_for_does_not_exist(None, state.timing.poll.settings(), || {
            poll::describe_instance(client.as_ref(), &instance_id)
        })
        .await;
        if let Err(err) = gone {
            warn!(instance_id = %instance_id, error = %err, "instance may still exist");
            problems.push(format!(
                "error waiting for instance {instance_id} to cease existence: {err}"
            ));
        }
        problems
    }
}

impl Step<BuildState, BuildError> for LaunchInstance {
    fn name(&self) -> &'static str {
        "run_instance"
    }

    fn run<'a>(&'a mut self, state: &'a mut BuildState) -> StepFuture<'a, BuildError> {
        Box::pin(async move { into_action(self.execute(state).await) })
    }

    fn cleanup<'a>(&'a mut self, state: &'a mut BuildState, _unwind: Unwind) -> CleanupFuture<'a> {
        Box::pin(self.teardown(state))
    }
}
