//! Connecting the communicator to the instance.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info};

use super::super::{BuildError, BuildState};
use super::into_action;
use crate::client::Instance;
use crate::config::SshInterface;
use crate::pipeline::{CleanupFuture, Step, StepFuture, Unwind};
use crate::poll;

/// Extra describe calls made while the instance has no usable address.
const ADDRESS_RETRIES: u32 = 2;

/// Resolves the instance address and opens a remote shell.
pub(crate) struct Connect;

fn address_of(instance: &Instance, interface: SshInterface) -> Option<String> {
    let addresses = match interface {
        SshInterface::PublicIp => &instance.public_ips,
        SshInterface::PrivateIp => &instance.private_ips,
    };
    addresses
        .iter()
        .find(|address| !address.is_empty())
        .cloned()
}

impl Connect {
    async fn resolve_host(state: &mut BuildState) -> Result<String, BuildError> {
        let interface = state.settings.access.interface;
        let mut instance = state
            .instance
            .clone()
            .ok_or(BuildError::MissingState("instance"))?;
        let client = Arc::clone(&state.client);
        for attempt in 0..=ADDRESS_RETRIES {
            if let Some(host) = address_of(&instance, interface) {
                return Ok(host);
            }
            if attempt == ADDRESS_RETRIES {
                break;
            }
            if state.cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            debug!(instance_id = %instance.id, attempt, "instance has no address yet");
            sleep(state.timing.address_retry_delay).await;
            if state.cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            instance = poll::describe_instance(client.as_ref(), &instance.id)
                .await
                .map_err(|source| BuildError::Describe {
                    instance_id: instance.id.clone(),
                    source,
                })?
                .ok_or_else(|| BuildError::InstanceMissing {
                    instance_id: instance.id.clone(),
                })?
                .resource;
            state.instance = Some(instance.clone());
        }
        Err(BuildError::NoAddress {
            instance_id: instance.id,
        })
    }

    async fn execute(state: &mut BuildState) -> Result<(), BuildError> {
        if !state.settings.access.enabled {
            info!("communicator disabled; not connecting");
            return Ok(());
        }
        let host = Self::resolve_host(state).await?;
        let credential = state
            .credential
            .clone()
            .ok_or(BuildError::MissingState("login credential"))?;
        let port = state.settings.access.port;
        info!(host = %host, port, "connecting to instance");
        let communicator = Arc::clone(&state.communicator);
        let cancel = state.cancel.clone();
        let shell = communicator
            .connect(&host, port, &credential, &cancel)
            .await?;
        info!(host = %host, "connected");
        state.host = Some(host);
        state.shell = Some(shell);
        Ok(())
    }
}

impl Step<BuildState, BuildError> for Connect {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn run<'a>(&'a mut self, state: &'a mut BuildState) -> StepFuture<'a, BuildError> {
        Box::pin(async move { into_action(Self::execute(state).await) })
    }

    fn cleanup<'a>(&'a mut self, state: &'a mut BuildState, _unwind: Unwind) -> CleanupFuture<'a> {
        if state.shell.take().is_some() {
            debug!("closed remote shell");
        }
        Box::pin(std::future::ready(Vec::new()))
    }
}
