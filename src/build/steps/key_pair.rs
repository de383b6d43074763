//! Login key material.
//!
//! The key comes from a local file, from a key pair created for the build,
//! or not at all when logging in with a password or without a communicator.
//! Only the temporary key pair and its debug copy are cleaned up.

use std::sync::Arc;

use tracing::{info, warn};

use super::super::{BuildError, BuildState};
use super::{into_action, retry_transient};
use crate::communicator::Credential;
use crate::config::KeySource;
use crate::fs_util;
use crate::pipeline::{CleanupFuture, Step, StepFuture, Unwind};

/// Provides the credential and the key pairs to install on the instance.
#[derive(Debug, Default)]
pub(crate) struct KeyMaterial {
    created_key_id: Option<String>,
    debug_key_path: Option<String>,
}

impl KeyMaterial {
    async fn execute(&mut self, state: &mut BuildState) -> Result<(), BuildError> {
        let username = state.settings.access.username.clone();
        match state.settings.access.key.clone() {
            KeySource::File { path, key_pair_id } => {
                info!(path = %path, "using provided private key for SSH");
                let private_key = fs_util::read_to_string(&path)
                    .map_err(|message| BuildError::KeyFile { path, message })?;
                state.credential = Some(Credential::PrivateKey {
                    username,
                    private_key,
                });
                state.key_ids = key_pair_id.into_iter().collect();
            }
            KeySource::None => {
                info!("no SSH key pair is being used");
                state.credential = state
                    .settings
                    .access
                    .password
                    .clone()
                    .filter(|_| state.settings.access.enabled)
                    .map(|password| Credential::Password { username, password });
            }
            KeySource::Temporary { name } => {
                info!(key_name = %name, "creating temporary key pair");
                let client = Arc::clone(&state.client);
                let key_pair = client
                    .create_key_pair(&name, state.settings.auth.project)
                    .await
                    .map_err(BuildError::CreateKeyPair)?;
                self.created_key_id = Some(key_pair.id.clone());
                state.temporary_key_id = Some(key_pair.id.clone());
                state.key_ids = vec![key_pair.id];

                if state.settings.debug {
                    let path = state.settings.debug_key_path();
                    info!(key_name = %name, path = %path, "saving private key for debugging");
                    fs_util::write_private(&path, &key_pair.private_key).map_err(|message| {
                        BuildError::DebugKey {
                            path: path.clone(),
                            message,
                        }
                    })?;
                    self.debug_key_path = Some(path);
                }
                state.credential = Some(Credential::PrivateKey {
                    username,
                    private_key: key_pair.private_key,
                });
            }
        }
        Ok(())
    }

    async fn release(&mut self, state: &mut BuildState) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(key_id) = self.created_key_id.take() {
            info!(key_id = %key_id, "removing temporary key pair");
            let client = Arc::clone(&state.client);
            let ids = [key_id.clone()];
            let deleted = retry_transient(state.timing.api_retry, None, "delete key pair", || {
                client.delete_key_pairs(&ids)
            })
            .await;
            match deleted {
                Ok(()) => state.temporary_key_id = None,
                Err(err) => {
                    problems.push(format!("could not delete temporary key pair {key_id}: {err}"));
                }
            }
        }
        if let Some(path) = self.debug_key_path.take()
            && let Err(err) = fs_util::remove_file(&path)
        {
            warn!(path = %path, error = %err, "could not remove debug key");
            problems.push(format!("could not remove private key {path}: {err}"));
        }
        problems
    }
}

impl Step<BuildState, BuildError> for KeyMaterial {
    fn name(&self) -> &'static str {
        "key_pair"
    }

    fn run<'a>(&'a mut self, state: &'a mut BuildState) -> StepFuture<'a, BuildError> {
        Box::pin(async move { into_action(self.execute(state).await) })
    }

    fn cleanup<'a>(&'a mut self, state: &'a mut BuildState, _unwind: Unwind) -> CleanupFuture<'a> {
        Box::pin(self.release(state))
    }
}
