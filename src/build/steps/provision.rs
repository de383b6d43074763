//! Running the provisioning commands.

use std::borrow::Cow;

use shell_escape::unix::escape;
use tracing::{debug, info};

use super::super::{BuildError, BuildState};
use super::into_action;
use crate::pipeline::{Step, StepFuture};

/// Runs every configured command over the open shell; the first failure halts.
pub(crate) struct Provision;

/// Environment exported before every command.
fn environment_preamble(state: &BuildState) -> String {
    format!(
        "export KILN_BUILD_NAME={}; export KILN_IMAGE_NAME={}; ",
        escape(Cow::Borrowed(state.settings.build_name.as_str())),
        escape(Cow::Borrowed(state.settings.image.name.as_str())),
    )
}

impl Provision {
    fn execute(state: &mut BuildState) -> Result<(), BuildError> {
        if state.settings.provision_commands.is_empty() {
            return Ok(());
        }
        let preamble = environment_preamble(state);
        let commands = state.settings.provision_commands.clone();
        let shell = state
            .shell
            .as_mut()
            .ok_or(BuildError::MissingState("remote shell"))?;
        for command in commands {
            if state.cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            info!(command = %command, "running provisioning command");
            let output = shell.run(&format!("{preamble}{command}"))?;
            debug!(stdout = %output.stdout, stderr = %output.stderr, "command output");
            if !output.is_success() {
                return Err(BuildError::Provision {
                    command,
                    code: output.code,
                    stderr: output.stderr,
                });
            }
        }
        Ok(())
    }
}

impl Step<BuildState, BuildError> for Provision {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn run<'a>(&'a mut self, state: &'a mut BuildState) -> StepFuture<'a, BuildError> {
        Box::pin(std::future::ready(into_action(Self::execute(state))))
    }
}
