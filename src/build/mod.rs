//! The image build: a fixed pipeline from source image to replicated artifact.
//!
//! [`Builder::run`] assembles the steps, drives them through the
//! [`Pipeline`] runner and turns the outcome into either an [`Artifact`] or a
//! [`BuildFailure`]. Cleanup warnings are returned either way.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::cancel::CancelLatch;
use crate::client::{ClientError, CloudClient};
use crate::communicator::{Communicator, CommunicatorError};
use crate::config::BuildSettings;
use crate::image_filter::ImageFilterError;
use crate::pipeline::{CleanupWarning, Pipeline, PipelineStatus, StepRecord};
use crate::poll::PollError;
use crate::replication::ReplicationError;
use crate::retry::RetryError;

mod state;
mod steps;

pub use state::{BuildState, Timing};

/// Errors that halt a build.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The source image could not be resolved.
    #[error("no matching image: {0}")]
    SourceImage(#[source] ImageFilterError),
    /// The configured private key could not be read.
    #[error("could not load private key {path} for SSH: {message}")]
    KeyFile {
        /// Key path.
        path: String,
        /// I/O error message.
        message: String,
    },
    /// The temporary key pair could not be created.
    #[error("could not create temporary key pair: {0}")]
    CreateKeyPair(#[source] ClientError),
    /// The debug copy of the private key could not be written.
    #[error("could not save private key to {path}: {message}")]
    DebugKey {
        /// Target path.
        path: String,
        /// I/O error message.
        message: String,
    },
    /// The user data file could not be read.
    #[error("could not read user data file {path}: {message}")]
    UserData {
        /// File path.
        path: String,
        /// I/O error message.
        message: String,
    },
    /// The launch request was rejected.
    #[error("error launching source instance: {0}")]
    Launch(#[source] ClientError),
    /// The launch request returned no instance identifiers.
    #[error("unknown error launching source instance: no instance identifier returned")]
    NoInstance,
    /// The instance never became ready.
    #[error("error waiting for instance {instance_id} to become ready: {source}")]
    InstanceWait {
        /// Instance identifier.
        instance_id: String,
        /// Poll failure.
        source: PollError,
    },
    /// Describing the instance failed.
    #[error("could not query instance {instance_id}: {source}")]
    Describe {
        /// Instance identifier.
        instance_id: String,
        /// Provider error.
        source: ClientError,
    },
    /// The instance disappeared.
    #[error("instance not found: {instance_id}")]
    InstanceMissing {
        /// Instance identifier.
        instance_id: String,
    },
    /// No address of the configured interface was assigned.
    #[error("could not determine IP address for instance {instance_id}")]
    NoAddress {
        /// Instance identifier.
        instance_id: String,
    },
    /// Remote access failed.
    #[error("remote access failed: {0}")]
    Communicator(#[from] CommunicatorError),
    /// A provisioning command exited unsuccessfully.
    #[error("provisioning command `{command}` exited with status {}: {stderr}", render_code(*.code))]
    Provision {
        /// Command as configured.
        command: String,
        /// Exit code, if the command exited normally.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
    /// The instance could not be stopped.
    #[error("could not stop instance {instance_id}: {source}")]
    Stop {
        /// Instance identifier.
        instance_id: String,
        /// Retry failure.
        source: RetryError<ClientError>,
    },
    /// The instance never reached the stopped state.
    #[error("error waiting for instance {instance_id} to stop: {source}")]
    StopWait {
        /// Instance identifier.
        instance_id: String,
        /// Poll failure.
        source: PollError,
    },
    /// Conflicting images could not be listed or deleted.
    #[error("could not deregister existing images in region {region}: {source}")]
    Deregister {
        /// Region being cleaned.
        region: String,
        /// Provider error.
        source: ClientError,
    },
    /// Image creation could not be started.
    #[error("error creating image: {0}")]
    CreateImage(#[source] RetryError<ClientError>),
    /// The new image never became usable.
    #[error("error waiting for image {image_name}: {source}")]
    ImageWait {
        /// Image name.
        image_name: String,
        /// Poll failure.
        source: PollError,
    },
    /// Replication failed in at least one region.
    #[error(transparent)]
    Replication(Box<ReplicationError>),
    /// A step ran before the data it needs was available.
    #[error("build state is missing the {0}")]
    MissingState(&'static str),
    /// The build was cancelled.
    #[error("build cancelled")]
    Cancelled,
}

fn render_code(code: Option<i32>) -> String {
    code.map_or_else(|| String::from("unknown"), |value| value.to_string())
}

impl From<ReplicationError> for BuildError {
    fn from(value: ReplicationError) -> Self {
        Self::Replication(Box::new(value))
    }
}

/// A finished build.
#[derive(Debug)]
pub struct BuildOutput {
    /// The images produced.
    pub artifact: Artifact,
    /// Status of every step.
    pub steps: Vec<StepRecord>,
    /// Problems met while tearing down temporary resources.
    pub warnings: Vec<CleanupWarning>,
}

/// A failed or cancelled build.
#[derive(Debug)]
pub struct BuildFailure {
    /// The error that stopped the build.
    pub error: BuildError,
    /// Status of every step.
    pub steps: Vec<StepRecord>,
    /// Problems met while tearing down temporary resources.
    pub warnings: Vec<CleanupWarning>,
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        for warning in &self.warnings {
            write!(f, "\n  cleanup warning ({}): {}", warning.step, warning.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Runs builds against a cloud and a communicator.
pub struct Builder {
    settings: BuildSettings,
    client: Arc<dyn CloudClient>,
    communicator: Arc<dyn Communicator>,
    timing: Timing,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("settings", &self.settings)
            .field("region", &self.client.region())
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// Creates a builder using the default timing.
    #[must_use]
    pub fn new(
        settings: BuildSettings,
        client: Arc<dyn CloudClient>,
        communicator: Arc<dyn Communicator>,
    ) -> Self {
        Self {
            settings,
            client,
            communicator,
            timing: Timing::default(),
        }
    }

    /// Overrides the waiting parameters.
    #[must_use]
    pub const fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Names of the pipeline steps, in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        steps::pipeline().step_names()
    }

    /// Runs the whole pipeline once.
    ///
    /// Cleanup always runs before this returns, so temporary resources are
    /// gone whatever the result.
    ///
    /// # Errors
    ///
    /// Returns [`BuildFailure`] carrying the first fatal error, or
    /// [`BuildError::Cancelled`] when `cancel` was set, plus every cleanup
    /// warning.
    pub async fn run(&self, cancel: &CancelLatch) -> Result<BuildOutput, BuildFailure> {
        let mut state = BuildState::new(
            Arc::clone(&self.client),
            Arc::clone(&self.communicator),
            self.settings.clone(),
            self.timing,
            cancel.clone(),
        );
        let mut pipeline: Pipeline<BuildState, BuildError> = steps::pipeline();
        info!(
            image_name = %self.settings.image.name,
            region = %self.settings.auth.region,
            "starting build"
        );
        let outcome = pipeline.run(&mut state, cancel).await;
        for warning in &outcome.warnings {
            warn!(step = warning.step, message = %warning.message, "cleanup warning");
        }

        match outcome.status {
            PipelineStatus::Completed => {
                let artifact = Artifact::new(state.images, Arc::clone(&self.client));
                info!(artifact_id = %artifact.id(), "build finished");
                Ok(BuildOutput {
                    artifact,
                    steps: outcome.steps,
                    warnings: outcome.warnings,
                })
            }
            PipelineStatus::Halted(error) => Err(BuildFailure {
                error,
                steps: outcome.steps,
                warnings: outcome.warnings,
            }),
            PipelineStatus::Cancelled(interrupted) => {
                if let Some(error) = interrupted {
                    debug!(%error, "step failed while cancelling");
                }
                Err(BuildFailure {
                    error: BuildError::Cancelled,
                    steps: outcome.steps,
                    warnings: outcome.warnings,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests;
