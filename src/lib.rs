//! Core library for the kiln image builder.
//!
//! A build launches a short-lived instance from a source image, runs
//! provisioning commands over SSH, snapshots the stopped instance into a
//! named image and copies that image to further regions. Every step runs
//! inside a [`pipeline::Pipeline`] that tears down temporary resources in
//! reverse order whatever the outcome.

pub mod artifact;
pub mod build;
pub mod cancel;
pub mod client;
pub mod communicator;
pub mod config;
pub mod fs_util;
pub mod image_filter;
pub mod pipeline;
pub mod poll;
pub mod replication;
pub mod retry;
pub mod test_support;

pub use artifact::{Artifact, ArtifactError, BUILDER_ID};
pub use build::{BuildError, BuildFailure, BuildOutput, BuildState, Builder, Timing};
pub use cancel::CancelLatch;
pub use client::{ClientError, CloudClient, HttpCloudClient, HttpCredentials};
pub use communicator::{
    CommandOutput, CommandRunner, Communicator, CommunicatorError, Credential,
    ProcessCommandRunner, RemoteShell, SshCommunicator,
};
pub use config::{
    AuthSettings, BuildConfig, BuildSettings, ConfigError, FirstSubnet, RandomSubnet,
    SubnetSelector,
};
pub use image_filter::{ImageFilter, ImageFilterError, SourceImage};
pub use pipeline::{CleanupWarning, Pipeline, PipelineOutcome, Step, StepRecord, StepStatus};
pub use poll::{PollError, PollSettings, PollSource};
pub use replication::{ReplicationError, ReplicationSettings};
pub use retry::{RetryError, RetryPolicy};
