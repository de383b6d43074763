//! Command-line interface definitions for the `kiln` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `kiln` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    about = "Bake a VM image from an ephemeral instance and copy it across regions",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Launch, provision, snapshot, and replicate an image.
    #[command(
        name = "build",
        about = "Launch, provision, snapshot, and replicate an image"
    )]
    Build(BuildCommand),
    /// Delete every image of a previously built artifact.
    #[command(name = "destroy", about = "Delete the images of a built artifact")]
    Destroy(DestroyCommand),
}

/// Arguments for the `kiln build` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct BuildCommand {
    /// Delete existing private images that share the configured image name
    /// in every target region before creating the new one.
    #[arg(long)]
    pub(crate) force: bool,
    /// Keep a copy of the temporary private key in the working directory for
    /// the duration of the build.
    #[arg(long)]
    pub(crate) debug: bool,
}

/// Arguments for the `kiln destroy` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DestroyCommand {
    /// Artifact identifier as printed by `kiln build`
    /// (`region:image-id` pairs separated by commas).
    #[arg(required = true, value_name = "ARTIFACT_ID")]
    pub(crate) artifact_id: String,
}
