//! Binary entry point for the kiln CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kiln::{
    Artifact, ArtifactError, AuthSettings, BuildConfig, BuildFailure, Builder, CancelLatch,
    CloudClient, ConfigError, HttpCloudClient, HttpCredentials, ProcessCommandRunner,
    RandomSubnet, SshCommunicator,
};

mod cli;

use cli::{BuildCommand, Cli, DestroyCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("build failed: {0}")]
    Build(Box<BuildFailure>),
    #[error("could not destroy artifact: {0}")]
    Destroy(#[from] ArtifactError),
}

impl From<BuildFailure> for CliError {
    fn from(value: BuildFailure) -> Self {
        Self::Build(Box::new(value))
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Build(command) => build(command).await,
        Cli::Destroy(command) => destroy(command).await,
    }
}

fn cloud_client(auth: &AuthSettings) -> Arc<dyn CloudClient> {
    Arc::new(HttpCloudClient::new(
        auth.endpoint.as_str(),
        auth.region.as_str(),
        HttpCredentials {
            key_id: auth.key_id.clone(),
            key: auth.key.clone(),
        },
    ))
}

async fn build(command: BuildCommand) -> Result<(), CliError> {
    let mut config = BuildConfig::load_without_cli_args()?;
    config.force_deregister |= command.force;
    config.debug |= command.debug;
    let settings = config.settings(&mut RandomSubnet)?;

    let client = cloud_client(&settings.auth);
    let communicator = Arc::new(SshCommunicator::new(
        ProcessCommandRunner,
        settings.access.ssh_bin.as_str(),
    ));
    let cancel = CancelLatch::new();
    watch_for_interrupt(cancel.clone());

    let output = Builder::new(settings, client, communicator)
        .run(&cancel)
        .await?;
    for warning in &output.warnings {
        writeln!(
            io::stderr(),
            "cleanup warning ({}): {}",
            warning.step,
            warning.message
        )
        .ok();
    }
    let mut stdout = io::stdout();
    writeln!(stdout, "{}", output.artifact).ok();
    writeln!(stdout, "artifact id: {}", output.artifact.id()).ok();
    Ok(())
}

async fn destroy(command: DestroyCommand) -> Result<(), CliError> {
    let auth = BuildConfig::load_without_cli_args()?.auth()?;
    let artifact = Artifact::from_id(&command.artifact_id, cloud_client(&auth));
    artifact.destroy().await?;
    writeln!(io::stdout(), "destroyed {}", artifact.id()).ok();
    Ok(())
}

fn watch_for_interrupt(cancel: CancelLatch) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling build and cleaning up");
            cancel.cancel();
        }
    });
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_written_on_one_line_per_problem() {
        let err = CliError::Config(ConfigError::Invalid(vec![
            String::from("missing region"),
            String::from("missing image_name"),
        ]));
        let mut buffer = Vec::new();
        write_error(&mut buffer, &err);
        let rendered = String::from_utf8(buffer).expect("utf-8 output");
        assert_eq!(
            rendered,
            "configuration error: invalid configuration:\n  * missing region\n  * missing image_name\n"
        );
    }

    #[test]
    fn build_failures_are_boxed() {
        let failure = BuildFailure {
            error: kiln::BuildError::Cancelled,
            steps: Vec::new(),
            warnings: Vec::new(),
        };
        let err = CliError::from(failure);
        assert_eq!(err.to_string(), "build failed: build cancelled");
    }
}
