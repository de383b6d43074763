//! Communicator backed by the system `ssh` client.

use std::ffi::OsString;
use std::io::Write;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use super::{
    CommandOutput, CommandRunner, Communicator, CommunicatorError, CommunicatorFuture, Credential,
    RemoteShell,
};
use crate::cancel::CancelLatch;

/// Default `ssh` executable.
pub const DEFAULT_SSH_BIN: &str = "ssh";

const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Opens [`SshSession`]s by shelling out to `ssh` in batch mode.
#[derive(Clone, Debug)]
pub struct SshCommunicator<R> {
    runner: R,
    ssh_bin: String,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl<R> SshCommunicator<R>
where
    R: CommandRunner + Clone + 'static,
{
    /// Creates a communicator invoking `ssh_bin` through `runner`.
    #[must_use]
    pub fn new(runner: R, ssh_bin: impl Into<String>) -> Self {
        Self {
            runner,
            ssh_bin: ssh_bin.into(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides how long to wait for the port to accept connections.
    #[must_use]
    pub const fn with_ready_timeout(mut self, ready_timeout: Duration, interval: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self.poll_interval = interval;
        self
    }

    async fn wait_for_port(
        &self,
        host: &str,
        port: u16,
        cancel: &CancelLatch,
    ) -> Result<(), CommunicatorError> {
        let cancelled = || CommunicatorError::Cancelled {
            host: host.to_owned(),
            port,
        };
        let deadline = Instant::now() + self.ready_timeout;
        while Instant::now() <= deadline {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            let connect = timeout(CONNECT_ATTEMPT_TIMEOUT, TcpStream::connect((host, port))).await;
            if matches!(connect, Ok(Ok(_))) {
                return Ok(());
            }
            debug!(host, port, "port not accepting connections yet");
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            sleep(self.poll_interval).await;
        }
        Err(CommunicatorError::Unreachable {
            host: host.to_owned(),
            port,
        })
    }
}

fn stage_key(private_key: &str) -> Result<NamedTempFile, CommunicatorError> {
    let mut file =
        NamedTempFile::new().map_err(|err| CommunicatorError::KeyFile(err.to_string()))?;
    file.write_all(private_key.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|err| CommunicatorError::KeyFile(err.to_string()))?;
    Ok(file)
}

impl<R> Communicator for SshCommunicator<R>
where
    R: CommandRunner + Clone + 'static,
{
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        credential: &'a Credential,
        cancel: &'a CancelLatch,
    ) -> CommunicatorFuture<'a, Box<dyn RemoteShell>> {
        Box::pin(async move {
            let Credential::PrivateKey {
                username,
                private_key,
            } = credential
            else {
                return Err(CommunicatorError::UnsupportedCredential("password"));
            };
            info!(host, port, "waiting for ssh to become available");
            self.wait_for_port(host, port, cancel).await?;
            let key_file = stage_key(private_key)?;
            let session = SshSession {
                runner: self.runner.clone(),
                ssh_bin: self.ssh_bin.clone(),
                host: host.to_owned(),
                port,
                username: username.clone(),
                key_file,
            };
            Ok(Box::new(session) as Box<dyn RemoteShell>)
        })
    }
}

/// An `ssh` session whose key lives in a private temporary file.
///
/// The key file is removed when the session is dropped.
#[derive(Debug)]
pub struct SshSession<R> {
    runner: R,
    ssh_bin: String,
    host: String,
    port: u16,
    username: String,
    key_file: NamedTempFile,
}

impl<R: CommandRunner> SshSession<R> {
    fn build_ssh_args(&self, command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.port.to_string()),
            OsString::from("-i"),
            self.key_file.path().as_os_str().to_owned(),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
            OsString::from("-o"),
            OsString::from("IdentitiesOnly=yes"),
        ];
        args.push(OsString::from(format!("{}@{}", self.username, self.host)));
        args.push(OsString::from(command));
        args
    }
}

impl<R: CommandRunner> RemoteShell for SshSession<R> {
    fn run(&mut self, command: &str) -> Result<CommandOutput, CommunicatorError> {
        let args = self.build_ssh_args(command);
        self.runner.run(&self.ssh_bin, &args)
    }
}
