//! Remote shell access to the build instance.
//!
//! The pipeline opens a [`RemoteShell`] through a [`Communicator`] once the
//! instance has an address, runs the provisioning commands over it and drops
//! it before the instance is stopped.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::cancel::CancelLatch;

mod runner;
mod ssh;

pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use ssh::{DEFAULT_SSH_BIN, SshCommunicator, SshSession};

/// Future returned by [`Communicator::connect`].
pub type CommunicatorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CommunicatorError>> + Send + 'a>>;

/// Login material for the build instance.
#[derive(Clone, Eq, PartialEq)]
pub enum Credential {
    /// Authenticate with a PEM private key.
    PrivateKey {
        /// Remote user name.
        username: String,
        /// PEM encoded key.
        private_key: String,
    },
    /// Authenticate with a password.
    Password {
        /// Remote user name.
        username: String,
        /// Login password.
        password: String,
    },
}

impl Credential {
    /// Remote user name for either variant.
    #[must_use]
    pub fn username(&self) -> &str {
        match self {
            Self::PrivateKey { username, .. } | Self::Password { username, .. } => username,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateKey { username, .. } => f
                .debug_struct("PrivateKey")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Errors raised while connecting to or running commands on the instance.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommunicatorError {
    /// A local helper process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error message.
        message: String,
    },
    /// The port never accepted TCP connections.
    #[error("timed out waiting for {host}:{port} to accept connections")]
    Unreachable {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
    /// The credential kind cannot be used by this communicator.
    #[error("{0} authentication is not supported by this communicator")]
    UnsupportedCredential(&'static str),
    /// Key material could not be staged for the session.
    #[error("failed to stage private key: {0}")]
    KeyFile(String),
    /// The cancellation latch was set while waiting for the instance.
    #[error("cancelled while waiting for {host}:{port}")]
    Cancelled {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
}

/// Opens remote shells.
pub trait Communicator: Send + Sync {
    /// Waits for `host:port` to become reachable and opens a shell on it.
    ///
    /// The wait ends early with [`CommunicatorError::Cancelled`] once
    /// `cancel` is set.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        credential: &'a Credential,
        cancel: &'a CancelLatch,
    ) -> CommunicatorFuture<'a, Box<dyn RemoteShell>>;
}

/// An open session on the build instance.
pub trait RemoteShell: Send {
    /// Runs `command` through the remote shell and reports how it exited.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError`] when the command could not be delivered.
    fn run(&mut self, command: &str) -> Result<CommandOutput, CommunicatorError>;
}
