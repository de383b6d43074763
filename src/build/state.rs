//! Execution state shared by the build steps.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelLatch;
use crate::client::{CloudClient, Image, Instance};
use crate::communicator::{Communicator, Credential, RemoteShell};
use crate::config::BuildSettings;
use crate::poll::PollSource;
use crate::replication::ReplicationSettings;
use crate::retry::RetryPolicy;

/// Waiting and retry parameters of a build.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timing {
    /// Poll interval and timeout source.
    pub poll: PollSource,
    /// Delay before re-describing an instance that has no address yet.
    pub address_retry_delay: Duration,
    /// Copy lookup loop.
    pub replication: ReplicationSettings,
    /// Retry policy for idempotent API calls.
    pub api_retry: RetryPolicy,
    /// Retry policy for stopping the instance.
    pub stop_retry: RetryPolicy,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll: PollSource::Env,
            address_retry_delay: Duration::from_secs(2),
            replication: ReplicationSettings::default(),
            api_retry: RetryPolicy::API,
            stop_retry: RetryPolicy::STOP,
        }
    }
}

/// Everything the steps know about one build run.
///
/// Steps only talk to each other through this struct. Fields start empty and
/// are filled in as the forward pass progresses.
pub struct BuildState {
    /// Home-region client.
    pub client: Arc<dyn CloudClient>,
    /// Opens remote shells.
    pub communicator: Arc<dyn Communicator>,
    /// Validated configuration.
    pub settings: BuildSettings,
    /// Waiting parameters.
    pub timing: Timing,
    /// Latch shared with the pipeline runner.
    pub cancel: CancelLatch,
    /// Resolved source image.
    pub source_image: Option<Image>,
    /// Login credential for the communicator.
    pub credential: Option<Credential>,
    /// Key pairs to install on the instance.
    pub key_ids: Vec<String>,
    /// Key pair created for this build.
    pub temporary_key_id: Option<String>,
    /// Whether the temporary key pair is still bound to the instance.
    pub temporary_key_attached: bool,
    /// Launched instance, as last described.
    pub instance: Option<Instance>,
    /// Address the communicator connected to.
    pub host: Option<String>,
    /// Open remote shell.
    pub shell: Option<Box<dyn RemoteShell>>,
    /// Region to image identifier, filled by image creation and replication.
    pub images: BTreeMap<String, String>,
}

impl BuildState {
    /// Creates an empty state for one run.
    #[must_use]
    pub fn new(
        client: Arc<dyn CloudClient>,
        communicator: Arc<dyn Communicator>,
        settings: BuildSettings,
        timing: Timing,
        cancel: CancelLatch,
    ) -> Self {
        Self {
            client,
            communicator,
            settings,
            timing,
            cancel,
            source_image: None,
            credential: None,
            key_ids: Vec::new(),
            temporary_key_id: None,
            temporary_key_attached: false,
            instance: None,
            host: None,
            shell: None,
            images: BTreeMap::new(),
        }
    }

    /// Identifier of the launched instance, if any.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.instance.as_ref().map(|instance| instance.id.as_str())
    }

    /// Home region name.
    #[must_use]
    pub fn home_region(&self) -> &str {
        &self.settings.auth.region
    }
}

impl fmt::Debug for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildState")
            .field("region", &self.client.region())
            .field("source_image", &self.source_image.as_ref().map(|image| &image.id))
            .field("temporary_key_id", &self.temporary_key_id)
            .field("instance", &self.instance_id())
            .field("host", &self.host)
            .field("shell_open", &self.shell.is_some())
            .field("images", &self.images)
            .finish_non_exhaustive()
    }
}
