//! Polling helpers that wait for remote resources to settle.
//!
//! Cloud operations complete asynchronously; the only way to observe them is
//! to describe the resource repeatedly. [`wait_for_state`] drives that loop
//! for a [`StateChange`], while [`wait_for_exists`] and
//! [`wait_for_does_not_exist`] only care about presence.
//!
//! A resource that keeps reporting a pending state is never timed out: only
//! consecutive "not found" observations consume the tick budget. Callers that
//! need an upper bound rely on the cancellation latch.

use std::env;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cancel::CancelLatch;
use crate::client::{ClientError, CloudClient, Image, ImageQuery, Instance};

/// Environment variable overriding the not-found budget, in seconds.
pub const TIMEOUT_ENV: &str = "KILN_TIMEOUT_SECONDS";
/// Environment variable overriding the delay between observations, in seconds.
pub const POLL_DELAY_ENV: &str = "KILN_POLL_DELAY_SECONDS";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Timing for a single polling call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSettings {
    /// Delay between observations.
    pub interval: Duration,
    /// How long a resource may stay absent before the poll gives up.
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl PollSettings {
    /// Reads [`TIMEOUT_ENV`] and [`POLL_DELAY_ENV`], falling back to the
    /// defaults for unset, non-numeric or zero values.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`PollSettings::from_env`] with an injectable variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            interval: seconds_from(&lookup, POLL_DELAY_ENV).unwrap_or(defaults.interval),
            timeout: seconds_from(&lookup, TIMEOUT_ENV).unwrap_or(defaults.timeout),
        }
    }

    /// Number of consecutive absent observations tolerated before giving up.
    ///
    /// Equals `ceil(timeout / interval)`, never less than one.
    #[must_use]
    pub fn tick_budget(&self) -> u64 {
        let interval = self.interval.as_millis();
        if interval == 0 {
            return 1;
        }
        let ticks = self.timeout.as_millis().div_ceil(interval).max(1);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }
}

fn seconds_from(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            warn!(variable = name, value = %raw, "ignoring zero polling override");
            None
        }
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(err) => {
            warn!(variable = name, value = %raw, error = %err, "ignoring invalid polling override");
            None
        }
    }
}

/// Where a step obtains its [`PollSettings`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PollSource {
    /// Read the environment on every polling call.
    #[default]
    Env,
    /// Use fixed settings.
    Fixed(PollSettings),
}

impl PollSource {
    /// Resolves the settings for one polling call.
    #[must_use]
    pub fn settings(self) -> PollSettings {
        match self {
            Self::Env => PollSettings::from_env(),
            Self::Fixed(settings) => settings,
        }
    }
}

/// A resource and the state it was observed in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Observation<T> {
    /// The observed resource.
    pub resource: T,
    /// Its state at observation time.
    pub state: String,
}

/// Describes a transition to wait for.
#[derive(Clone, Copy, Debug)]
pub struct StateChange<'a> {
    /// States that mean "still in progress".
    pub pending: &'a [&'a str],
    /// State that ends the wait successfully.
    pub target: &'a str,
    /// Latch checked before every observation and every sleep.
    pub cancel: Option<&'a CancelLatch>,
}

impl<'a> StateChange<'a> {
    /// Creates a descriptor without a cancellation latch.
    #[must_use]
    pub const fn new(pending: &'a [&'a str], target: &'a str) -> Self {
        Self {
            pending,
            target,
            cancel: None,
        }
    }

    /// Attaches a cancellation latch.
    #[must_use]
    pub const fn cancellable(mut self, cancel: &'a CancelLatch) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Errors raised while polling.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum PollError {
    /// The resource stayed absent for longer than the tick budget.
    #[error("timed out waiting for {target} after {observations} observations")]
    Timeout {
        /// What the poll was waiting for.
        target: String,
        /// Refresh calls made.
        observations: u64,
    },
    /// The resource entered a state that is neither pending nor the target.
    #[error("unexpected state {state}, wanted {target}")]
    UnexpectedState {
        /// Observed state.
        state: String,
        /// Target state.
        target: String,
    },
    /// The resource kept existing for longer than the tick budget.
    #[error("resource still exists after {observations} observations")]
    StillExists {
        /// Refresh calls made.
        observations: u64,
    },
    /// The cancellation latch was set.
    #[error("cancelled while polling")]
    Cancelled,
    /// The refresh operation failed.
    #[error("refresh failed: {0}")]
    Refresh(#[from] ClientError),
}

fn ensure_not_cancelled(cancel: Option<&CancelLatch>) -> Result<(), PollError> {
    if cancel.is_some_and(CancelLatch::is_cancelled) {
        return Err(PollError::Cancelled);
    }
    Ok(())
}

/// Waits until the resource reaches `change.target`.
///
/// # Errors
///
/// Returns [`PollError::UnexpectedState`] as soon as a state outside the
/// pending set is observed, [`PollError::Timeout`] when the resource stays
/// absent for more than [`PollSettings::tick_budget`] observations,
/// [`PollError::Cancelled`] when the latch is set and
/// [`PollError::Refresh`] when the refresh operation fails.
pub async fn wait_for_state<T, F, Fut>(
    change: StateChange<'_>,
    settings: PollSettings,
    mut refresh: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Observation<T>>, ClientError>>,
{
    let budget = settings.tick_budget();
    let mut not_found = 0_u64;
    let mut observations = 0_u64;
    loop {
        ensure_not_cancelled(change.cancel)?;
        observations += 1;
        match refresh().await? {
            None => {
                not_found += 1;
                if not_found > budget {
                    return Err(PollError::Timeout {
                        target: change.target.to_owned(),
                        observations,
                    });
                }
            }
            Some(observation) => {
                not_found = 0;
                if observation.state == change.target {
                    return Ok(observation.resource);
                }
                if !change.pending.contains(&observation.state.as_str()) {
                    return Err(PollError::UnexpectedState {
                        state: observation.state,
                        target: change.target.to_owned(),
                    });
                }
                debug!(state = %observation.state, target = change.target, "still pending");
            }
        }
        ensure_not_cancelled(change.cancel)?;
        sleep(settings.interval).await;
    }
}

/// Waits until the resource is observed at all, in any state.
///
/// # Errors
///
/// Returns [`PollError::Timeout`] when the resource stays absent for more
/// than the tick budget, [`PollError::Cancelled`] when the latch is set and
/// [`PollError::Refresh`] when the refresh operation fails.
pub async fn wait_for_exists<T, F, Fut>(
    cancel: Option<&CancelLatch>,
    settings: PollSettings,
    mut refresh: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Observation<T>>, ClientError>>,
{
    let budget = settings.tick_budget();
    let mut observations = 0_u64;
    loop {
        ensure_not_cancelled(cancel)?;
        observations += 1;
        if let Some(observation) = refresh().await? {
            return Ok(observation.resource);
        }
        if observations > budget {
            return Err(PollError::Timeout {
                target: String::from("existence"),
                observations,
            });
        }
        ensure_not_cancelled(cancel)?;
        sleep(settings.interval).await;
    }
}

/// Waits until the resource can no longer be observed.
///
/// # Errors
///
/// Returns [`PollError::StillExists`] when the resource is seen more than
/// the tick budget allows, [`PollError::Cancelled`] when the latch is set and
/// [`PollError::Refresh`] when the refresh operation fails.
pub async fn wait_for_does_not_exist<T, F, Fut>(
    cancel: Option<&CancelLatch>,
    settings: PollSettings,
    mut refresh: F,
) -> Result<(), PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Observation<T>>, ClientError>>,
{
    let budget = settings.tick_budget();
    let mut found = 0_u64;
    loop {
        ensure_not_cancelled(cancel)?;
        if refresh().await?.is_none() {
            return Ok(());
        }
        found += 1;
        if found > budget {
            return Err(PollError::StillExists { observations: found });
        }
        ensure_not_cancelled(cancel)?;
        sleep(settings.interval).await;
    }
}

/// Describes an image by identifier. Listing failures read as "absent".
///
/// # Errors
///
/// Never fails; the signature matches the refresh contract.
pub async fn image_by_id(
    client: &dyn CloudClient,
    image_id: &str,
) -> Result<Option<Observation<Image>>, ClientError> {
    match client.describe_images(&ImageQuery::by_id(image_id)).await {
        Ok(page) => Ok(page
            .images
            .into_iter()
            .find(|image| image.id == image_id)
            .map(observe_image)),
        Err(err) => {
            debug!(image_id, error = %err, "image lookup failed; treating as absent");
            Ok(None)
        }
    }
}

/// Finds a private image by exact name. Listing failures read as "absent".
///
/// # Errors
///
/// Never fails; the signature matches the refresh contract.
pub async fn image_by_name(
    client: &dyn CloudClient,
    name: &str,
) -> Result<Option<Observation<Image>>, ClientError> {
    match client.describe_images(&ImageQuery::private_named(name)).await {
        Ok(page) => Ok(page
            .images
            .into_iter()
            .find(|image| image.name == name)
            .map(observe_image)),
        Err(err) => {
            debug!(name, error = %err, "image lookup failed; treating as absent");
            Ok(None)
        }
    }
}

/// Describes an instance. Failures read as "absent" so that transient
/// errors during boot only consume the tick budget.
///
/// # Errors
///
/// Never fails; the signature matches the refresh contract.
pub async fn instance_by_id(
    client: &dyn CloudClient,
    instance_id: &str,
) -> Result<Option<Observation<Instance>>, ClientError> {
    match describe_instance(client, instance_id).await {
        Ok(found) => Ok(found),
        Err(err) => {
            debug!(instance_id, error = %err, "instance lookup failed; treating as absent");
            Ok(None)
        }
    }
}

/// Describes an instance, propagating failures.
///
/// Used when absence must be confirmed rather than assumed.
///
/// # Errors
///
/// Returns the client error when the describe call fails.
pub async fn describe_instance(
    client: &dyn CloudClient,
    instance_id: &str,
) -> Result<Option<Observation<Instance>>, ClientError> {
    let ids = [instance_id.to_owned()];
    let instances = client.describe_instances(&ids).await?;
    Ok(instances
        .into_iter()
        .find(|instance| instance.id == instance_id)
        .map(|instance| Observation {
            state: instance.state.clone(),
            resource: instance,
        }))
}

fn observe_image(image: Image) -> Observation<Image> {
    Observation {
        state: image.state.clone(),
        resource: image,
    }
}
