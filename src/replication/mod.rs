//! Cross-region image replication.
//!
//! One batched copy request is issued for every target region. The provider
//! does not return the identifiers of the copies, so each region is then
//! searched by image name until a real identifier shows up, and every copy
//! found is polled until it is usable. Failures are collected per region and
//! reported together; the identifiers that were resolved travel with the
//! error so the caller can log them and clean them up.
//!
//! The identifier lookup uses its own short fixed loop rather than the
//! poller: the copy may legitimately not be listed yet, and a listing that
//! keeps reporting the placeholder identifier is not a state transition.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::cancel::CancelLatch;
use crate::client::{ClientError, CloudClient, ImageQuery, UNASSIGNED_IMAGE_ID, image_state};
use crate::poll::{self, PollError, PollSource, StateChange};

/// Timing of the per-region copy lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplicationSettings {
    /// Listings per region before the copy is declared missing.
    pub lookup_attempts: u32,
    /// Delay between listings.
    pub lookup_interval: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            lookup_attempts: 5,
            lookup_interval: Duration::from_secs(2),
        }
    }
}

/// What to replicate and where.
#[derive(Clone, Copy, Debug)]
pub struct ReplicationRequest<'a> {
    /// Identifier of the image in the home region.
    pub image_id: &'a str,
    /// Name shared by the image and its copies.
    pub image_name: &'a str,
    /// Requested regions; the home region and duplicates are skipped.
    pub regions: &'a [String],
}

/// A region that did not end up with a usable copy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegionFailure {
    /// Region name.
    pub region: String,
    /// What went wrong.
    pub message: String,
}

/// Errors raised while replicating an image.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ReplicationError {
    /// The batched copy request was rejected.
    #[error("could not copy image {image_id} to regions {}: {source}", regions.join(", "))]
    Kickoff {
        /// Image being copied.
        image_id: String,
        /// Target regions.
        regions: Vec<String>,
        /// Provider error.
        source: ClientError,
    },
    /// One or more regions failed.
    #[error("{}", PartialReport { failures, resolved })]
    Partial {
        /// Every failed region, in target order.
        failures: Vec<RegionFailure>,
        /// Copies whose identifiers were resolved, including ones that later
        /// failed to become usable.
        resolved: BTreeMap<String, String>,
    },
    /// Cancellation interrupted replication.
    #[error("replication cancelled")]
    Cancelled {
        /// Copies resolved before cancellation.
        resolved: BTreeMap<String, String>,
    },
}

impl ReplicationError {
    /// Copies that were resolved before the failure.
    #[must_use]
    pub fn resolved(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Kickoff { .. } => None,
            Self::Partial { resolved, .. } | Self::Cancelled { resolved } => Some(resolved),
        }
    }
}

struct PartialReport<'a> {
    failures: &'a [RegionFailure],
    resolved: &'a BTreeMap<String, String>,
}

impl fmt::Display for PartialReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image replication failed in {} region(s):", self.failures.len())?;
        for failure in self.failures {
            write!(f, "\n  * {}: {}", failure.region, failure.message)?;
        }
        if !self.resolved.is_empty() {
            let mut pairs = String::new();
            for (region, image_id) in self.resolved {
                if !pairs.is_empty() {
                    pairs.push_str(", ");
                }
                write!(pairs, "{region}:{image_id}")?;
            }
            write!(f, "\nresolved copies: {pairs}")?;
        }
        Ok(())
    }
}

/// Returns the regions to copy to: `regions` without `home` and without
/// duplicates, in first-seen order.
#[must_use]
pub fn target_regions(home: &str, regions: &[String]) -> Vec<String> {
    let mut targets: Vec<String> = Vec::with_capacity(regions.len());
    for region in regions {
        if region == home {
            info!(region = %region, "skipping home region");
            continue;
        }
        if targets.contains(region) {
            info!(region = %region, "skipping duplicate region");
            continue;
        }
        targets.push(region.clone());
    }
    targets
}

/// Copies the image to every target region and waits for the copies.
///
/// Returns the identifier of the copy in each target region. The home
/// region is never part of the result.
///
/// # Errors
///
/// Returns [`ReplicationError::Kickoff`] when the copy request fails,
/// [`ReplicationError::Partial`] when any region fails and
/// [`ReplicationError::Cancelled`] when the latch is set.
pub async fn replicate(
    client: &dyn CloudClient,
    request: ReplicationRequest<'_>,
    settings: ReplicationSettings,
    poll_source: PollSource,
    cancel: &CancelLatch,
) -> Result<BTreeMap<String, String>, ReplicationError> {
    let targets = target_regions(client.region(), request.regions);
    if targets.is_empty() {
        info!("no additional regions to copy image to");
        return Ok(BTreeMap::new());
    }

    info!(image_id = request.image_id, regions = ?targets, "copying image to other regions");
    let image_ids = [request.image_id.to_owned()];
    client
        .sync_images(&image_ids, &targets)
        .await
        .map_err(|source| ReplicationError::Kickoff {
            image_id: request.image_id.to_owned(),
            regions: targets.clone(),
            source,
        })?;

    let mut failures = Vec::new();
    let mut resolved = BTreeMap::new();
    for region in &targets {
        info!(region = %region, "searching for copied image");
        let regional = client.for_region(region);
        match lookup_copy(regional.as_ref(), request.image_name, settings, cancel).await {
            Ok(Some(image_id)) => {
                debug!(region = %region, image_id = %image_id, "found image copy");
                resolved.insert(region.clone(), image_id);
            }
            Ok(None) if cancel.is_cancelled() => {
                return Err(ReplicationError::Cancelled { resolved });
            }
            Ok(None) => failures.push(RegionFailure {
                region: region.clone(),
                message: String::from("could not find image copy"),
            }),
            Err(err) => failures.push(RegionFailure {
                region: region.clone(),
                message: err.to_string(),
            }),
        }
    }

    let pending = [image_state::SYNCING];
    let change = StateChange::new(&pending, image_state::NORMAL).cancellable(cancel);
    for (region, image_id) in &resolved {
        let regional = client.for_region(region);
        let outcome = poll::wait_for_state(change, poll_source.settings(), || {
            poll::image_by_id(regional.as_ref(), image_id)
        })
        .await;
        match outcome {
            Ok(_) => info!(region = %region, image_id = %image_id, "image copy ready"),
            Err(PollError::Cancelled) => {
                return Err(ReplicationError::Cancelled {
                    resolved: resolved.clone(),
                });
            }
            Err(err) => failures.push(RegionFailure {
                region: region.clone(),
                message: format!("error waiting for image copy {image_id}: {err}"),
            }),
        }
    }

    if failures.is_empty() {
        Ok(resolved)
    } else {
        failures.sort_by_key(|failure| {
            targets
                .iter()
                .position(|target| *target == failure.region)
                .unwrap_or(usize::MAX)
        });
        Err(ReplicationError::Partial { failures, resolved })
    }
}

async fn lookup_copy(
    client: &dyn CloudClient,
    image_name: &str,
    settings: ReplicationSettings,
    cancel: &CancelLatch,
) -> Result<Option<String>, ClientError> {
    let query = ImageQuery::private_named(image_name).with_limit(1);
    for attempt in 1..=settings.lookup_attempts {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let page = client.describe_images(&query).await?;
        if let Some(image) = page.images.into_iter().next()
            && image.id != UNASSIGNED_IMAGE_ID
            && image.name == image_name
        {
            return Ok(Some(image.id));
        }
        debug!(region = client.region(), attempt, "image copy not listed yet");
        if attempt < settings.lookup_attempts {
            sleep(settings.lookup_interval).await;
        }
    }
    Ok(None)
}
