//! Source image resolution by identifier or declarative filter.
//!
//! Filters combine provider-side attribute filters with tag filters parsed
//! from the image description (`key=value` pairs separated by a delimiter).
//! When several images match, `most_recent` selects the newest one by its
//! RFC 3339 creation time; equal timestamps keep the first image listed.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{ClientError, CloudClient, Filter, Image, ImageQuery};

/// Page size for image listings.
pub const PAGE_SIZE: u32 = 100;

/// Delimiter used between `key=value` pairs when none is configured.
pub const DEFAULT_TAG_DELIMITER: &str = ",";

/// Declarative description of the source image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageFilter {
    /// Provider attribute filters (`name -> value`).
    pub filters: BTreeMap<String, String>,
    /// Tags that must appear in the image description with equal values.
    pub tag_filters: BTreeMap<String, String>,
    /// Separator between tags in the description.
    pub tag_delimiter: String,
    /// Pick the newest image instead of failing on ambiguity.
    pub most_recent: bool,
}

impl Default for ImageFilter {
    fn default() -> Self {
        Self {
            filters: BTreeMap::new(),
            tag_filters: BTreeMap::new(),
            tag_delimiter: DEFAULT_TAG_DELIMITER.to_owned(),
            most_recent: false,
        }
    }
}

/// Errors raised while resolving the source image.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ImageFilterError {
    /// No image matched the filter.
    #[error("no image found matching supplied filters")]
    NoMatch,
    /// More than one image matched and `most_recent` was not set.
    #[error("{count} images match the filters and most_recent was not selected")]
    Ambiguous {
        /// Number of matching images.
        count: usize,
    },
    /// Several images matched but none had a readable creation time.
    #[error("none of the {count} matching images has a parseable creation time")]
    NoParseableTimestamp {
        /// Number of matching images.
        count: usize,
    },
    /// The configured source image identifier does not exist.
    #[error("source image {image_id} was not found")]
    NotFound {
        /// Requested identifier.
        image_id: String,
    },
    /// The image listing failed.
    #[error("error querying source image: {0}")]
    Client(#[from] ClientError),
}

impl ImageFilter {
    /// Returns `true` when neither attribute nor tag filters are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.tag_filters.is_empty()
    }

    /// Checks the description's tags against the tag filters.
    ///
    /// Pieces that are not exactly `key=value` are ignored. An empty
    /// description, or one without any parseable tag, never matches while
    /// tag filters are set.
    #[must_use]
    pub fn matches_description(&self, description: &str) -> bool {
        if self.tag_filters.is_empty() {
            return true;
        }
        if description.is_empty() {
            return false;
        }
        let tags: BTreeMap<&str, &str> = description
            .split(self.tag_delimiter.as_str())
            .filter(|piece| !piece.is_empty())
            .filter_map(|piece| {
                let mut parts = piece.split('=');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(key), Some(value), None) => Some((key, value)),
                    _ => None,
                }
            })
            .collect();
        if tags.is_empty() {
            return false;
        }
        self.tag_filters
            .iter()
            .all(|(key, wanted)| tags.get(key.as_str()) == Some(&wanted.as_str()))
    }

    fn provider_filters(&self) -> Vec<Filter> {
        self.filters
            .iter()
            .map(|(name, value)| Filter::new(name.as_str(), value.as_str()))
            .collect()
    }

    /// Lists every page of matching images and selects exactly one.
    ///
    /// # Errors
    ///
    /// Returns [`ImageFilterError::Client`] when a listing call fails and the
    /// errors of [`ImageFilter::select`] otherwise.
    pub async fn find_image(&self, client: &dyn CloudClient) -> Result<Image, ImageFilterError> {
        let mut query = ImageQuery {
            filters: self.provider_filters(),
            ..ImageQuery::default()
        }
        .with_limit(PAGE_SIZE);
        let mut candidates = Vec::new();
        loop {
            let page = client.describe_images(&query).await?;
            if page.total_count == 0 || page.images.is_empty() {
                break;
            }
            candidates.extend(
                page.images
                    .into_iter()
                    .filter(|image| self.matches_description(&image.description)),
            );
            query.offset = query.offset.saturating_add(PAGE_SIZE);
            if page.total_count <= query.offset {
                break;
            }
        }
        info!(count = candidates.len(), "found candidate images");
        self.select(candidates)
    }

    /// Picks one image from the filtered candidates.
    ///
    /// # Errors
    ///
    /// Returns [`ImageFilterError::NoMatch`] for no candidates,
    /// [`ImageFilterError::Ambiguous`] for several without `most_recent` and
    /// [`ImageFilterError::NoParseableTimestamp`] when no candidate's creation
    /// time can be read.
    pub fn select(&self, candidates: Vec<Image>) -> Result<Image, ImageFilterError> {
        let count = candidates.len();
        let mut iter = candidates.into_iter();
        match (iter.next(), iter.next()) {
            (None, _) => Err(ImageFilterError::NoMatch),
            (Some(only), None) => Ok(only),
            (Some(first), Some(second)) => {
                if !self.most_recent {
                    return Err(ImageFilterError::Ambiguous { count });
                }
                newest([first, second].into_iter().chain(iter))
                    .ok_or(ImageFilterError::NoParseableTimestamp { count })
            }
        }
    }
}

fn newest(images: impl Iterator<Item = Image>) -> Option<Image> {
    let mut best: Option<(DateTime<FixedOffset>, Image)> = None;
    for image in images {
        let created = match DateTime::parse_from_rfc3339(&image.created_time) {
            Ok(created) => created,
            Err(err) => {
                warn!(
                    image_id = %image.id,
                    created_time = %image.created_time,
                    error = %err,
                    "skipping image with unreadable creation time"
                );
                continue;
            }
        };
        // Strictly newer only, so the first of equal timestamps stays.
        if best.as_ref().is_none_or(|(latest, _)| created > *latest) {
            best = Some((created, image));
        }
    }
    best.map(|(_, image)| image)
}

/// How the source image is configured.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceImage {
    /// A direct image identifier.
    Id(String),
    /// A filter resolving to exactly one image.
    Filter(ImageFilter),
}

/// Resolves the configured source image to a concrete image.
///
/// # Errors
///
/// Returns [`ImageFilterError::NotFound`] when a direct identifier does not
/// exist and the errors of [`ImageFilter::find_image`] for filters.
pub async fn resolve_source_image(
    client: &dyn CloudClient,
    source: &SourceImage,
) -> Result<Image, ImageFilterError> {
    match source {
        SourceImage::Id(image_id) => {
            let page = client.describe_images(&ImageQuery::by_id(image_id)).await?;
            let image = page
                .images
                .into_iter()
                .next()
                .ok_or_else(|| ImageFilterError::NotFound {
                    image_id: image_id.clone(),
                })?;
            debug!(image_id = %image.id, "resolved source image by id");
            Ok(image)
        }
        SourceImage::Filter(filter) => {
            info!("discovering source image from filters");
            let image = filter.find_image(client).await?;
            info!(image_id = %image.id, "using discovered image");
            Ok(image)
        }
    }
}

#[cfg(test)]
mod tests;
