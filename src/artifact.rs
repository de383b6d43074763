//! The build result: one image per region.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::client::{ClientError, CloudClient};

/// Identifier of this builder, reported with every artifact.
pub const BUILDER_ID: &str = "kiln.cloud-image";

/// Errors raised while destroying an artifact.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ArtifactError {
    /// Deleting the image in one region failed.
    #[error("failed to delete image {image_id} in region {region}: {source}")]
    Delete {
        /// Region of the image.
        region: String,
        /// Image identifier.
        image_id: String,
        /// Provider error.
        source: ClientError,
    },
    /// Deleting images failed in several regions.
    #[error("{} errors occurred:{}", .0.len(), render_all(.0))]
    Multiple(Vec<ArtifactError>),
}

fn render_all(errors: &[ArtifactError]) -> String {
    errors.iter().map(|err| format!("\n  * {err}")).collect()
}

/// Images created by a build, keyed by region.
#[derive(Clone)]
pub struct Artifact {
    images: BTreeMap<String, String>,
    builder_id: String,
    client: Arc<dyn CloudClient>,
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("images", &self.images)
            .field("builder_id", &self.builder_id)
            .finish_non_exhaustive()
    }
}

impl Artifact {
    /// Wraps the region to image map produced by a build.
    #[must_use]
    pub fn new(images: BTreeMap<String, String>, client: Arc<dyn CloudClient>) -> Self {
        Self {
            images,
            builder_id: BUILDER_ID.to_owned(),
            client,
        }
    }

    /// Rebuilds an artifact from an identifier produced by [`Artifact::id`].
    ///
    /// Pieces without a `region:image` shape are ignored.
    #[must_use]
    pub fn from_id(id: &str, client: Arc<dyn CloudClient>) -> Self {
        let images = id
            .split(',')
            .filter_map(|piece| piece.trim().split_once(':'))
            .filter(|(region, image)| !region.is_empty() && !image.is_empty())
            .map(|(region, image)| (region.to_owned(), image.to_owned()))
            .collect();
        Self::new(images, client)
    }

    /// Region to image identifier map.
    #[must_use]
    pub const fn images(&self) -> &BTreeMap<String, String> {
        &self.images
    }

    /// Identifier of the builder that produced the artifact.
    #[must_use]
    pub fn builder_id(&self) -> &str {
        &self.builder_id
    }

    /// Sorted `region:image` pairs joined by commas.
    #[must_use]
    pub fn id(&self) -> String {
        let mut parts: Vec<String> = self
            .images
            .iter()
            .map(|(region, image)| format!("{region}:{image}"))
            .collect();
        parts.sort();
        parts.join(",")
    }

    /// `region.<name>` keys mapped to image identifiers.
    #[must_use]
    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.images
            .iter()
            .map(|(region, image)| (format!("region.{region}"), image.clone()))
            .collect()
    }

    /// Deletes every image of the artifact. The map itself is left intact.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Delete`] when exactly one region fails and
    /// [`ArtifactError::Multiple`] when several do.
    pub async fn destroy(&self) -> Result<(), ArtifactError> {
        let mut errors = Vec::new();
        for (region, image_id) in &self.images {
            info!(region = %region, image_id = %image_id, "deleting image");
            let regional = self.client.for_region(region);
            let ids = [image_id.clone()];
            if let Err(source) = regional.delete_images(&ids).await {
                errors.push(ArtifactError::Delete {
                    region: region.clone(),
                    image_id: image_id.clone(),
                    source,
                });
            }
        }
        if errors.len() > 1 {
            return Err(ArtifactError::Multiple(errors));
        }
        errors.pop().map_or(Ok(()), Err)
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .images
            .iter()
            .map(|(region, image)| format!("{region}: {image}"))
            .collect();
        parts.sort();
        writeln!(f, "Images were created:\n{}", parts.join("\n"))
    }
}
