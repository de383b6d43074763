//! Control-plane client abstraction.
//!
//! The orchestration core only talks to the provider through
//! [`CloudClient`]. Every method returns a boxed future so the trait stays
//! object safe and clients can be shared as `Arc<dyn CloudClient>` between the
//! pipeline, the artifact and region-scoped copies.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

mod error;
mod http;
mod types;

pub use error::ClientError;
pub use http::{DEFAULT_ENDPOINT, HttpCloudClient, HttpCredentials};
pub use types::{
    Filter, Image, ImagePage, ImageQuery, Instance, KeyPair, LaunchRequest, PRIVATE_IMAGE,
    UNASSIGNED_IMAGE_ID, image_state, instance_state,
};

/// Future returned by client operations.
pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

/// Operations the build pipeline needs from the cloud provider.
pub trait CloudClient: Send + Sync {
    /// Region this client is scoped to.
    fn region(&self) -> &str;

    /// Returns an independent client bound to `region`.
    fn for_region(&self, region: &str) -> Arc<dyn CloudClient>;

    /// Lists images matching `query`.
    fn describe_images<'a>(&'a self, query: &'a ImageQuery) -> ClientFuture<'a, ImagePage>;

    /// Deletes the given images.
    fn delete_images<'a>(&'a self, image_ids: &'a [String]) -> ClientFuture<'a, ()>;

    /// Snapshots a stopped instance into a new image named `name`.
    fn create_image<'a>(
        &'a self,
        instance_id: &'a str,
        name: &'a str,
        description: &'a str,
    ) -> ClientFuture<'a, ()>;

    /// Starts copying images into the destination regions.
    fn sync_images<'a>(
        &'a self,
        image_ids: &'a [String],
        regions: &'a [String],
    ) -> ClientFuture<'a, ()>;

    /// Describes the given instances. Unknown identifiers are omitted.
    fn describe_instances<'a>(&'a self, instance_ids: &'a [String])
    -> ClientFuture<'a, Vec<Instance>>;

    /// Launches instances and returns their identifiers.
    fn run_instances<'a>(&'a self, request: &'a LaunchRequest) -> ClientFuture<'a, Vec<String>>;

    /// Requests a shutdown of the given instances.
    fn stop_instances<'a>(&'a self, instance_ids: &'a [String]) -> ClientFuture<'a, ()>;

    /// Deletes the given instances.
    fn terminate_instances<'a>(&'a self, instance_ids: &'a [String]) -> ClientFuture<'a, ()>;

    /// Creates a key pair and returns its private half.
    fn create_key_pair<'a>(&'a self, name: &'a str, project_id: i64)
    -> ClientFuture<'a, KeyPair>;

    /// Deletes the given key pairs.
    fn delete_key_pairs<'a>(&'a self, key_ids: &'a [String]) -> ClientFuture<'a, ()>;

    /// Unbinds key pairs from instances, optionally forcing a shutdown first.
    fn disassociate_key_pairs<'a>(
        &'a self,
        instance_ids: &'a [String],
        key_ids: &'a [String],
        force_stop: bool,
    ) -> ClientFuture<'a, ()>;
}
