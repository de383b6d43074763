//! Request and response values exchanged with the control plane.

/// Image states reported by the provider.
pub mod image_state {
    /// The image is usable.
    pub const NORMAL: &str = "NORMAL";
    /// The image is being copied between regions.
    pub const SYNCING: &str = "SYNCING";
    /// The image is still being created.
    pub const PENDING: &str = "PENDING";
}

/// Instance states reported by the provider.
pub mod instance_state {
    /// The instance is booting.
    pub const PENDING: &str = "PENDING";
    /// The instance is up.
    pub const RUNNING: &str = "RUNNING";
    /// The instance is shutting down.
    pub const STOPPING: &str = "STOPPING";
    /// The instance is powered off.
    pub const STOPPED: &str = "STOPPED";
    /// The instance is being deleted.
    pub const TERMINATING: &str = "TERMINATING";
}

/// Image type filter value selecting images owned by the caller.
pub const PRIVATE_IMAGE: &str = "PRIVATE_IMAGE";

/// Image identifier the provider reports for a copy that has not been
/// assigned a real identifier yet. The misspelling is the provider's.
pub const UNASSIGNED_IMAGE_ID: &str = "unkown";

/// A machine image as described by the provider.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Image {
    /// Provider identifier.
    pub id: String,
    /// Image name, unique per account and region.
    pub name: String,
    /// Current state (see [`image_state`]).
    pub state: String,
    /// Free-text description. Tag filters are parsed from this field.
    pub description: String,
    /// RFC 3339 creation timestamp.
    pub created_time: String,
    /// Image type (for example [`PRIVATE_IMAGE`]).
    pub image_type: String,
}

/// A compute instance as described by the provider.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Instance {
    /// Provider identifier.
    pub id: String,
    /// Current state (see [`instance_state`]).
    pub state: String,
    /// Public addresses, in provider order.
    pub public_ips: Vec<String>,
    /// Private addresses, in provider order.
    pub private_ips: Vec<String>,
}

/// Key pair created by the provider. The private key is only returned once.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPair {
    /// Provider identifier.
    pub id: String,
    /// Key pair name.
    pub name: String,
    /// PEM encoded private key.
    pub private_key: String,
}

/// A single `name = any of values` listing filter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Filter {
    /// Filter name understood by the provider (for example `image-name`).
    pub name: String,
    /// Accepted values.
    pub values: Vec<String>,
}

impl Filter {
    /// Builds a filter matching a single value.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }
}

/// Parameters for an image listing call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageQuery {
    /// Restricts the listing to these identifiers when non-empty.
    pub image_ids: Vec<String>,
    /// Attribute filters, combined with AND.
    pub filters: Vec<Filter>,
    /// Page size; zero lets the provider choose.
    pub limit: u32,
    /// Number of matching images to skip.
    pub offset: u32,
}

impl ImageQuery {
    /// Lists a single image by identifier.
    #[must_use]
    pub fn by_id(image_id: impl Into<String>) -> Self {
        Self {
            image_ids: vec![image_id.into()],
            ..Self::default()
        }
    }

    /// Lists private images with the given name.
    #[must_use]
    pub fn private_named(name: impl Into<String>) -> Self {
        Self {
            filters: vec![
                Filter::new("image-type", PRIVATE_IMAGE),
                Filter::new("image-name", name),
            ],
            ..Self::default()
        }
    }

    /// Sets the page size.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

/// One page of an image listing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImagePage {
    /// Number of images matching the query across all pages.
    pub total_count: u32,
    /// Images on this page.
    pub images: Vec<Image>,
}

/// Everything needed to launch the build instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Availability zone.
    pub zone: String,
    /// Project used for billing.
    pub project_id: i64,
    /// Source image identifier.
    pub image_id: String,
    /// Billing mode.
    pub instance_charge_type: Option<String>,
    /// Instance flavour.
    pub instance_type: String,
    /// System disk type.
    pub system_disk_type: Option<String>,
    /// System disk size in GB; zero keeps the image default.
    pub system_disk_size: u32,
    /// Virtual private cloud identifier.
    pub vpc_id: Option<String>,
    /// Subnet identifier.
    pub subnet_id: String,
    /// Bandwidth billing mode.
    pub internet_charge_type: Option<String>,
    /// Outbound bandwidth cap in Mbps.
    pub internet_max_bandwidth_out: u32,
    /// Whether a public address is assigned.
    pub public_ip_assigned: bool,
    /// Instance name.
    pub instance_name: String,
    /// Key pairs to bind for login.
    pub key_ids: Vec<String>,
    /// Security groups to attach.
    pub security_group_ids: Vec<String>,
    /// First-boot user data.
    pub user_data: Option<String>,
}
