//! Configuration loading via `ortho-config`.
//!
//! [`BuildConfig`] mirrors the layered sources one to one: flat scalar fields,
//! with lists and maps written as comma-separated strings. Nothing is
//! checked while loading. [`BuildConfig::settings`] validates the whole
//! configuration in one pass, reports every problem together and produces the
//! typed [`BuildSettings`] the pipeline consumes.

use std::collections::BTreeMap;
use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::client::DEFAULT_ENDPOINT;
use crate::communicator::DEFAULT_SSH_BIN;
use crate::fs_util;
use crate::image_filter::{DEFAULT_TAG_DELIMITER, ImageFilter, SourceImage};

mod subnet;

pub use subnet::{FirstSubnet, RandomSubnet, SubnetSelector};

/// Longest accepted image name.
pub const MAX_IMAGE_NAME_LEN: usize = 20;
/// Longest accepted image description.
pub const MAX_IMAGE_DESCRIPTION_LEN: usize = 60;
/// Length of generated resource names.
pub const GENERATED_NAME_LEN: usize = 24;
/// Separator between provisioning commands.
pub const COMMAND_SEPARATOR: &str = ";;";

/// Raw build configuration merged from defaults, configuration files and
/// `KILN_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KILN",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct BuildConfig {
    /// API key identifier. Required.
    pub key_id: Option<String>,
    /// API secret. Required.
    pub key: Option<String>,
    /// Home region the instance and the first image live in. Required.
    pub region: Option<String>,
    /// Project that owns the temporary resources.
    #[ortho_config(default = 0)]
    pub project: i64,
    /// Control-plane endpoint.
    #[ortho_config(default = DEFAULT_ENDPOINT.to_owned())]
    pub endpoint: String,

    /// Name of the image to create. Required.
    pub image_name: Option<String>,
    /// Replace characters other than ASCII alphanumerics and `-` in the image
    /// name instead of rejecting them.
    #[ortho_config(default = false)]
    pub clean_image_name: bool,
    /// Free-form image description.
    pub image_description: Option<String>,
    /// Comma-separated regions to copy the image to.
    pub image_regions: Option<String>,
    /// Delete existing private images with the same name first.
    #[ortho_config(default = false)]
    pub force_deregister: bool,

    /// Source image identifier; mutually exclusive with the filters below.
    pub source_image_id: Option<String>,
    /// Comma-separated `name=value` attribute filters.
    pub source_image_filters: Option<String>,
    /// Comma-separated `key=value` tags matched against image descriptions.
    pub source_image_tag_filters: Option<String>,
    /// Delimiter between tags inside image descriptions.
    #[ortho_config(default = DEFAULT_TAG_DELIMITER.to_owned())]
    pub source_image_tag_delimiter: String,
    /// Pick the newest match instead of failing on ambiguity.
    #[ortho_config(default = false)]
    pub source_image_most_recent: bool,

    /// Availability zone of the build instance.
    pub availability_zone: Option<String>,
    /// Instance type of the build instance. Required.
    pub instance_type: Option<String>,
    /// Billing mode of the build instance.
    pub instance_charge_type: Option<String>,
    /// System disk type.
    pub system_disk_type: Option<String>,
    /// System disk size in gigabytes; zero keeps the provider default.
    #[ortho_config(default = 0)]
    pub system_disk_size: u32,
    /// Virtual private cloud of the instance.
    pub vpc_id: Option<String>,
    /// Comma-separated candidate subnets; one is picked per build. Required.
    pub subnet_id: Option<String>,
    /// Billing mode of outbound traffic.
    pub internet_charge_type: Option<String>,
    /// Outbound bandwidth cap in Mbps; zero keeps the provider default.
    #[ortho_config(default = 0)]
    pub internet_max_bandwidth_out: u32,
    /// Assign a public address to the instance.
    #[ortho_config(default = false)]
    pub public_ip_assigned: bool,
    /// Comma-separated security groups.
    pub security_group_ids: Option<String>,
    /// Inline user data.
    pub user_data: Option<String>,
    /// Path to a user data file, read at launch.
    pub user_data_file: Option<String>,
    /// Ask the operator to stop the instance instead of stopping it.
    #[ortho_config(default = false)]
    pub disable_stop_instance: bool,
    /// Do not stop the instance before creating the image.
    #[ortho_config(default = false)]
    pub skip_stop_instance: bool,

    /// `ssh` or `none`.
    #[ortho_config(default = "ssh".to_owned())]
    pub communicator: String,
    /// Remote login.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_username: String,
    /// Remote password.
    pub ssh_password: Option<String>,
    /// Private key used to log in. Supports `~/` expansion.
    pub ssh_private_key_file: Option<String>,
    /// Existing key pair installed on the instance; needs
    /// `ssh_private_key_file`.
    pub ssh_keypair_name: Option<String>,
    /// Name of the temporary key pair; generated when no other credential
    /// is configured.
    #[ortho_config(cli_short = 'g')]
    pub temporary_key_pair_name: Option<String>,
    /// `public_ip` or `private_ip`.
    #[ortho_config(default = "public_ip".to_owned(), cli_short = 'j')]
    pub ssh_interface: String,
    /// SSH port.
    #[ortho_config(default = 22, cli_short = 'q')]
    pub ssh_port: u16,
    /// Path to the `ssh` executable.
    #[ortho_config(default = DEFAULT_SSH_BIN.to_owned())]
    pub ssh_bin: String,
    /// `;;`-separated shell commands run on the instance.
    #[ortho_config(cli_short = 'x')]
    pub provision_commands: Option<String>,

    /// Keep the temporary private key in `kiln_<image>.pem` during the build.
    #[ortho_config(default = false)]
    pub debug: bool,
    /// Build name exported to provisioning commands.
    #[ortho_config(default = "kiln".to_owned())]
    pub build_name: String,
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Every validation problem found.
    #[error("invalid configuration:{}", render_problems(.0))]
    Invalid(Vec<String>),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

fn render_problems(problems: &[String]) -> String {
    problems.iter().map(|problem| format!("\n  * {problem}")).collect()
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Credentials and scope of the control-plane client.
#[derive(Clone, Eq, PartialEq)]
pub struct AuthSettings {
    /// API key identifier.
    pub key_id: String,
    /// API secret.
    pub key: String,
    /// Home region.
    pub region: String,
    /// Owning project.
    pub project: i64,
    /// Control-plane endpoint.
    pub endpoint: String,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("key_id", &self.key_id)
            .field("region", &self.region)
            .field("project", &self.project)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// The image to produce.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageSettings {
    /// Image name, already cleaned.
    pub name: String,
    /// Image description.
    pub description: String,
    /// Requested copy regions, as configured.
    pub regions: Vec<String>,
    /// Delete conflicting images before creating the new one.
    pub force_deregister: bool,
}

/// Where user data comes from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum UserData {
    /// No user data.
    #[default]
    None,
    /// Inline payload.
    Inline(String),
    /// File read at launch time.
    File(String),
}

/// How the instance is brought to a stop before imaging.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopMode {
    /// Stop through the API.
    Automatic,
    /// Wait for the operator to stop it.
    Manual,
    /// Do not stop at all.
    Skip,
}

/// Launch parameters of the build instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunSettings {
    /// Availability zone.
    pub availability_zone: String,
    /// Instance type.
    pub instance_type: String,
    /// Billing mode.
    pub instance_charge_type: Option<String>,
    /// System disk type.
    pub system_disk_type: Option<String>,
    /// System disk size in gigabytes.
    pub system_disk_size: u32,
    /// Virtual private cloud.
    pub vpc_id: Option<String>,
    /// Chosen subnet.
    pub subnet_id: String,
    /// Billing mode of outbound traffic.
    pub internet_charge_type: Option<String>,
    /// Outbound bandwidth cap.
    pub internet_max_bandwidth_out: u32,
    /// Assign a public address.
    pub public_ip_assigned: bool,
    /// Security groups.
    pub security_group_ids: Vec<String>,
    /// User data source.
    pub user_data: UserData,
    /// Stop behaviour.
    pub stop: StopMode,
}

/// Which address the communicator connects to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SshInterface {
    /// First public address.
    PublicIp,
    /// First private address.
    PrivateIp,
}

/// Where the login key comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeySource {
    /// No key: password login or no communicator.
    None,
    /// A local private key file, optionally matching an existing key pair.
    File {
        /// Expanded path of the private key.
        path: String,
        /// Existing key pair to install on the instance.
        key_pair_id: Option<String>,
    },
    /// A key pair created for this build and deleted afterwards.
    Temporary {
        /// Name of the key pair.
        name: String,
    },
}

/// Remote access settings.
#[derive(Clone, Eq, PartialEq)]
pub struct AccessSettings {
    /// `false` when the communicator is `none`.
    pub enabled: bool,
    /// Remote login.
    pub username: String,
    /// Remote password.
    pub password: Option<String>,
    /// Key material source.
    pub key: KeySource,
    /// Address family to connect to.
    pub interface: SshInterface,
    /// SSH port.
    pub port: u16,
    /// `ssh` executable.
    pub ssh_bin: String,
}

impl std::fmt::Debug for AccessSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessSettings")
            .field("enabled", &self.enabled)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key", &self.key)
            .field("interface", &self.interface)
            .field("port", &self.port)
            .field("ssh_bin", &self.ssh_bin)
            .finish()
    }
}

/// Validated configuration of one build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildSettings {
    /// Client credentials.
    pub auth: AuthSettings,
    /// Image to produce.
    pub image: ImageSettings,
    /// Source image.
    pub source: SourceImage,
    /// Instance launch parameters.
    pub run: RunSettings,
    /// Remote access.
    pub access: AccessSettings,
    /// Commands run on the instance, in order.
    pub provision_commands: Vec<String>,
    /// Keep the temporary private key on disk during the build.
    pub debug: bool,
    /// Build name exported to provisioning commands.
    pub build_name: String,
}

impl BuildSettings {
    /// Path of the private key copy written in debug mode.
    #[must_use]
    pub fn debug_key_path(&self) -> String {
        format!("kiln_{}.pem", self.image.name)
    }
}

impl BuildConfig {
    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Validates the configuration and resolves it into [`BuildSettings`].
    ///
    /// `subnets` picks one of the configured candidate subnets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every problem found.
    pub fn settings(&self, subnets: &mut dyn SubnetSelector) -> Result<BuildSettings, ConfigError> {
        let mut problems = Problems::default();

        let auth = self.auth_settings(&mut problems);
        let image = self.image_settings(&mut problems);
        let source = self.source_image(&mut problems);
        let run = self.run_settings(subnets, &mut problems);
        let access = self.access_settings(&mut problems);
        let provision_commands = split_commands(self.provision_commands.as_deref());
        if !access.enabled && !provision_commands.is_empty() {
            problems.push("provision_commands require the ssh communicator");
        }

        if !problems.0.is_empty() {
            return Err(ConfigError::Invalid(problems.0));
        }
        let settings = BuildSettings {
            auth,
            image,
            source,
            run,
            access,
            provision_commands,
            debug: self.debug,
            build_name: self.build_name.clone(),
        };
        debug!(?settings, "resolved build settings");
        Ok(settings)
    }

    /// Validates only the credentials, region and endpoint.
    ///
    /// Enough for operations on existing images, such as destroying an
    /// artifact.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every problem found.
    pub fn auth(&self) -> Result<AuthSettings, ConfigError> {
        let mut problems = Problems::default();
        let auth = self.auth_settings(&mut problems);
        if problems.0.is_empty() {
            Ok(auth)
        } else {
            Err(ConfigError::Invalid(problems.0))
        }
    }

    fn auth_settings(&self, problems: &mut Problems) -> AuthSettings {
        let key_id = present(self.key_id.as_deref());
        let key = present(self.key.as_deref());
        if key_id.is_none() || key.is_none() {
            problems.push("key_id and key must both be set (KILN_KEY_ID, KILN_KEY)");
        }
        let region = problems.require(self.region.as_deref(), "region");
        if self.endpoint.trim().is_empty() {
            problems.push("endpoint must not be empty");
        }
        AuthSettings {
            key_id: key_id.unwrap_or_default(),
            key: key.unwrap_or_default(),
            region,
            project: self.project,
            endpoint: self.endpoint.clone(),
        }
    }

    fn image_settings(&self, problems: &mut Problems) -> ImageSettings {
        let raw_name = problems.require(self.image_name.as_deref(), "image_name");
        if raw_name.chars().count() > MAX_IMAGE_NAME_LEN {
            problems.push(format!(
                "image_name must be at most {MAX_IMAGE_NAME_LEN} characters"
            ));
        }
        let cleaned = clean_image_name(&raw_name);
        if cleaned != raw_name && !self.clean_image_name {
            problems.push("image_name can only contain alphanumerics and dashes");
        }
        let description = self.image_description.clone().unwrap_or_default();
        if description.chars().count() > MAX_IMAGE_DESCRIPTION_LEN {
            problems.push(format!(
                "image_description must be at most {MAX_IMAGE_DESCRIPTION_LEN} characters"
            ));
        }
        ImageSettings {
            name: cleaned,
            description,
            regions: split_list(self.image_regions.as_deref()),
            force_deregister: self.force_deregister,
        }
    }

    fn source_image(&self, problems: &mut Problems) -> SourceImage {
        let filter = ImageFilter {
            filters: parse_pairs(
                "source_image_filters",
                self.source_image_filters.as_deref(),
                problems,
            ),
            tag_filters: parse_pairs(
                "source_image_tag_filters",
                self.source_image_tag_filters.as_deref(),
                problems,
            ),
            tag_delimiter: self.source_image_tag_delimiter.clone(),
            most_recent: self.source_image_most_recent,
        };
        if !filter.tag_filters.is_empty() && filter.tag_delimiter.is_empty() {
            problems.push("source_image_tag_delimiter must not be empty");
        }
        match (present(self.source_image_id.as_deref()), filter.is_empty()) {
            (Some(image_id), true) => SourceImage::Id(image_id),
            (None, false) => SourceImage::Filter(filter),
            (Some(image_id), false) => {
                problems.push("source_image_id and source image filters cannot both be set");
                SourceImage::Id(image_id)
            }
            (None, true) => {
                problems.push("either source_image_id or source image filters must be set");
                SourceImage::Filter(filter)
            }
        }
    }

    fn run_settings(&self, subnets: &mut dyn SubnetSelector, problems: &mut Problems) -> RunSettings {
        let instance_type = problems.require(self.instance_type.as_deref(), "instance_type");
        let candidates = split_list(self.subnet_id.as_deref());
        let subnet_id = if candidates.is_empty() {
            problems.push(missing("subnet_id"));
            String::new()
        } else {
            let index = subnets.select(&candidates);
            candidates
                .get(index)
                .or_else(|| candidates.first())
                .cloned()
                .unwrap_or_default()
        };
        RunSettings {
            availability_zone: self.availability_zone.clone().unwrap_or_default(),
            instance_type,
            instance_charge_type: present(self.instance_charge_type.as_deref()),
            system_disk_type: present(self.system_disk_type.as_deref()),
            system_disk_size: self.system_disk_size,
            vpc_id: present(self.vpc_id.as_deref()),
            subnet_id,
            internet_charge_type: present(self.internet_charge_type.as_deref()),
            internet_max_bandwidth_out: self.internet_max_bandwidth_out,
            public_ip_assigned: self.public_ip_assigned,
            security_group_ids: split_list(self.security_group_ids.as_deref()),
            user_data: self.user_data_source(problems),
            stop: if self.skip_stop_instance {
                StopMode::Skip
            } else if self.disable_stop_instance {
                StopMode::Manual
            } else {
                StopMode::Automatic
            },
        }
    }

    fn user_data_source(&self, problems: &mut Problems) -> UserData {
        match (self.user_data.as_deref(), self.user_data_file.as_deref()) {
            (Some(_), Some(_)) => {
                problems.push("user_data and user_data_file cannot both be specified");
                UserData::None
            }
            (Some(inline), None) => UserData::Inline(inline.to_owned()),
            (None, Some(path)) => {
                let expanded = fs_util::expand_tilde(path.trim());
                if !fs_util::is_file(&expanded) {
                    problems.push(format!("user_data_file not found: {path}"));
                }
                UserData::File(expanded)
            }
            (None, None) => UserData::None,
        }
    }

    fn access_settings(&self, problems: &mut Problems) -> AccessSettings {
        let enabled = match self.communicator.trim() {
            "ssh" => true,
            "none" => false,
            other => {
                problems.push(format!("communicator must be `ssh` or `none`, got `{other}`"));
                true
            }
        };
        let interface = match self.ssh_interface.trim() {
            "public_ip" => SshInterface::PublicIp,
            "private_ip" => SshInterface::PrivateIp,
            other => {
                problems.push(format!(
                    "ssh_interface must be `public_ip` or `private_ip`, got `{other}`"
                ));
                SshInterface::PublicIp
            }
        };
        if enabled && self.ssh_username.trim().is_empty() {
            problems.push("ssh_username must not be empty");
        }
        if enabled && self.ssh_port == 0 {
            problems.push("ssh_port must not be zero");
        }
        let password = present(self.ssh_password.as_deref());
        let key = if enabled {
            self.key_source(password.is_some(), problems)
        } else {
            KeySource::None
        };
        AccessSettings {
            enabled,
            username: self.ssh_username.clone(),
            password,
            key,
            interface,
            port: self.ssh_port,
            ssh_bin: self.ssh_bin.clone(),
        }
    }

    fn key_source(&self, has_password: bool, problems: &mut Problems) -> KeySource {
        let key_file = present(self.ssh_private_key_file.as_deref());
        let key_pair = present(self.ssh_keypair_name.as_deref());
        if let Some(path) = key_file {
            let expanded = fs_util::expand_tilde(&path);
            if !fs_util::is_file(&expanded) {
                problems.push(format!("ssh_private_key_file not found: {path}"));
            }
            return KeySource::File {
                path: expanded,
                key_pair_id: key_pair,
            };
        }
        if key_pair.is_some() {
            problems.push("ssh_keypair_name requires ssh_private_key_file");
            return KeySource::None;
        }
        if let Some(name) = present(self.temporary_key_pair_name.as_deref()) {
            return KeySource::Temporary { name };
        }
        if has_password {
            problems.push(
                "ssh_password is not supported by the ssh communicator; set ssh_private_key_file or temporary_key_pair_name",
            );
            KeySource::None
        } else {
            KeySource::Temporary {
                name: generated_name(),
            }
        }
    }
}

#[derive(Default)]
struct Problems(Vec<String>);

impl Problems {
    fn push(&mut self, problem: impl Into<String>) {
        self.0.push(problem.into());
    }

    fn require(&mut self, value: Option<&str>, field: &str) -> String {
        present(value).unwrap_or_else(|| {
            self.push(missing(field));
            String::new()
        })
    }
}

fn missing(field: &str) -> String {
    format!(
        "missing {field}: set KILN_{} or add {field} to kiln.toml",
        field.to_uppercase()
    )
}

fn present(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_owned)
}

/// Replaces every character other than ASCII alphanumerics and `-` with `-`.
#[must_use]
pub fn clean_image_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '-' })
        .collect()
}

/// Generates a unique resource name of the form `kiln_<hex>`, truncated to
/// [`GENERATED_NAME_LEN`] characters.
#[must_use]
pub fn generated_name() -> String {
    format!("kiln_{}", Uuid::new_v4().simple())
        .chars()
        .take(GENERATED_NAME_LEN)
        .collect()
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn split_commands(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(COMMAND_SEPARATOR)
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_pairs(field: &str, value: Option<&str>, problems: &mut Problems) -> BTreeMap<String, String> {
    let mut pairs = BTreeMap::new();
    for item in split_list(value) {
        match item.split_once('=') {
            Some((key, val)) if !key.trim().is_empty() => {
                pairs.insert(key.trim().to_owned(), val.trim().to_owned());
            }
            _ => problems.push(format!("{field} entries must look like key=value, got `{item}`")),
        }
    }
    pairs
}

#[cfg(test)]
mod tests;
