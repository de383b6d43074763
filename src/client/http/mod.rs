//! `reqwest` implementation of [`CloudClient`] for the action-style JSON
//! control plane.
//!
//! Every call is a `POST` to the endpoint naming the action and region in
//! headers. Responses are wrapped in a `{"Response": {...}}` envelope that
//! carries an `Error` object when the provider rejects the action.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::types::{Image, ImagePage, ImageQuery, Instance, KeyPair, LaunchRequest};
use super::{ClientError, ClientFuture, CloudClient};

/// Control-plane endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "https://api.cloud.example.com/";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// API key used to authenticate control-plane calls.
#[derive(Clone, Eq, PartialEq)]
pub struct HttpCredentials {
    /// Access key identifier.
    pub key_id: String,
    /// Secret access key.
    pub key: String,
}

impl std::fmt::Debug for HttpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCredentials")
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Client bound to one region of the control plane.
#[derive(Clone, Debug)]
pub struct HttpCloudClient {
    endpoint: String,
    region: String,
    credentials: Arc<HttpCredentials>,
}

impl HttpCloudClient {
    /// Creates a client for `region`.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        region: impl Into<String>,
        credentials: HttpCredentials,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            region: region.into(),
            credentials: Arc::new(credentials),
        }
    }

    async fn call<P, R>(&self, action: &str, payload: &P) -> Result<R, ClientError>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        debug!(action, region = %self.region, "calling control plane");
        let response = HTTP_CLIENT
            .post(&self.endpoint)
            .header("X-Action", action)
            .header("X-Region", &self.region)
            .header("X-Auth-Key-Id", &self.credentials.key_id)
            .header("X-Auth-Token", &self.credentials.key)
            .json(payload)
            .send()
            .await
            .map_err(|err| transport(action, &err))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| transport(action, &err))?;

        match decode_envelope(action, &body) {
            Ok(value) if status.is_success() => {
                serde_json::from_value(value).map_err(|err| ClientError::Decode {
                    action: action.to_owned(),
                    message: err.to_string(),
                })
            }
            Ok(_) => Err(ClientError::Transport {
                action: action.to_owned(),
                message: format!("HTTP {status}"),
            }),
            Err(ClientError::Decode { .. }) if !status.is_success() => {
                Err(ClientError::Transport {
                    action: action.to_owned(),
                    message: format!("HTTP {status}: {}", String::from_utf8_lossy(&body)),
                })
            }
            Err(err) => Err(err),
        }
    }
}

fn transport(action: &str, err: &reqwest::Error) -> ClientError {
    ClientError::Transport {
        action: action.to_owned(),
        message: err.to_string(),
    }
}

/// Unwraps the `Response` envelope, surfacing provider errors.
pub(crate) fn decode_envelope(action: &str, body: &[u8]) -> Result<Value, ClientError> {
    let decode = |message: String| ClientError::Decode {
        action: action.to_owned(),
        message,
    };
    let mut root: Value = serde_json::from_slice(body).map_err(|err| decode(err.to_string()))?;
    let Some(response) = root.get_mut("Response").map(Value::take) else {
        return Err(decode(String::from("missing Response envelope")));
    };
    if let Some(error) = response.get("Error") {
        let code = error.get("Code").and_then(Value::as_str).unwrap_or("Unknown");
        let message = error.get("Message").and_then(Value::as_str).unwrap_or("");
        return Err(ClientError::api(action, code, message));
    }
    Ok(response)
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireFilter<'a> {
    name: &'a str,
    values: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImagesRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    filters: Vec<WireFilter<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    offset: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImagesResponse {
    #[serde(default)]
    total_count: u32,
    #[serde(default)]
    image_set: Vec<WireImage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireImage {
    image_id: String,
    #[serde(default)]
    image_name: String,
    #[serde(default)]
    image_state: String,
    #[serde(default)]
    image_description: String,
    #[serde(default)]
    created_time: String,
    #[serde(default)]
    image_type: String,
}

impl From<WireImage> for Image {
    fn from(value: WireImage) -> Self {
        Self {
            id: value.image_id,
            name: value.image_name,
            state: value.image_state,
            description: value.image_description,
            created_time: value.created_time,
            image_type: value.image_type,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ImageIds<'a> {
    image_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceIds<'a> {
    instance_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct KeyIds<'a> {
    key_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateImageRequest<'a> {
    instance_id: &'a str,
    image_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_description: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SyncImagesRequest<'a> {
    image_ids: &'a [String],
    destination_regions: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    instance_set: Vec<WireInstance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireInstance {
    instance_id: String,
    #[serde(default)]
    instance_state: String,
    #[serde(default)]
    public_ip_addresses: Option<Vec<String>>,
    #[serde(default)]
    private_ip_addresses: Option<Vec<String>>,
}

impl From<WireInstance> for Instance {
    fn from(value: WireInstance) -> Self {
        Self {
            id: value.instance_id,
            state: value.instance_state,
            public_ips: value.public_ip_addresses.unwrap_or_default(),
            private_ips: value.private_ip_addresses.unwrap_or_default(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Placement<'a> {
    zone: &'a str,
    project_id: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SystemDisk<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_size: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct VirtualPrivateCloud<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    vpc_id: Option<&'a str>,
    subnet_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct InternetAccessible<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    internet_charge_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    internet_max_bandwidth_out: Option<u32>,
    public_ip_assigned: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LoginSettings<'a> {
    key_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesRequest<'a> {
    placement: Placement<'a>,
    image_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_charge_type: Option<&'a str>,
    instance_type: &'a str,
    system_disk: SystemDisk<'a>,
    virtual_private_cloud: VirtualPrivateCloud<'a>,
    internet_accessible: InternetAccessible<'a>,
    instance_count: u32,
    instance_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    login_settings: Option<LoginSettings<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    security_group_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
}

impl<'a> From<&'a LaunchRequest> for RunInstancesRequest<'a> {
    fn from(request: &'a LaunchRequest) -> Self {
        Self {
            placement: Placement {
                zone: &request.zone,
                project_id: request.project_id,
            },
            image_id: &request.image_id,
            instance_charge_type: request.instance_charge_type.as_deref(),
            instance_type: &request.instance_type,
            system_disk: SystemDisk {
                disk_type: request.system_disk_type.as_deref(),
                disk_size: non_zero(request.system_disk_size),
            },
            virtual_private_cloud: VirtualPrivateCloud {
                vpc_id: request.vpc_id.as_deref(),
                subnet_id: &request.subnet_id,
            },
            internet_accessible: InternetAccessible {
                internet_charge_type: request.internet_charge_type.as_deref(),
                internet_max_bandwidth_out: non_zero(request.internet_max_bandwidth_out),
                public_ip_assigned: request.public_ip_assigned,
            },
            instance_count: 1,
            instance_name: &request.instance_name,
            login_settings: (!request.key_ids.is_empty()).then_some(LoginSettings {
                key_ids: &request.key_ids,
            }),
            security_group_ids: non_empty(&request.security_group_ids),
            user_data: request.user_data.as_deref(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesResponse {
    #[serde(default)]
    instance_id_set: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateKeyPairRequest<'a> {
    key_name: &'a str,
    project_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateKeyPairResponse {
    key_pair: WireKeyPair,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireKeyPair {
    key_id: String,
    key_name: String,
    #[serde(default)]
    private_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DisassociateRequest<'a> {
    instance_ids: &'a [String],
    key_ids: &'a [String],
    force_stop: bool,
}

/// Accepts and ignores any response body.
#[derive(Deserialize)]
struct Ignored {}

const fn non_zero(value: u32) -> Option<u32> {
    if value == 0 { None } else { Some(value) }
}

fn non_empty(values: &[String]) -> Option<&[String]> {
    (!values.is_empty()).then_some(values)
}

impl CloudClient for HttpCloudClient {
    fn region(&self) -> &str {
        &self.region
    }

    fn for_region(&self, region: &str) -> Arc<dyn CloudClient> {
        Arc::new(Self {
            endpoint: self.endpoint.clone(),
            region: region.to_owned(),
            credentials: Arc::clone(&self.credentials),
        })
    }

    fn describe_images<'a>(&'a self, query: &'a ImageQuery) -> ClientFuture<'a, ImagePage> {
        Box::pin(async move {
            let request = DescribeImagesRequest {
                image_ids: non_empty(&query.image_ids),
                filters: query
                    .filters
                    .iter()
                    .map(|filter| WireFilter {
                        name: &filter.name,
                        values: &filter.values,
                    })
                    .collect(),
                limit: non_zero(query.limit),
                offset: query.offset,
            };
            let response: DescribeImagesResponse = self.call("DescribeImages", &request).await?;
            Ok(ImagePage {
                total_count: response.total_count,
                images: response.image_set.into_iter().map(Image::from).collect(),
            })
        })
    }

    fn delete_images<'a>(&'a self, image_ids: &'a [String]) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let _: Ignored = self.call("DeleteImages", &ImageIds { image_ids }).await?;
            Ok(())
        })
    }

    fn create_image<'a>(
        &'a self,
        instance_id: &'a str,
        name: &'a str,
        description: &'a str,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let request = CreateImageRequest {
                instance_id,
                image_name: name,
                image_description: (!description.is_empty()).then_some(description),
            };
            let _: Ignored = self.call("CreateImage", &request).await?;
            Ok(())
        })
    }

    fn sync_images<'a>(
        &'a self,
        image_ids: &'a [String],
        regions: &'a [String],
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let request = SyncImagesRequest {
                image_ids,
                destination_regions: regions,
            };
            let _: Ignored = self.call("SyncImages", &request).await?;
            Ok(())
        })
    }

    fn describe_instances<'a>(
        &'a self,
        instance_ids: &'a [String],
    ) -> ClientFuture<'a, Vec<Instance>> {
        Box::pin(async move {
            let response: DescribeInstancesResponse = self
                .call("DescribeInstances", &InstanceIds { instance_ids })
                .await?;
            Ok(response
                .instance_set
                .into_iter()
                .map(Instance::from)
                .collect())
        })
    }

    fn run_instances<'a>(&'a self, request: &'a LaunchRequest) -> ClientFuture<'a, Vec<String>> {
        Box::pin(async move {
            let response: RunInstancesResponse = self
                .call("RunInstances", &RunInstancesRequest::from(request))
                .await?;
            Ok(response.instance_id_set)
        })
    }

    fn stop_instances<'a>(&'a self, instance_ids: &'a [String]) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let _: Ignored = self
                .call("StopInstances", &InstanceIds { instance_ids })
                .await?;
            Ok(())
        })
    }

    fn terminate_instances<'a>(&'a self, instance_ids: &'a [String]) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let _: Ignored = self
                .call("TerminateInstances", &InstanceIds { instance_ids })
                .await?;
            Ok(())
        })
    }

    fn create_key_pair<'a>(&'a self, name: &'a str, project_id: i64) -> ClientFuture<'a, KeyPair> {
        Box::pin(async move {
            let request = CreateKeyPairRequest {
                key_name: name,
                project_id,
            };
            let response: CreateKeyPairResponse = self.call("CreateKeyPair", &request).await?;
            Ok(KeyPair {
                id: response.key_pair.key_id,
                name: response.key_pair.key_name,
                private_key: response.key_pair.private_key,
            })
        })
    }

    fn delete_key_pairs<'a>(&'a self, key_ids: &'a [String]) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let _: Ignored = self.call("DeleteKeyPairs", &KeyIds { key_ids }).await?;
            Ok(())
        })
    }

    fn disassociate_key_pairs<'a>(
        &'a self,
        instance_ids: &'a [String],
        key_ids: &'a [String],
        force_stop: bool,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let request = DisassociateRequest {
                instance_ids,
                key_ids,
                force_stop,
            };
            let _: Ignored = self
                .call("DisassociateInstancesKeyPairs", &request)
                .await?;
            Ok(())
        })
    }
}
