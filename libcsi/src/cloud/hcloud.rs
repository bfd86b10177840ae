//! Hetzner Cloud REST implementation of [`CloudVolumes`].
//!
//! Only the handful of endpoints the driver needs are modelled.  Ids on the
//! wire are integers; an id that does not parse can never exist, so it is
//! reported as `NotFound` without a round-trip.  Volume sizes cross the wire
//! in whole GB (GiB).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{
    Action, ActionResource, ActionStatus, CloudError, CloudVolume, CloudVolumes, CreateVolumeOpts,
    CreatedVolume, Server,
};
use crate::types::{GIB, NodeId, VolumeId};

/// Public API endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1";

/// Instance metadata service, reachable from every server.
pub const METADATA_ENDPOINT: &str = "http://169.254.169.254/hetzner/v1/metadata";

const PER_PAGE: u32 = 50;

// ---------------------------------------------------------------------------
// Wire schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LocationSchema {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VolumeSchema {
    id: u64,
    name: String,
    /// Size in GB.
    size: u64,
    created: DateTime<Utc>,
    location: LocationSchema,
    #[serde(default)]
    server: Option<u64>,
    #[serde(default)]
    linux_device: Option<String>,
}

impl From<VolumeSchema> for CloudVolume {
    fn from(v: VolumeSchema) -> Self {
        Self {
            id: VolumeId(v.id.to_string()),
            name: v.name,
            size_bytes: v.size * GIB,
            created_at: v.created,
            location: v.location.name,
            server: v.server.map(|s| NodeId(s.to_string())),
            linux_device: v.linux_device,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResourceSchema {
    id: u64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ActionSchema {
    id: u64,
    #[serde(default)]
    command: String,
    status: ActionStatus,
    #[serde(default)]
    resources: Vec<ResourceSchema>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

impl From<ActionSchema> for Action {
    fn from(a: ActionSchema) -> Self {
        Self {
            id: a.id,
            command: a.command,
            status: a.status,
            resources: a
                .resources
                .into_iter()
                .map(|r| ActionResource {
                    id: r.id.to_string(),
                    kind: r.kind,
                })
                .collect(),
            error: a.error.map(|e| e.code),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatacenterSchema {
    location: LocationSchema,
}

#[derive(Debug, Deserialize)]
struct ServerSchema {
    id: u64,
    #[serde(default)]
    name: String,
    datacenter: DatacenterSchema,
}

#[derive(Debug, Deserialize)]
struct VolumeResponse {
    volume: VolumeSchema,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    next_page: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct VolumeListResponse {
    volumes: Vec<VolumeSchema>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct VolumeCreateResponse {
    volume: VolumeSchema,
    #[serde(default)]
    action: Option<ActionSchema>,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    action: ActionSchema,
}

#[derive(Debug, Deserialize)]
struct ServerResponse {
    server: ServerSchema,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct VolumeCreateRequest<'a> {
    name: &'a str,
    size: u64,
    location: &'a str,
    automount: bool,
}

#[derive(Debug, Serialize)]
struct AttachRequest {
    server: u64,
    automount: bool,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Classify a failed response by its error code, falling back to the HTTP
/// status when the body carries none.
fn map_error(status: StatusCode, body: Option<ErrorBody>) -> CloudError {
    if let Some(ErrorBody { code, message }) = body {
        return match code.as_str() {
            "not_found" => CloudError::NotFound(message),
            "uniqueness_error" => CloudError::AlreadyExists(message),
            "locked" | "conflict" => CloudError::Locked(message),
            "rate_limit_exceeded" => CloudError::RateLimited(message),
            "unauthorized" | "forbidden" => CloudError::Unauthenticated(message),
            "service_error" | "server_error" | "timeout" | "unavailable" => {
                CloudError::Transient(format!("{code}: {message}"))
            }
            _ => CloudError::Unknown { code, message },
        };
    }
    match status {
        StatusCode::NOT_FOUND => CloudError::NotFound(status.to_string()),
        StatusCode::TOO_MANY_REQUESTS => CloudError::RateLimited(status.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CloudError::Unauthenticated(status.to_string())
        }
        s if s.is_server_error() => CloudError::Transient(s.to_string()),
        s => CloudError::Unknown {
            code: s.as_str().to_owned(),
            message: s.to_string(),
        },
    }
}

fn map_transport(err: reqwest::Error) -> CloudError {
    if err.is_decode() {
        CloudError::Unknown {
            code: "decode".to_owned(),
            message: err.to_string(),
        }
    } else {
        CloudError::Transient(err.to_string())
    }
}

fn numeric(id: &str, kind: &str) -> Result<u64, CloudError> {
    id.parse()
        .map_err(|_| CloudError::NotFound(format!("{kind} {id}")))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Bearer-token authenticated client for the cloud API.
///
/// Holds only a connection pool; safe to share between concurrent RPCs.
#[derive(Debug, Clone)]
pub struct HcloudClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HcloudClient {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("rkcsi/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(map_transport)?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.endpoint, path))
            .bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, CloudError> {
        let resp = req.send().await.map_err(map_transport)?;
        let status = resp.status();
        debug!(url = %resp.url(), %status, "cloud API response");
        if status.is_success() {
            return resp.json::<T>().await.map_err(map_transport);
        }
        let body = resp.json::<ErrorResponse>().await.ok().map(|r| r.error);
        let err = map_error(status, body);
        if !matches!(err, CloudError::NotFound(_)) {
            warn!(%status, error = %err, "cloud API call failed");
        }
        Err(err)
    }

    async fn send_empty(&self, req: RequestBuilder) -> Result<(), CloudError> {
        let resp = req.send().await.map_err(map_transport)?;
        let status = resp.status();
        debug!(url = %resp.url(), %status, "cloud API response");
        if status.is_success() {
            return Ok(());
        }
        let body = resp.json::<ErrorResponse>().await.ok().map(|r| r.error);
        Err(map_error(status, body))
    }
}

#[async_trait]
impl CloudVolumes for HcloudClient {
    #[instrument(skip(self), fields(name = %opts.name))]
    async fn create_volume(&self, opts: CreateVolumeOpts) -> Result<CreatedVolume, CloudError> {
        let body = VolumeCreateRequest {
            name: &opts.name,
            size: opts.size_bytes.div_ceil(GIB),
            location: &opts.location,
            automount: false,
        };
        let resp: VolumeCreateResponse =
            self.send(self.request(Method::POST, "/volumes").json(&body)).await?;
        Ok(CreatedVolume {
            volume: resp.volume.into(),
            action: resp.action.map(Into::into),
        })
    }

    async fn get_volume(&self, id: &VolumeId) -> Result<CloudVolume, CloudError> {
        let n = numeric(&id.0, "volume")?;
        let resp: VolumeResponse = self
            .send(self.request(Method::GET, &format!("/volumes/{n}")))
            .await?;
        Ok(resp.volume.into())
    }

    async fn list_volumes(&self, name: Option<&str>) -> Result<Vec<CloudVolume>, CloudError> {
        let mut volumes = Vec::new();
        let mut page = 1u32;
        loop {
            let mut query = vec![
                ("page", page.to_string()),
                ("per_page", PER_PAGE.to_string()),
            ];
            if let Some(name) = name {
                query.push(("name", name.to_owned()));
            }
            let resp: VolumeListResponse = self
                .send(self.request(Method::GET, "/volumes").query(&query))
                .await?;
            volumes.extend(resp.volumes.into_iter().map(CloudVolume::from));

            match resp
                .meta
                .and_then(|m| m.pagination)
                .and_then(|p| p.next_page)
            {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        Ok(volumes)
    }

    async fn delete_volume(&self, id: &VolumeId) -> Result<Option<Action>, CloudError> {
        let n = numeric(&id.0, "volume")?;
        // Deletion is synchronous on this API; no action is returned.
        self.send_empty(self.request(Method::DELETE, &format!("/volumes/{n}")))
            .await?;
        Ok(None)
    }

    async fn attach_volume(&self, id: &VolumeId, server: &NodeId) -> Result<Action, CloudError> {
        let n = numeric(&id.0, "volume")?;
        let body = AttachRequest {
            server: numeric(&server.0, "server")?,
            automount: false,
        };
        let resp: ActionResponse = self
            .send(
                self.request(Method::POST, &format!("/volumes/{n}/actions/attach"))
                    .json(&body),
            )
            .await?;
        Ok(resp.action.into())
    }

    async fn detach_volume(&self, id: &VolumeId) -> Result<Action, CloudError> {
        let n = numeric(&id.0, "volume")?;
        let resp: ActionResponse = self
            .send(self.request(Method::POST, &format!("/volumes/{n}/actions/detach")))
            .await?;
        Ok(resp.action.into())
    }

    async fn get_action(&self, id: u64) -> Result<Action, CloudError> {
        let resp: ActionResponse = self
            .send(self.request(Method::GET, &format!("/actions/{id}")))
            .await?;
        Ok(resp.action.into())
    }

    async fn get_server(&self, id: &NodeId) -> Result<Server, CloudError> {
        let n = numeric(&id.0, "server")?;
        let resp: ServerResponse = self
            .send(self.request(Method::GET, &format!("/servers/{n}")))
            .await?;
        Ok(Server {
            id: NodeId(resp.server.id.to_string()),
            name: resp.server.name,
            location: resp.server.datacenter.location.name,
        })
    }
}

// ---------------------------------------------------------------------------
// Instance metadata
// ---------------------------------------------------------------------------

/// Reads this server's identity from the instance metadata service.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    http: reqwest::Client,
    endpoint: String,
}

impl MetadataClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(map_transport)?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
        })
    }

    async fn get(&self, key: &str) -> Result<String, CloudError> {
        let resp = self
            .http
            .get(format!("{}/{key}", self.endpoint))
            .send()
            .await
            .map_err(map_transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(map_error(status, None));
        }
        let text = resp.text().await.map_err(map_transport)?;
        Ok(text.trim().to_owned())
    }

    /// Id of the server this process runs on.
    pub async fn instance_id(&self) -> Result<NodeId, CloudError> {
        self.get("instance-id").await.map(NodeId)
    }

    /// Location of this server, derived from its availability zone
    /// (`fsn1-dc14` → `fsn1`).
    pub async fn location(&self) -> Result<String, CloudError> {
        let zone = self.get("availability-zone").await?;
        Ok(zone
            .split_once('-')
            .map_or(zone.as_str(), |(loc, _)| loc)
            .to_owned())
    }
}
