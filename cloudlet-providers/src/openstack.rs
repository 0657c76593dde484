use crate::{ComputeCluster, CreatedServer, DestinationConnector, ResourceKind};
use anyhow::Result;
use async_trait::async_trait;
use cloudlet_common::records::PROPERTY_KEY_CLOUDLET;
use cloudlet_common::{
    ComputeNode, CreateServerRequest, DestinationUrl, FlavorRecord, FlavorSpec, HandoffError,
    ImageProperties, ImageRecord, ServerRecord, TaskState, VmState,
};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Server metadata key used to hold the cloudlet task state, since the compute API
/// does not let clients write `OS-EXT-STS:task_state` directly.
pub const METADATA_KEY_TASK_STATE: &str = "cloudlet_task_state";

/// Token + service endpoints obtained from the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub compute_endpoint: String,
    pub image_endpoint: Option<String>,
}

fn build_client() -> Result<Client> {
    // Default reqwest client has no overall timeout; a stalled destination would hang the handoff.
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(30))
        .build()?)
}

/// Password login against a v2.0 identity endpoint.
pub async fn authenticate(
    identity_endpoint: &str,
    username: &str,
    password: &str,
    tenant_name: &str,
) -> Result<Session> {
    let client = build_client()?;
    let url = format!("{}/tokens", identity_endpoint.trim_end_matches('/'));
    let body = json!({
        "auth": {
            "tenantName": tenant_name,
            "passwordCredentials": {
                "username": username,
                "password": password,
            }
        }
    });

    tracing::info!("[OpenStack API] POST {} - authenticating user={} tenant={}", url, username, tenant_name);
    let resp = client.post(&url).json(&body).send().await?;
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(HandoffError::Authentication(format!("identity service rejected credentials ({})", status)).into());
    }
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!("OpenStack authentication failed: status={} body={}", status.as_u16(), text));
    }

    let doc: Value = resp.json().await?;
    parse_session(&doc)
}

fn parse_session(doc: &Value) -> Result<Session> {
    let malformed = |what: &str| HandoffError::Authentication(format!("malformed identity response: missing {}", what));
    let access = doc.get("access").ok_or_else(|| malformed("access"))?;
    let token = access["token"]["id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| malformed("token id"))?
        .to_string();

    let catalog = access["serviceCatalog"].as_array().cloned().unwrap_or_default();
    let public_url = |service: &str| -> Option<String> {
        catalog
            .iter()
            .find(|entry| entry["name"].as_str() == Some(service))
            .and_then(|entry| entry["endpoints"][0]["publicURL"].as_str())
            .map(|s| s.trim_end_matches('/').to_string())
    };

    let compute_endpoint = public_url("nova").ok_or_else(|| malformed("compute endpoint"))?;
    Ok(Session {
        token,
        compute_endpoint,
        image_endpoint: public_url("glance"),
    })
}

/// Authenticated client for one compute cluster (local or a handoff destination).
pub struct RemoteSessionClient {
    client: Client,
    compute_endpoint: String,
    image_endpoint: Option<String>,
    token: String,
}

impl RemoteSessionClient {
    /// Client for a destination that was reached with a pre-issued token.
    pub fn with_token(compute_endpoint: &str, token: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            compute_endpoint: compute_endpoint.trim().trim_end_matches('/').to_string(),
            image_endpoint: None,
            token: token.trim().to_string(),
        })
    }

    pub fn from_session(session: &Session) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            compute_endpoint: session.compute_endpoint.clone(),
            image_endpoint: session.image_endpoint.clone(),
            token: session.token.clone(),
        })
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        let token = reqwest::header::HeaderValue::from_str(&self.token)
            .map_err(|_| HandoffError::Authentication("auth token contains invalid characters".to_string()))?;
        headers.insert("X-Auth-Token", token);
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        Ok(headers)
    }

    fn compute_url(&self, path: &str) -> String {
        format!("{}/{}", self.compute_endpoint, path.trim_start_matches('/'))
    }

    /// Maps auth and conflict statuses onto typed errors; other failures stay generic.
    async fn check(&self, resp: Response, what: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        tracing::warn!("[OpenStack API] {} failed: status={} body={}", what, status.as_u16(), text);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(HandoffError::Authentication(format!(
                "{} rejected by {} ({})",
                what, self.compute_endpoint, status
            ))
            .into()),
            StatusCode::CONFLICT => Err(HandoffError::Conflict(format!("{} conflicted: {}", what, text)).into()),
            _ => Err(anyhow::anyhow!("OpenStack {} failed: status={} body={}", what, status.as_u16(), text)),
        }
    }

    async fn get_json(&self, url: &str, what: &str) -> Result<Option<Value>> {
        let resp = self.client.get(url).headers(self.headers()?).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = self.check(resp, what).await?;
        Ok(Some(resp.json().await?))
    }

    /// Parses a server document, folding the metadata-held task state back in.
    fn parse_server(doc: &Value) -> Option<ServerRecord> {
        let mut server = ServerRecord::from_value(doc)?;
        if server.task_state.is_none() {
            server.task_state = server
                .metadata
                .get(METADATA_KEY_TASK_STATE)
                .and_then(|s| TaskState::parse(s));
        }
        Some(server)
    }

    pub async fn verify(&self) -> Result<()> {
        self.list_resources(ResourceKind::Extensions).await.map(|_| ())
    }
}

#[async_trait]
impl ComputeCluster for RemoteSessionClient {
    fn endpoint(&self) -> String {
        self.compute_endpoint.clone()
    }

    async fn list_resources(&self, kind: ResourceKind) -> Result<Vec<Value>> {
        let path = if kind.has_detail() {
            format!("{}/detail", kind.as_str())
        } else {
            kind.as_str().to_string()
        };
        let url = self.compute_url(&path);
        tracing::debug!("[OpenStack API] GET {}", url);
        let doc = self
            .get_json(&url, &format!("list {}", kind.as_str()))
            .await?
            .ok_or_else(|| anyhow::anyhow!("OpenStack list {} returned 404 at {}", kind.as_str(), url))?;
        Ok(doc[kind.as_str()].as_array().cloned().unwrap_or_default())
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        let raw = self.list_resources(ResourceKind::Servers).await?;
        Ok(raw.iter().filter_map(Self::parse_server).collect())
    }

    async fn get_instance(&self, server_id: &str) -> Result<Option<ServerRecord>> {
        let url = self.compute_url(&format!("servers/{}", server_id));
        let doc = self.get_json(&url, "get server").await?;
        Ok(doc.as_ref().and_then(|d| Self::parse_server(&d["server"])))
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        let url = self.compute_url(&format!("images/{}", image_id));
        let doc = self.get_json(&url, "get image").await?;
        Ok(doc.as_ref().and_then(|d| ImageRecord::from_value(&d["image"])))
    }

    async fn create_instance(&self, request: &CreateServerRequest) -> Result<CreatedServer> {
        let url = self.compute_url("servers");
        tracing::info!(
            "[OpenStack API] POST {} - creating server name={} image={} flavor={}",
            url,
            request.name,
            request.image_ref,
            request.flavor_ref
        );
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request.to_body())
            .send()
            .await?;
        let resp = self.check(resp, "create server").await?;
        let reply: Value = resp.json().await?;

        let server = Self::parse_server(&reply["server"])
            .ok_or_else(|| anyhow::anyhow!("No server id in create response"))?;
        // Cloudlet-aware destinations attach these either beside or inside `server`.
        let section = |key: &str| {
            reply
                .get(key)
                .or_else(|| reply["server"].get(key))
                .filter(|v| !v.is_null())
                .cloned()
        };
        Ok(CreatedServer {
            server,
            handoff: section("handoff"),
            synthesis: section("synthesis"),
        })
    }

    async fn delete_instance(&self, server_id: &str) -> Result<bool> {
        let url = self.compute_url(&format!("servers/{}", server_id));
        tracing::info!("[OpenStack API] DELETE {}", url);
        let resp = self.client.delete(&url).headers(self.headers()?).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        self.check(resp, "delete server").await?;
        Ok(true)
    }

    async fn create_image(&self, name: &str, properties: &ImageProperties) -> Result<ImageRecord> {
        let image_endpoint = self
            .image_endpoint
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no image service endpoint known for {}", self.compute_endpoint))?;
        let url = format!("{}/v2/images", image_endpoint);

        // Image API v2 takes custom properties flattened onto the create body.
        let mut body = properties.to_metadata();
        body.insert("name".to_string(), json!(name));
        body.insert("container_format".to_string(), json!("bare"));
        body.insert("disk_format".to_string(), json!("raw"));
        body.insert("visibility".to_string(), json!("private"));

        tracing::info!(
            "[OpenStack API] POST {} - registering image name={} cloudlet={}",
            url,
            name,
            body.contains_key(PROPERTY_KEY_CLOUDLET)
        );
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&Value::Object(body))
            .send()
            .await?;
        let resp = self.check(resp, "create image").await?;
        let doc: Value = resp.json().await?;
        ImageRecord::from_value(&doc).ok_or_else(|| anyhow::anyhow!("No image id in create response"))
    }

    async fn create_flavor(&self, spec: &FlavorSpec) -> Result<FlavorRecord> {
        let url = self.compute_url("flavors");
        tracing::info!(
            "[OpenStack API] POST {} - creating flavor name={} vcpus={} ram={}",
            url,
            spec.name,
            spec.vcpus,
            spec.ram_mb
        );
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&json!({ "flavor": spec }))
            .send()
            .await?;
        let resp = self.check(resp, "create flavor").await?;
        let doc: Value = resp.json().await?;
        FlavorRecord::from_value(&doc["flavor"]).ok_or_else(|| anyhow::anyhow!("No flavor in create response"))
    }

    async fn list_compute_nodes(&self) -> Result<Vec<ComputeNode>> {
        let url = self.compute_url("os-hypervisors/detail");
        let Some(doc) = self.get_json(&url, "list hypervisors").await? else {
            return Ok(vec![]);
        };
        let nodes = doc["hypervisors"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|h| {
                        Some(ComputeNode {
                            hypervisor_hostname: h["hypervisor_hostname"].as_str()?.to_string(),
                            host_ip: h["host_ip"].as_str().map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(nodes)
    }

    async fn set_task_state(
        &self,
        server_id: &str,
        new_state: Option<TaskState>,
        expected: &[Option<TaskState>],
    ) -> Result<bool> {
        let Some(server) = self.get_instance(server_id).await? else {
            return Err(HandoffError::NotFound(format!("Instance {} not found", server_id)).into());
        };
        if !expected.is_empty() && !expected.contains(&server.task_state) {
            tracing::warn!(
                "[OpenStack API] task_state of {} is {:?}, expected one of {:?}",
                server_id,
                server.task_state,
                expected
            );
            return Ok(false);
        }

        let url = self.compute_url(&format!("servers/{}/metadata/{}", server_id, METADATA_KEY_TASK_STATE));
        let resp = match new_state {
            Some(state) => {
                self.client
                    .put(&url)
                    .headers(self.headers()?)
                    .json(&json!({ "meta": { METADATA_KEY_TASK_STATE: state.as_str() } }))
                    .send()
                    .await?
            }
            None => self.client.delete(&url).headers(self.headers()?).send().await?,
        };
        if new_state.is_none() && resp.status() == StatusCode::NOT_FOUND {
            return Ok(true);
        }
        self.check(resp, "set task state").await?;
        Ok(true)
    }

    async fn set_vm_state(&self, server_id: &str, state: VmState) -> Result<bool> {
        let url = self.compute_url(&format!("servers/{}/action", server_id));
        tracing::info!("[OpenStack API] POST {} - os-resetState state={}", url, state.as_str());
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&json!({ "os-resetState": { "state": state.as_str() } }))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        self.check(resp, "reset state").await?;
        Ok(true)
    }
}

/// Connects to destinations addressed by `http(s)://host:port/<compute path>` using a caller-supplied token.
pub struct OpenStackConnector;

#[async_trait]
impl DestinationConnector for OpenStackConnector {
    async fn connect(&self, endpoint: &DestinationUrl, token: &str) -> Result<Arc<dyn ComputeCluster>> {
        let client = RemoteSessionClient::with_token(&endpoint.base_url(), token)?;
        // A bad token must fail before anything is created remotely.
        client.verify().await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    async fn spawn_fake(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v2/tenant", addr)
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("X-Auth-Token").and_then(|v| v.to_str().ok()) == Some("good-token")
    }

    fn fake_cluster() -> Router {
        Router::new()
            .route(
                "/v2/tenant/extensions",
                get(|headers: HeaderMap| async move {
                    if authorized(&headers) {
                        (AxumStatus::OK, Json(json!({"extensions": [{"alias": "os-cloudlet"}]})))
                    } else {
                        (AxumStatus::UNAUTHORIZED, Json(json!({})))
                    }
                }),
            )
            .route(
                "/v2/tenant/flavors/detail",
                get(|| async {
                    Json(json!({"flavors": [
                        {"id": "1", "name": "m1.tiny", "vcpus": 1, "ram": 512, "disk": 1},
                        {"id": "2", "name": "m1.small", "vcpus": 1, "ram": 2048, "disk": 20,
                         "links": [{"href": "http://dest/v2/tenant/flavors/2", "rel": "self"}]}
                    ]}))
                }),
            )
            .route(
                "/v2/tenant/servers",
                post(|Json(body): Json<Value>| async move {
                    let name = body["server"]["name"].as_str().unwrap_or_default().to_string();
                    (
                        AxumStatus::ACCEPTED,
                        Json(json!({
                            "server": {"id": "srv-9", "name": name},
                            "handoff": {"server_ip": "10.0.0.5", "server_port": 40122}
                        })),
                    )
                }),
            )
            .route(
                "/v2/tenant/servers/{id}",
                get(|Path(id): Path<String>| async move {
                    if id == "srv-9" {
                        (
                            AxumStatus::OK,
                            Json(json!({"server": {
                                "id": "srv-9",
                                "status": "ACTIVE",
                                "metadata": {"cloudlet_task_state": "image_snapshot"}
                            }})),
                        )
                    } else {
                        (AxumStatus::NOT_FOUND, Json(json!({})))
                    }
                })
                .delete(|Path(id): Path<String>| async move {
                    if id == "srv-9" {
                        AxumStatus::NO_CONTENT
                    } else {
                        AxumStatus::NOT_FOUND
                    }
                }),
            )
    }

    #[test]
    fn session_from_service_catalog() {
        let doc = json!({
            "access": {
                "token": {"id": "tok-1"},
                "serviceCatalog": [
                    {"name": "glance", "endpoints": [{"publicURL": "http://ctl:9292/"}]},
                    {"name": "nova", "endpoints": [{"publicURL": "http://ctl:8774/v2/t1"}]}
                ]
            }
        });
        let session = parse_session(&doc).unwrap();
        assert_eq!(session.token, "tok-1");
        assert_eq!(session.compute_endpoint, "http://ctl:8774/v2/t1");
        assert_eq!(session.image_endpoint.as_deref(), Some("http://ctl:9292"));
    }

    #[test]
    fn malformed_identity_reply_is_authentication_error() {
        let err = parse_session(&json!({"access": {"token": {}}})).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandoffError>(),
            Some(HandoffError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn connector_rejects_bad_token() {
        let base = spawn_fake(fake_cluster()).await;
        let url = DestinationUrl::parse(&base).unwrap();

        let err = OpenStackConnector.connect(&url, "bad-token").await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<HandoffError>(),
            Some(HandoffError::Authentication(_))
        ));
        assert!(OpenStackConnector.connect(&url, "good-token").await.is_ok());
    }

    #[tokio::test]
    async fn lists_flavors_and_creates_server() {
        let base = spawn_fake(fake_cluster()).await;
        let client = RemoteSessionClient::with_token(&base, "good-token").unwrap();

        let flavors = client.list_flavors().await.unwrap();
        assert_eq!(flavors.len(), 2);
        assert_eq!(flavors[1].reference(), "http://dest/v2/tenant/flavors/2");

        let request = CreateServerRequest {
            name: "vm-handoff".into(),
            image_ref: "img-1".into(),
            flavor_ref: "2".into(),
            metadata: Default::default(),
            key_name: None,
        };
        let created = client.create_instance(&request).await.unwrap();
        assert_eq!(created.server.id, "srv-9");
        assert_eq!(created.handoff.unwrap()["server_port"], 40122);
        assert!(created.synthesis.is_none());
    }

    #[tokio::test]
    async fn missing_server_is_not_an_error() {
        let base = spawn_fake(fake_cluster()).await;
        let client = RemoteSessionClient::with_token(&base, "good-token").unwrap();

        assert!(client.get_instance("nope").await.unwrap().is_none());
        assert!(!client.delete_instance("nope").await.unwrap());
        assert!(client.delete_instance("srv-9").await.unwrap());

        let server = client.get_instance("srv-9").await.unwrap().unwrap();
        assert_eq!(server.task_state, Some(TaskState::ImageSnapshot));
        assert_eq!(server.vm_state, Some(VmState::Active));
    }
}
