//! Typed views of the image / flavor / server records owned by the compute cluster.
//!
//! Raw records arrive as loosely-typed JSON; they are validated once here and carry
//! explicit "tag present / absent" semantics from then on.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::error::HandoffError;
use crate::fingerprint::BaseVmFingerprint;
use crate::resource::ResourceShape;

// --- Tag keys ---

pub const PROPERTY_KEY_CLOUDLET: &str = "is_cloudlet";
pub const PROPERTY_KEY_CLOUDLET_TYPE: &str = "cloudlet_type";
pub const PROPERTY_KEY_NETWORK_INFO: &str = "network";
pub const PROPERTY_KEY_BASE_UUID: &str = "base_sha256_uuid";
pub const PROPERTY_KEY_BASE_RESOURCE: &str = "base_resource_xml_str";

pub const METADATA_KEY_HANDOFF_INFO: &str = "handoff_info";
pub const METADATA_KEY_OVERLAY_URL: &str = "overlay_url";

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloudletType {
    #[serde(rename = "cloudlet_base_disk")]
    BaseDisk,
    #[serde(rename = "cloudlet_base_memory")]
    BaseMemory,
    #[serde(rename = "cloudlet_base_disk_hash")]
    BaseDiskHash,
    #[serde(rename = "cloudlet_base_memory_hash")]
    BaseMemoryHash,
    #[serde(rename = "cloudlet_overlay")]
    Overlay,
}

impl CloudletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudletType::BaseDisk => "cloudlet_base_disk",
            CloudletType::BaseMemory => "cloudlet_base_memory",
            CloudletType::BaseDiskHash => "cloudlet_base_disk_hash",
            CloudletType::BaseMemoryHash => "cloudlet_base_memory_hash",
            CloudletType::Overlay => "cloudlet_overlay",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "cloudlet_base_disk" => Some(CloudletType::BaseDisk),
            "cloudlet_base_memory" => Some(CloudletType::BaseMemory),
            "cloudlet_base_disk_hash" => Some(CloudletType::BaseDiskHash),
            "cloudlet_base_memory_hash" => Some(CloudletType::BaseMemoryHash),
            "cloudlet_overlay" => Some(CloudletType::Overlay),
            _ => None,
        }
    }
}

/// Platform task state. `None` on a server means no operation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    ImageSnapshot,
    ImageUploading,
    Migrating,
    Deleting,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::ImageSnapshot => "image_snapshot",
            TaskState::ImageUploading => "image_uploading",
            TaskState::Migrating => "migrating",
            TaskState::Deleting => "deleting",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image_snapshot" => Some(TaskState::ImageSnapshot),
            "image_uploading" => Some(TaskState::ImageUploading),
            "migrating" => Some(TaskState::Migrating),
            "deleting" => Some(TaskState::Deleting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Building,
    Active,
    Stopped,
    Error,
    Deleted,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Building => "building",
            VmState::Active => "active",
            VmState::Stopped => "stopped",
            VmState::Error => "error",
            VmState::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "building" | "build" => Some(VmState::Building),
            "active" => Some(VmState::Active),
            "stopped" | "shutoff" => Some(VmState::Stopped),
            "error" => Some(VmState::Error),
            "deleted" => Some(VmState::Deleted),
            _ => None,
        }
    }
}

// --- Images ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: String,
    pub mac_address: String,
}

/// Ids of the three sibling artifacts a base-disk image points back to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingRefs {
    pub memory: Option<String>,
    pub disk_hash: Option<String>,
    pub memory_hash: Option<String>,
}

impl SiblingRefs {
    pub fn is_complete(&self) -> bool {
        self.memory.is_some() && self.disk_hash.is_some() && self.memory_hash.is_some()
    }
}

/// Cloudlet tags carried by an image. Everything is optional: an untagged image is
/// `ImageProperties::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageProperties {
    pub is_cloudlet: bool,
    pub cloudlet_type: Option<CloudletType>,
    pub base_fingerprint: Option<BaseVmFingerprint>,
    pub siblings: SiblingRefs,
    pub resource: Option<ResourceShape>,
    pub network: Vec<NetworkInterface>,
    /// Tags this subsystem does not interpret, preserved verbatim.
    pub extra: BTreeMap<String, String>,
}

impl ImageProperties {
    pub fn cloudlet(cloudlet_type: CloudletType) -> Self {
        Self {
            is_cloudlet: true,
            cloudlet_type: Some(cloudlet_type),
            ..Default::default()
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: BaseVmFingerprint) -> Self {
        self.base_fingerprint = Some(fingerprint);
        self
    }

    pub fn is_base_disk(&self) -> bool {
        self.cloudlet_type == Some(CloudletType::BaseDisk)
    }

    /// Build from an untyped metadata/properties map. Unknown keys go to `extra`;
    /// malformed known keys are treated as absent.
    pub fn from_metadata(map: &Map<String, Value>) -> Self {
        let mut props = ImageProperties::default();
        for (key, value) in map {
            match key.as_str() {
                PROPERTY_KEY_CLOUDLET => props.is_cloudlet = value_as_bool(value),
                PROPERTY_KEY_CLOUDLET_TYPE => {
                    props.cloudlet_type = value_as_string(value).as_deref().and_then(CloudletType::parse)
                }
                PROPERTY_KEY_BASE_UUID => {
                    props.base_fingerprint =
                        value_as_string(value).as_deref().and_then(BaseVmFingerprint::parse)
                }
                PROPERTY_KEY_BASE_RESOURCE => {
                    props.resource = value_as_string(value)
                        .and_then(|xml| ResourceShape::from_libvirt_xml(&xml).ok())
                }
                PROPERTY_KEY_NETWORK_INFO => props.network = parse_network(value),
                k if k == CloudletType::BaseMemory.as_str() => {
                    props.siblings.memory = value_as_string(value)
                }
                k if k == CloudletType::BaseDiskHash.as_str() => {
                    props.siblings.disk_hash = value_as_string(value)
                }
                k if k == CloudletType::BaseMemoryHash.as_str() => {
                    props.siblings.memory_hash = value_as_string(value)
                }
                _ => {
                    if let Some(s) = value_as_string(value) {
                        props.extra.insert(key.clone(), s);
                    }
                }
            }
        }
        props
    }

    /// Flatten back to string tags, the form image services store.
    pub fn to_metadata(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for (k, v) in &self.extra {
            map.insert(k.clone(), Value::String(v.clone()));
        }
        if self.is_cloudlet {
            map.insert(PROPERTY_KEY_CLOUDLET.to_string(), Value::String("True".to_string()));
        }
        if let Some(t) = self.cloudlet_type {
            map.insert(PROPERTY_KEY_CLOUDLET_TYPE.to_string(), Value::String(t.as_str().to_string()));
        }
        if let Some(fp) = &self.base_fingerprint {
            map.insert(PROPERTY_KEY_BASE_UUID.to_string(), Value::String(fp.to_string()));
        }
        if let Some(shape) = &self.resource {
            map.insert(
                PROPERTY_KEY_BASE_RESOURCE.to_string(),
                Value::String(shape.to_libvirt_xml()),
            );
        }
        if !self.network.is_empty() {
            let encoded = serde_json::to_string(&self.network).unwrap_or_default();
            map.insert(PROPERTY_KEY_NETWORK_INFO.to_string(), Value::String(encoded));
        }
        for (t, id) in [
            (CloudletType::BaseMemory, &self.siblings.memory),
            (CloudletType::BaseDiskHash, &self.siblings.disk_hash),
            (CloudletType::BaseMemoryHash, &self.siblings.memory_hash),
        ] {
            if let Some(id) = id {
                map.insert(t.as_str().to_string(), Value::String(id.clone()));
            }
        }
        map
    }
}

fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_network(value: &Value) -> Vec<NetworkInterface> {
    match value {
        Value::Array(_) => serde_json::from_value(value.clone()).unwrap_or_default(),
        Value::String(s) => serde_json::from_str(s).unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub name: String,
    pub min_disk_gb: u64,
    pub properties: ImageProperties,
}

impl ImageRecord {
    /// Accepts both compute-API (`metadata`) and image-API (`properties` or top-level tags) shapes.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = value_as_string(obj.get("id")?)?;
        let name = obj.get("name").and_then(value_as_string).unwrap_or_default();
        let min_disk_gb = obj
            .get("minDisk")
            .or_else(|| obj.get("min_disk"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let properties = if let Some(Value::Object(meta)) = obj.get("metadata").or_else(|| obj.get("properties")) {
            ImageProperties::from_metadata(meta)
        } else {
            // Image API v2 flattens custom properties onto the record.
            let tags: Map<String, Value> = obj
                .iter()
                .filter(|(k, _)| is_cloudlet_key(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            ImageProperties::from_metadata(&tags)
        };

        Some(Self {
            id,
            name,
            min_disk_gb,
            properties,
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "minDisk": self.min_disk_gb,
            "metadata": Value::Object(self.properties.to_metadata()),
        })
    }
}

fn is_cloudlet_key(key: &str) -> bool {
    matches!(
        key,
        PROPERTY_KEY_CLOUDLET
            | PROPERTY_KEY_CLOUDLET_TYPE
            | PROPERTY_KEY_NETWORK_INFO
            | PROPERTY_KEY_BASE_UUID
            | PROPERTY_KEY_BASE_RESOURCE
    ) || CloudletType::parse(key).is_some()
}

// --- Flavors ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default)]
    pub rel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub vcpus: u32,
    #[serde(rename = "ram")]
    pub ram_mb: u64,
    #[serde(rename = "disk", default)]
    pub disk_gb: u64,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl FlavorRecord {
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            id: value_as_string(obj.get("id")?)?,
            name: obj.get("name").and_then(value_as_string).unwrap_or_default(),
            vcpus: obj.get("vcpus").and_then(value_as_u32)?,
            ram_mb: obj.get("ram").and_then(value_as_u64)?,
            disk_gb: obj.get("disk").and_then(value_as_u64).unwrap_or(0),
            links: obj
                .get("links")
                .and_then(|l| serde_json::from_value(l.clone()).ok())
                .unwrap_or_default(),
        })
    }

    /// `links[0].href`, falling back to the bare id.
    pub fn reference(&self) -> String {
        self.links
            .first()
            .map(|l| l.href.clone())
            .unwrap_or_else(|| self.id.clone())
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Out-of-range counts are rejected rather than wrapped.
fn value_as_u32(value: &Value) -> Option<u32> {
    value_as_u64(value).and_then(|n| u32::try_from(n).ok())
}

/// Parameters for creating a flavor on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlavorSpec {
    pub name: String,
    pub vcpus: u32,
    #[serde(rename = "ram")]
    pub ram_mb: u64,
    #[serde(rename = "disk")]
    pub disk_gb: u64,
}

// --- Servers ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub vm_state: Option<VmState>,
    pub task_state: Option<TaskState>,
    pub image_id: Option<String>,
    pub flavor_id: Option<String>,
    pub shape: Option<ResourceShape>,
    /// Hypervisor the scheduler placed the server on; `None` until scheduled.
    pub host: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub links: Vec<Link>,
}

impl ServerRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            vm_state: None,
            task_state: None,
            image_id: None,
            flavor_id: None,
            shape: None,
            host: None,
            metadata: BTreeMap::new(),
            links: Vec::new(),
        }
    }

    pub fn handoff_info(&self) -> Option<&str> {
        self.metadata.get(METADATA_KEY_HANDOFF_INFO).map(String::as_str)
    }

    pub fn overlay_url(&self) -> Option<&str> {
        self.metadata.get(METADATA_KEY_OVERLAY_URL).map(String::as_str)
    }

    pub fn self_link(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.rel == "self")
            .or_else(|| self.links.first())
            .map(|l| l.href.as_str())
    }

    /// Parses a compute-API server document. Create responses are sparse, so only `id` is required.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut server = ServerRecord::new(
            value_as_string(obj.get("id")?)?,
            obj.get("name").and_then(value_as_string).unwrap_or_default(),
        );
        server.vm_state = obj
            .get("OS-EXT-STS:vm_state")
            .and_then(value_as_string)
            .and_then(|s| VmState::parse(&s))
            .or_else(|| {
                obj.get("status")
                    .and_then(value_as_string)
                    .and_then(|s| VmState::parse(&s))
            });
        server.task_state = obj
            .get("OS-EXT-STS:task_state")
            .and_then(value_as_string)
            .and_then(|s| TaskState::parse(&s));
        server.host = obj
            .get("OS-EXT-SRV-ATTR:hypervisor_hostname")
            .and_then(value_as_string);
        server.image_id = obj.get("image").and_then(|i| match i {
            Value::Object(o) => o.get("id").and_then(value_as_string),
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        });
        if let Some(Value::Object(flavor)) = obj.get("flavor") {
            server.flavor_id = flavor.get("id").and_then(value_as_string);
            let vcpus = flavor.get("vcpus").and_then(value_as_u32);
            let ram = flavor.get("ram").and_then(value_as_u64);
            if let (Some(vcpus), Some(ram)) = (vcpus, ram) {
                let mut shape = ResourceShape::new(vcpus, ram);
                shape.disk_gb = flavor.get("disk").and_then(value_as_u64);
                server.shape = Some(shape);
            }
        }
        if let Some(Value::Object(meta)) = obj.get("metadata") {
            server.metadata = meta
                .iter()
                .filter_map(|(k, v)| value_as_string(v).map(|s| (k.clone(), s)))
                .collect();
        }
        server.links = obj
            .get("links")
            .and_then(|l| serde_json::from_value(l.clone()).ok())
            .unwrap_or_default();
        Some(server)
    }

    pub fn to_value(&self) -> Value {
        let mut flavor = Map::new();
        if let Some(id) = &self.flavor_id {
            flavor.insert("id".into(), json!(id));
        }
        if let Some(shape) = &self.shape {
            flavor.insert("vcpus".into(), json!(shape.vcpus));
            flavor.insert("ram".into(), json!(shape.memory_mb));
            if let Some(disk) = shape.disk_gb {
                flavor.insert("disk".into(), json!(disk));
            }
        }
        json!({
            "id": self.id,
            "name": self.name,
            "OS-EXT-STS:vm_state": self.vm_state.map(|s| s.as_str()),
            "OS-EXT-STS:task_state": self.task_state.map(|s| s.as_str()),
            "OS-EXT-SRV-ATTR:hypervisor_hostname": self.host,
            "image": self.image_id.as_ref().map(|id| json!({ "id": id })),
            "flavor": Value::Object(flavor),
            "metadata": self.metadata,
            "links": self.links,
        })
    }
}

/// A hypervisor known to the cluster and the address it is reachable on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeNode {
    pub hypervisor_hostname: String,
    pub host_ip: Option<String>,
}

// --- Server creation ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateServerRequest {
    pub name: String,
    pub image_ref: String,
    pub flavor_ref: String,
    pub metadata: BTreeMap<String, String>,
    pub key_name: Option<String>,
}

impl CreateServerRequest {
    pub fn to_body(&self) -> Value {
        json!({
            "server": {
                "name": self.name,
                "imageRef": self.image_ref,
                "flavorRef": self.flavor_ref,
                "metadata": self.metadata,
                "min_count": "1",
                "max_count": "1",
                "key_name": self.key_name,
            }
        })
    }

    pub fn from_body(body: &Value) -> Result<Self, HandoffError> {
        let server = body
            .get("server")
            .and_then(Value::as_object)
            .ok_or_else(|| HandoffError::Validation("Need server in request body".to_string()))?;
        let field = |key: &str| -> Result<String, HandoffError> {
            server
                .get(key)
                .and_then(value_as_string)
                .ok_or_else(|| HandoffError::Validation(format!("Need server.{}", key)))
        };
        let metadata = match server.get("metadata") {
            Some(Value::Object(meta)) => meta
                .iter()
                .filter_map(|(k, v)| value_as_string(v).map(|s| (k.clone(), s)))
                .collect(),
            _ => BTreeMap::new(),
        };
        Ok(Self {
            name: field("name")?,
            image_ref: field("imageRef")?,
            flavor_ref: field("flavorRef")?,
            metadata,
            key_name: server.get("key_name").and_then(value_as_string),
        })
    }
}

/// Where the destination listens for the incoming state stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffDescriptor {
    pub server_ip: String,
    pub server_port: u16,
}

impl HandoffDescriptor {
    /// Parses the `handoff` object of a create-server reply.
    pub fn from_reply(reply: Option<&Value>) -> Result<Self, HandoffError> {
        let missing = || {
            HandoffError::Transfer("Cannot get handoff URL from the destination message".to_string())
        };
        let obj = reply.and_then(Value::as_object).ok_or_else(missing)?;
        if let Some(err) = obj.get("error").and_then(value_as_string) {
            return Err(HandoffError::Transfer(format!(
                "Destination could not prepare handoff: {}",
                err
            )));
        }
        let server_ip = obj.get("server_ip").and_then(value_as_string).ok_or_else(missing)?;
        let server_port = obj
            .get("server_port")
            .and_then(value_as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(missing)?;
        Ok(Self {
            server_ip,
            server_port,
        })
    }

    pub fn stream_url(&self) -> String {
        format!("tcp://{}:{}", self.server_ip, self.server_port)
    }
}
