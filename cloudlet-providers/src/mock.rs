use crate::{ComputeCluster, CreatedServer, DestinationConnector, ResourceKind};
use anyhow::Result;
use async_trait::async_trait;
use cloudlet_common::{
    ComputeNode, CreateServerRequest, DestinationUrl, FlavorRecord, FlavorSpec, HandoffError,
    ImageProperties, ImageRecord, ServerRecord, TaskState, VmState,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct MockState {
    images: Vec<ImageRecord>,
    flavors: Vec<FlavorRecord>,
    servers: BTreeMap<String, ServerRecord>,
    compute_nodes: Vec<ComputeNode>,
    /// Polls left before a freshly created server gets a host.
    pending_schedule: HashMap<String, u32>,
    next_id: u64,
    calls: Vec<String>,
}

/// In-memory compute cluster for local runs and tests.
///
/// Every mutating call is appended to a call log so tests can assert on ordering.
pub struct MockCluster {
    name: String,
    state: Mutex<MockState>,
    handoff_reply: Option<Value>,
    schedule_after: u32,
    delete_failure: Option<String>,
    reject_task_state: bool,
}

impl MockCluster {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState::default()),
            handoff_reply: None,
            schedule_after: 0,
            delete_failure: None,
            reject_task_state: false,
        }
    }

    pub fn with_image(self, image: ImageRecord) -> Self {
        self.lock().images.push(image);
        self
    }

    pub fn with_flavor(self, flavor: FlavorRecord) -> Self {
        self.lock().flavors.push(flavor);
        self
    }

    pub fn with_server(self, server: ServerRecord) -> Self {
        self.lock().servers.insert(server.id.clone(), server);
        self
    }

    pub fn with_compute_node(self, hostname: &str, host_ip: Option<&str>) -> Self {
        self.lock().compute_nodes.push(ComputeNode {
            hypervisor_hostname: hostname.to_string(),
            host_ip: host_ip.map(str::to_string),
        });
        self
    }

    /// `handoff` section attached to every create-server reply.
    pub fn with_handoff_reply(mut self, reply: Value) -> Self {
        self.handoff_reply = Some(reply);
        self
    }

    pub fn with_handoff_endpoint(self, ip: &str, port: u16) -> Self {
        self.with_handoff_reply(json!({ "server_ip": ip, "server_port": port }))
    }

    /// New servers stay unscheduled for `polls` lookups.
    pub fn schedule_after(mut self, polls: u32) -> Self {
        self.schedule_after = polls;
        self
    }

    pub fn fail_deletes_with(mut self, message: &str) -> Self {
        self.delete_failure = Some(message.to_string());
        self
    }

    /// Every task-state compare-and-set reports a mismatch.
    pub fn reject_task_state(mut self) -> Self {
        self.reject_task_state = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not wedge the others.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn images(&self) -> Vec<ImageRecord> {
        self.lock().images.clone()
    }

    pub fn flavors(&self) -> Vec<FlavorRecord> {
        self.lock().flavors.clone()
    }

    pub fn server(&self, server_id: &str) -> Option<ServerRecord> {
        self.lock().servers.get(server_id).cloned()
    }

    pub fn servers(&self) -> Vec<ServerRecord> {
        self.lock().servers.values().cloned().collect()
    }

    fn record(state: &mut MockState, call: String) {
        tracing::debug!("[Mock] {}", call);
        state.calls.push(call);
    }

    fn next_id(state: &mut MockState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }
}

#[async_trait]
impl ComputeCluster for MockCluster {
    fn endpoint(&self) -> String {
        self.name.clone()
    }

    async fn list_resources(&self, kind: ResourceKind) -> Result<Vec<Value>> {
        let state = self.lock();
        let values = match kind {
            ResourceKind::Images => state.images.iter().map(ImageRecord::to_value).collect(),
            ResourceKind::Flavors => state
                .flavors
                .iter()
                .map(|f| serde_json::to_value(f).unwrap_or(Value::Null))
                .collect(),
            ResourceKind::Servers => state.servers.values().map(ServerRecord::to_value).collect(),
            ResourceKind::Extensions => vec![json!({ "alias": "os-cloudlet" })],
        };
        Ok(values)
    }

    async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        Ok(self.lock().images.clone())
    }

    async fn list_flavors(&self) -> Result<Vec<FlavorRecord>> {
        Ok(self.lock().flavors.clone())
    }

    async fn get_instance(&self, server_id: &str) -> Result<Option<ServerRecord>> {
        let mut state = self.lock();
        let remaining = state.pending_schedule.get(server_id).copied();
        match remaining {
            Some(0) => {
                state.pending_schedule.remove(server_id);
                let host = state.compute_nodes.first().map(|n| n.hypervisor_hostname.clone());
                if let Some(server) = state.servers.get_mut(server_id) {
                    server.host = host;
                }
            }
            Some(n) => {
                state.pending_schedule.insert(server_id.to_string(), n - 1);
            }
            None => {}
        }
        Ok(state.servers.get(server_id).cloned())
    }

    async fn create_instance(&self, request: &CreateServerRequest) -> Result<CreatedServer> {
        let mut state = self.lock();
        let id = Self::next_id(&mut state, "srv");
        Self::record(&mut state, format!("create_instance:{}", request.name));

        let shape = state
            .flavors
            .iter()
            .find(|f| f.id == request.flavor_ref || f.reference() == request.flavor_ref)
            .map(|f| cloudlet_common::ResourceShape::new(f.vcpus, f.ram_mb).with_disk(f.disk_gb));

        let mut server = ServerRecord::new(id.clone(), request.name.clone());
        server.vm_state = Some(VmState::Active);
        server.image_id = Some(request.image_ref.clone());
        server.flavor_id = Some(request.flavor_ref.clone());
        server.shape = shape;
        server.metadata = request.metadata.clone();
        server.links = vec![cloudlet_common::records::Link {
            href: format!("http://{}/v2/servers/{}", self.name, id),
            rel: "self".to_string(),
        }];
        if self.schedule_after == 0 {
            server.host = state.compute_nodes.first().map(|n| n.hypervisor_hostname.clone());
        } else {
            state.pending_schedule.insert(id.clone(), self.schedule_after);
        }
        state.servers.insert(id, server.clone());

        Ok(CreatedServer {
            server,
            handoff: self.handoff_reply.clone(),
            synthesis: None,
        })
    }

    async fn delete_instance(&self, server_id: &str) -> Result<bool> {
        let mut state = self.lock();
        Self::record(&mut state, format!("delete_instance:{}", server_id));
        if let Some(message) = &self.delete_failure {
            return Err(anyhow::anyhow!("Mock delete failed: {}", message));
        }
        Ok(state.servers.remove(server_id).is_some())
    }

    async fn create_image(&self, name: &str, properties: &ImageProperties) -> Result<ImageRecord> {
        let mut state = self.lock();
        let id = Self::next_id(&mut state, "img");
        Self::record(&mut state, format!("create_image:{}", name));
        let image = ImageRecord {
            id,
            name: name.to_string(),
            min_disk_gb: 0,
            properties: properties.clone(),
        };
        state.images.push(image.clone());
        Ok(image)
    }

    async fn create_flavor(&self, spec: &FlavorSpec) -> Result<FlavorRecord> {
        let mut state = self.lock();
        if state.flavors.iter().any(|f| f.name == spec.name) {
            return Err(HandoffError::Conflict(format!("Flavor {} already exists", spec.name)).into());
        }
        let id = Self::next_id(&mut state, "flv");
        Self::record(&mut state, format!("create_flavor:{}", spec.name));
        let flavor = FlavorRecord {
            id,
            name: spec.name.clone(),
            vcpus: spec.vcpus,
            ram_mb: spec.ram_mb,
            disk_gb: spec.disk_gb,
            links: vec![],
        };
        state.flavors.push(flavor.clone());
        Ok(flavor)
    }

    async fn list_compute_nodes(&self) -> Result<Vec<ComputeNode>> {
        Ok(self.lock().compute_nodes.clone())
    }

    async fn set_task_state(
        &self,
        server_id: &str,
        new_state: Option<TaskState>,
        expected: &[Option<TaskState>],
    ) -> Result<bool> {
        let mut state = self.lock();
        let label = new_state.map(|s| s.as_str()).unwrap_or("none");
        Self::record(&mut state, format!("set_task_state:{}:{}", server_id, label));
        if self.reject_task_state {
            return Ok(false);
        }
        let Some(server) = state.servers.get_mut(server_id) else {
            return Err(HandoffError::NotFound(format!("Instance {} not found", server_id)).into());
        };
        if !expected.is_empty() && !expected.contains(&server.task_state) {
            return Ok(false);
        }
        server.task_state = new_state;
        Ok(true)
    }

    async fn set_vm_state(&self, server_id: &str, vm_state: VmState) -> Result<bool> {
        let mut state = self.lock();
        Self::record(&mut state, format!("set_vm_state:{}:{}", server_id, vm_state.as_str()));
        match state.servers.get_mut(server_id) {
            Some(server) => {
                server.vm_state = Some(vm_state);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Resolves destination authorities to registered mock clusters.
#[derive(Default)]
pub struct MockConnector {
    clusters: Mutex<HashMap<String, Arc<MockCluster>>>,
    accepted_token: Option<String>,
    attempts: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only `token` authenticates; without this any non-empty token does.
    pub fn accepting_token(mut self, token: &str) -> Self {
        self.accepted_token = Some(token.to_string());
        self
    }

    pub fn register(self, authority: &str, cluster: Arc<MockCluster>) -> Self {
        if let Ok(mut clusters) = self.clusters.lock() {
            clusters.insert(authority.to_string(), cluster);
        }
        self
    }

    /// Authorities this connector was asked to reach, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DestinationConnector for MockConnector {
    async fn connect(&self, endpoint: &DestinationUrl, token: &str) -> Result<Arc<dyn ComputeCluster>> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(endpoint.authority().to_string());
        }
        if let Some(accepted) = &self.accepted_token {
            if accepted != token {
                return Err(HandoffError::Authentication(format!(
                    "token rejected by {}",
                    endpoint.authority()
                ))
                .into());
            }
        }
        let cluster = self
            .clusters
            .lock()
            .ok()
            .and_then(|c| c.get(endpoint.authority()).cloned())
            .ok_or_else(|| anyhow::anyhow!("Mock destination {} is unreachable", endpoint.authority()))?;
        Ok(cluster)
    }
}
