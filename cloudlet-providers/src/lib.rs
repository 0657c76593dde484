use anyhow::Result;
use async_trait::async_trait;
use cloudlet_common::{
    ComputeNode, CreateServerRequest, DestinationUrl, FlavorRecord, FlavorSpec, ImageProperties,
    ImageRecord, ServerRecord, TaskState, VmState,
};
use serde_json::Value;
use std::sync::Arc;

/// Collections a compute cluster can enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Images,
    Flavors,
    Servers,
    Extensions,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Images => "images",
            ResourceKind::Flavors => "flavors",
            ResourceKind::Servers => "servers",
            ResourceKind::Extensions => "extensions",
        }
    }

    /// Extensions have no `/detail` variant.
    pub fn has_detail(&self) -> bool {
        !matches!(self, ResourceKind::Extensions)
    }
}

/// Result of a create-server call. `handoff` and `synthesis` are the extra reply
/// sections a cloudlet-aware destination attaches.
#[derive(Debug, Clone)]
pub struct CreatedServer {
    pub server: ServerRecord,
    pub handoff: Option<Value>,
    pub synthesis: Option<Value>,
}

/// Errors are `anyhow`; classified failures carry a `cloudlet_common::HandoffError`
/// that callers recover with `downcast_ref`.
#[async_trait]
pub trait ComputeCluster: Send + Sync {
    /// Human-readable location of this cluster, used in error messages.
    fn endpoint(&self) -> String;

    async fn list_resources(&self, kind: ResourceKind) -> Result<Vec<Value>>;

    async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let raw = self.list_resources(ResourceKind::Images).await?;
        Ok(raw.iter().filter_map(ImageRecord::from_value).collect())
    }

    async fn list_flavors(&self) -> Result<Vec<FlavorRecord>> {
        let raw = self.list_resources(ResourceKind::Flavors).await?;
        Ok(raw.iter().filter_map(FlavorRecord::from_value).collect())
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        let raw = self.list_resources(ResourceKind::Servers).await?;
        Ok(raw.iter().filter_map(ServerRecord::from_value).collect())
    }

    async fn get_instance(&self, server_id: &str) -> Result<Option<ServerRecord>>;

    async fn get_image(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        let images = self.list_images().await?;
        Ok(images.into_iter().find(|i| i.id == image_id))
    }

    async fn create_instance(&self, request: &CreateServerRequest) -> Result<CreatedServer>;

    /// Returns false when the server no longer exists.
    async fn delete_instance(&self, server_id: &str) -> Result<bool>;

    /// Registers an image record carrying `properties`. Data upload is the transfer driver's job.
    async fn create_image(&self, name: &str, properties: &ImageProperties) -> Result<ImageRecord>;

    async fn create_flavor(&self, spec: &FlavorSpec) -> Result<FlavorRecord>;

    // Optional: hypervisor inventory. Default: none known.
    async fn list_compute_nodes(&self) -> Result<Vec<ComputeNode>> {
        Ok(vec![])
    }

    /// Compare-and-set on the server's task state. An empty `expected` slice means
    /// unconditional. Returns false when the current state was not in `expected`.
    async fn set_task_state(
        &self,
        server_id: &str,
        new_state: Option<TaskState>,
        expected: &[Option<TaskState>],
    ) -> Result<bool>;

    async fn set_vm_state(&self, server_id: &str, state: VmState) -> Result<bool>;
}

/// Opens an authenticated session against a destination cluster.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    async fn connect(&self, endpoint: &DestinationUrl, token: &str) -> Result<Arc<dyn ComputeCluster>>;
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "openstack")]
pub mod openstack;
