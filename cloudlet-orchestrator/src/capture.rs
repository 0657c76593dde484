use serde::Serialize;
use std::sync::Arc;

use cloudlet_common::records::SiblingRefs;
use cloudlet_common::{
    BaseVmFingerprint, CloudletType, HandoffError, ImageProperties, ImageRecord, ServerRecord, TaskState,
    VmState,
};
use cloudlet_providers::ComputeCluster;

use crate::error::ClassifyError;
use crate::registry::BaseVmRegistry;
use crate::termination::SourceTerminator;
use crate::transfer::{BaseArtifacts, TransferDriver};

/// The two records a caller gets back from a base capture.
#[derive(Debug, Clone, Serialize)]
pub struct BaseVmImages {
    #[serde(rename = "base-disk")]
    pub disk: String,
    #[serde(rename = "base-memory")]
    pub memory: String,
    #[serde(skip)]
    pub fingerprint: Option<BaseVmFingerprint>,
}

/// Write side of the base-VM registry: turns running instances into tagged images.
#[derive(Clone)]
pub struct CaptureService {
    cluster: Arc<dyn ComputeCluster>,
    registry: BaseVmRegistry,
    terminator: SourceTerminator,
    driver: Arc<dyn TransferDriver>,
}

impl CaptureService {
    pub fn new(
        cluster: Arc<dyn ComputeCluster>,
        registry: BaseVmRegistry,
        terminator: SourceTerminator,
        driver: Arc<dyn TransferDriver>,
    ) -> Self {
        Self {
            cluster,
            registry,
            terminator,
            driver,
        }
    }

    /// Captures `instance_id` as a base VM named `name`.
    ///
    /// Sibling images (memory, disk-hash, memory-hash) are registered first; the disk image
    /// comes last because it embeds their ids.
    pub async fn create_base_vm(&self, instance_id: &str, name: &str) -> Result<BaseVmImages, HandoffError> {
        let name = require_name(name, "Need name of the base VM")?;
        let instance = self.load_active(instance_id).await?;

        let fingerprint = BaseVmFingerprint::from_instance_id(&instance.id);
        if let Some(existing) = self.registry.find_duplicate_base(&fingerprint).await? {
            return Err(HandoffError::Conflict(format!(
                "Base VM {} already exists as image {}",
                fingerprint, existing.id
            )));
        }
        let shape = instance.shape.ok_or_else(|| {
            HandoffError::Resolution("Cannot find memory size or CPU number of Base VM".to_string())
        })?;

        self.claim_snapshot(&instance).await?;

        let tagged = |kind: CloudletType| {
            let mut props = ImageProperties::cloudlet(kind).with_fingerprint(fingerprint.clone());
            props.resource = Some(shape);
            props
        };

        let outcome = async {
            let memory = self.register(&format!("{}-mem", name), tagged(CloudletType::BaseMemory)).await?;
            let disk_hash = self
                .register(&format!("{}-disk-meta", name), tagged(CloudletType::BaseDiskHash))
                .await?;
            let memory_hash = self
                .register(&format!("{}-mem-meta", name), tagged(CloudletType::BaseMemoryHash))
                .await?;

            let mut disk_props = tagged(CloudletType::BaseDisk);
            disk_props.siblings = SiblingRefs {
                memory: Some(memory.id.clone()),
                disk_hash: Some(disk_hash.id.clone()),
                memory_hash: Some(memory_hash.id.clone()),
            };
            let disk = self.register(&format!("{}-disk", name), disk_props).await?;

            let artifacts = BaseArtifacts {
                fingerprint: fingerprint.clone(),
                disk_image_id: disk.id.clone(),
                memory_image_id: memory.id.clone(),
                disk_hash_image_id: disk_hash.id.clone(),
                memory_hash_image_id: memory_hash.id.clone(),
            };
            self.driver
                .capture_base(&instance, &artifacts)
                .await
                .classify(HandoffError::Transfer)?;
            Ok::<_, HandoffError>((disk, memory))
        }
        .await;

        let (disk, memory) = match outcome {
            Ok(images) => images,
            Err(err) => {
                self.release_snapshot(&instance.id).await;
                return Err(err);
            }
        };

        tracing::info!(
            instance_id = %instance.id,
            fingerprint = %fingerprint,
            "[capture] base VM {} captured as disk={} memory={}",
            name,
            disk.id,
            memory.id
        );
        self.terminator.terminate(&instance.id).await?;

        Ok(BaseVmImages {
            disk: disk.id,
            memory: memory.id,
            fingerprint: Some(fingerprint),
        })
    }

    /// Captures the overlay of a synthesized instance into an image named `overlay_name`.
    pub async fn create_overlay(&self, instance_id: &str, overlay_name: &str) -> Result<ImageRecord, HandoffError> {
        let overlay_name = require_name(overlay_name, "Need name of the overlay")?;
        let instance = self.load_active(instance_id).await?;
        // Overlays keep pointing at the base they were resumed from, when known.
        let fingerprint = self.registry.lineage_of(&instance).await.ok().map(|l| l.fingerprint);

        self.claim_snapshot(&instance).await?;

        let outcome = async {
            let mut props = ImageProperties::cloudlet(CloudletType::Overlay);
            props.base_fingerprint = fingerprint;
            let image = self.register(overlay_name, props).await?;
            self.driver
                .capture_overlay(&instance, &image.id)
                .await
                .classify(HandoffError::Transfer)?;
            Ok::<_, HandoffError>(image)
        }
        .await;

        let image = match outcome {
            Ok(image) => image,
            Err(err) => {
                self.release_snapshot(&instance.id).await;
                return Err(err);
            }
        };

        tracing::info!(instance_id = %instance.id, "[capture] overlay {} captured as {}", overlay_name, image.id);
        self.terminator.terminate(&instance.id).await?;
        Ok(image)
    }

    async fn load_active(&self, instance_id: &str) -> Result<ServerRecord, HandoffError> {
        let instance = self
            .cluster
            .get_instance(instance_id)
            .await
            .classify(HandoffError::NotFound)?
            .ok_or_else(|| HandoffError::NotFound(format!("Instance {} could not be found", instance_id)))?;
        if instance.vm_state != Some(VmState::Active) {
            return Err(HandoffError::Conflict(format!(
                "Instance {} is not active (vm_state={})",
                instance_id,
                instance.vm_state.map(|s| s.as_str()).unwrap_or("unknown")
            )));
        }
        Ok(instance)
    }

    /// `image_snapshot` only when no other task is in flight.
    async fn claim_snapshot(&self, instance: &ServerRecord) -> Result<(), HandoffError> {
        let claimed = self
            .cluster
            .set_task_state(&instance.id, Some(TaskState::ImageSnapshot), &[None])
            .await
            .classify(HandoffError::Conflict)?;
        if !claimed {
            return Err(HandoffError::Conflict(format!(
                "Instance {} has a task in progress",
                instance.id
            )));
        }
        Ok(())
    }

    async fn release_snapshot(&self, instance_id: &str) {
        if let Err(err) = self
            .cluster
            .set_task_state(instance_id, None, &[Some(TaskState::ImageSnapshot)])
            .await
        {
            tracing::warn!(instance_id = %instance_id, error = %err, "[capture] could not clear task state");
        }
    }

    async fn register(&self, name: &str, properties: ImageProperties) -> Result<ImageRecord, HandoffError> {
        self.cluster
            .create_image(name, &properties)
            .await
            .classify(HandoffError::Transfer)
    }
}

fn require_name<'a>(name: &'a str, message: &str) -> Result<&'a str, HandoffError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HandoffError::Validation(message.to_string()));
    }
    Ok(name)
}
