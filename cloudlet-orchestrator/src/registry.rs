use serde::Serialize;
use std::sync::Arc;

use cloudlet_common::records::CloudletType;
use cloudlet_common::{
    BaseVmFingerprint, FlavorRecord, FlavorSpec, HandoffError, ImageRecord, ResourceShape, ServerRecord,
};
use cloudlet_providers::ComputeCluster;

use crate::error::ClassifyError;
use crate::matcher::{self, FlavorQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceClass {
    BaseDisk,
    Overlay,
    HandoffInProgress,
    Unknown,
}

impl InstanceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceClass::BaseDisk => "cloudlet_base_disk",
            InstanceClass::Overlay => "cloudlet_overlay",
            InstanceClass::HandoffInProgress => "cloudlet_handoff",
            InstanceClass::Unknown => "unknown",
        }
    }
}

/// What a source instance descends from: the fingerprint of its base VM and the
/// resource shape the destination must reproduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseLineage {
    pub fingerprint: BaseVmFingerprint,
    pub shape: ResourceShape,
    pub base_image_id: String,
    pub base_image_name: String,
}

/// Read-side queries over a cluster's image catalog, plus the flavor escape hatch.
#[derive(Clone)]
pub struct BaseVmRegistry {
    cluster: Arc<dyn ComputeCluster>,
    match_disk: bool,
}

impl BaseVmRegistry {
    pub fn new(cluster: Arc<dyn ComputeCluster>, match_disk: bool) -> Self {
        Self { cluster, match_disk }
    }

    pub fn match_disk(&self) -> bool {
        self.match_disk
    }

    /// Classification from the instance's own markers plus its backing image's tags.
    /// An untagged or unreadable backing image yields `Unknown`.
    pub async fn classify(&self, instance: &ServerRecord) -> InstanceClass {
        let Some(image_id) = instance.image_id.as_deref() else {
            return InstanceClass::Unknown;
        };
        let image = match self.cluster.get_image(image_id).await {
            Ok(Some(image)) => image,
            Ok(None) => return InstanceClass::Unknown,
            Err(err) => {
                tracing::warn!(instance_id = %instance.id, error = %err, "[registry] cannot read backing image");
                return InstanceClass::Unknown;
            }
        };
        classify_with_image(instance, &image)
    }

    pub fn is_handoff_eligible(class: InstanceClass) -> bool {
        class == InstanceClass::Overlay
    }

    /// Fingerprint and shape of the base VM `instance` was resumed from.
    pub async fn lineage_of(&self, instance: &ServerRecord) -> Result<BaseLineage, HandoffError> {
        let image_id = instance.image_id.as_deref().ok_or_else(|| {
            HandoffError::Resolution(format!("Instance {} has no backing image", instance.id))
        })?;
        let image = self
            .cluster
            .get_image(image_id)
            .await
            .classify(HandoffError::Resolution)?
            .ok_or_else(|| HandoffError::Resolution(format!("Cannot find backing image {}", image_id)))?;

        let fingerprint = image.properties.base_fingerprint.clone().ok_or_else(|| {
            HandoffError::Resolution(format!(
                "Image {} of instance {} carries no base VM fingerprint",
                image.id, instance.id
            ))
        })?;

        // The flavor the instance runs with wins; the captured blob covers records without one.
        let mut shape = instance
            .shape
            .or(image.properties.resource)
            .ok_or_else(|| HandoffError::Resolution("Cannot find memory size or CPU number of Base VM".to_string()))?;
        if shape.disk_gb.is_none() {
            shape.disk_gb = instance
                .shape
                .and_then(|s| s.disk_gb)
                .or(Some(image.min_disk_gb).filter(|d| *d > 0));
        }

        Ok(BaseLineage {
            fingerprint,
            shape,
            base_image_id: image.id.clone(),
            base_image_name: image.name.clone(),
        })
    }

    pub async fn find_duplicate_base(
        &self,
        fingerprint: &BaseVmFingerprint,
    ) -> Result<Option<ImageRecord>, HandoffError> {
        let images = self.cluster.list_images().await.classify(HandoffError::Resolution)?;
        Ok(matcher::find_base_image(&images, fingerprint, &self.cluster.endpoint())
            .ok()
            .cloned())
    }

    pub async fn create_flavor_if_absent(
        &self,
        shape: &ResourceShape,
        base_name: &str,
    ) -> Result<FlavorRecord, HandoffError> {
        let query = FlavorQuery::from_shape(shape, self.match_disk);
        create_flavor_if_absent(self.cluster.as_ref(), &query, base_name).await
    }
}

pub fn classify_with_image(instance: &ServerRecord, image: &ImageRecord) -> InstanceClass {
    if !image.properties.is_cloudlet {
        return InstanceClass::Unknown;
    }
    if instance.handoff_info().is_some() {
        InstanceClass::HandoffInProgress
    } else if instance.overlay_url().is_some() || image.properties.cloudlet_type == Some(CloudletType::Overlay) {
        InstanceClass::Overlay
    } else if image.properties.cloudlet_type == Some(CloudletType::BaseDisk) {
        InstanceClass::BaseDisk
    } else {
        // Memory snapshots, hash siblings and untyped cloudlet images.
        InstanceClass::Unknown
    }
}

/// Flavor name derived from the base VM it serves.
pub fn flavor_name_for(base_name: &str) -> String {
    format!("cloudlet-flavor-{}", base_name)
}

/// Returns an exact match when one exists, otherwise creates `cloudlet-flavor-<base>` on
/// `cluster` and matches again.
pub async fn create_flavor_if_absent(
    cluster: &dyn ComputeCluster,
    query: &FlavorQuery,
    base_name: &str,
) -> Result<FlavorRecord, HandoffError> {
    let location = cluster.endpoint();
    let flavors = cluster.list_flavors().await.classify(HandoffError::Resolution)?;
    if let Ok(existing) = matcher::find_matching_flavor(&flavors, query, &location) {
        return Ok(existing.clone());
    }

    let spec = FlavorSpec {
        name: flavor_name_for(base_name),
        vcpus: query.vcpus,
        ram_mb: query.memory_mb,
        disk_gb: query.disk_gb.unwrap_or(0),
    };
    tracing::info!(
        "[registry] no flavor with cpu={} memory={} at {}, creating {}",
        spec.vcpus,
        spec.ram_mb,
        location,
        spec.name
    );
    cluster.create_flavor(&spec).await.classify(HandoffError::Resolution)?;

    let flavors = cluster.list_flavors().await.classify(HandoffError::Resolution)?;
    matcher::find_matching_flavor(&flavors, query, &location).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudlet_common::records::{METADATA_KEY_HANDOFF_INFO, METADATA_KEY_OVERLAY_URL};
    use cloudlet_common::ImageProperties;
    use cloudlet_providers::mock::MockCluster;

    fn base_image(fp: &BaseVmFingerprint) -> ImageRecord {
        let mut properties = ImageProperties::cloudlet(CloudletType::BaseDisk).with_fingerprint(fp.clone());
        properties.resource = Some(ResourceShape::new(2, 4096));
        ImageRecord {
            id: "img-base".into(),
            name: "ubuntu-disk".into(),
            min_disk_gb: 20,
            properties,
        }
    }

    fn instance_on(image_id: &str) -> ServerRecord {
        let mut server = ServerRecord::new("vm-1", "vm");
        server.image_id = Some(image_id.into());
        server
    }

    #[tokio::test]
    async fn classify_uses_image_tags_and_markers() {
        let fp = BaseVmFingerprint::from_instance_id("base");
        let plain = ImageRecord {
            id: "img-plain".into(),
            name: "plain".into(),
            min_disk_gb: 0,
            properties: ImageProperties::default(),
        };
        let cluster = Arc::new(MockCluster::new("local").with_image(base_image(&fp)).with_image(plain));
        let registry = BaseVmRegistry::new(cluster, false);

        assert_eq!(registry.classify(&instance_on("img-base")).await, InstanceClass::BaseDisk);
        assert_eq!(registry.classify(&instance_on("img-plain")).await, InstanceClass::Unknown);
        assert_eq!(registry.classify(&instance_on("img-missing")).await, InstanceClass::Unknown);

        let mut synthesized = instance_on("img-base");
        synthesized
            .metadata
            .insert(METADATA_KEY_OVERLAY_URL.into(), "http://store/overlay".into());
        let class = registry.classify(&synthesized).await;
        assert_eq!(class, InstanceClass::Overlay);
        assert!(BaseVmRegistry::is_handoff_eligible(class));

        let mut placeholder = instance_on("img-base");
        placeholder
            .metadata
            .insert(METADATA_KEY_HANDOFF_INFO.into(), "vm-handoff".into());
        assert_eq!(registry.classify(&placeholder).await, InstanceClass::HandoffInProgress);
        assert!(!BaseVmRegistry::is_handoff_eligible(InstanceClass::BaseDisk));
    }

    #[test]
    fn only_base_disk_images_classify_as_base_disk() {
        let vm = instance_on("img-any");
        let tagged = |kind: Option<CloudletType>| ImageRecord {
            id: "img-any".into(),
            name: "any".into(),
            min_disk_gb: 0,
            properties: match kind {
                Some(kind) => ImageProperties::cloudlet(kind),
                None => ImageProperties {
                    is_cloudlet: true,
                    ..ImageProperties::default()
                },
            },
        };

        assert_eq!(
            classify_with_image(&vm, &tagged(Some(CloudletType::BaseDisk))),
            InstanceClass::BaseDisk
        );
        for kind in [
            Some(CloudletType::BaseMemory),
            Some(CloudletType::BaseDiskHash),
            Some(CloudletType::BaseMemoryHash),
            None,
        ] {
            assert_eq!(classify_with_image(&vm, &tagged(kind)), InstanceClass::Unknown, "{:?}", kind);
        }
    }

    #[tokio::test]
    async fn lineage_uses_the_running_shape() {
        let fp = BaseVmFingerprint::from_instance_id("base");
        let cluster = Arc::new(MockCluster::new("local").with_image(base_image(&fp)));
        let registry = BaseVmRegistry::new(cluster, false);

        let mut vm = instance_on("img-base");
        vm.shape = Some(ResourceShape::new(8, 16384));
        let lineage = registry.lineage_of(&vm).await.unwrap();
        assert_eq!(lineage.fingerprint, fp);
        assert_eq!(lineage.shape, ResourceShape::new(8, 16384).with_disk(20));
    }

    #[tokio::test]
    async fn lineage_falls_back_to_captured_shape() {
        let fp = BaseVmFingerprint::from_instance_id("base");
        let cluster = Arc::new(MockCluster::new("local").with_image(base_image(&fp)));
        let registry = BaseVmRegistry::new(cluster, false);

        let lineage = registry.lineage_of(&instance_on("img-base")).await.unwrap();
        assert_eq!(lineage.shape, ResourceShape::new(2, 4096).with_disk(20));
    }

    #[tokio::test]
    async fn flavor_created_once_then_reused() {
        let cluster = Arc::new(MockCluster::new("dest"));
        let registry = BaseVmRegistry::new(cluster.clone(), false);
        let shape = ResourceShape::new(2, 4096);

        let created = registry.create_flavor_if_absent(&shape, "ubuntu").await.unwrap();
        assert_eq!(created.name, "cloudlet-flavor-ubuntu");
        assert_eq!(created.disk_gb, 0);

        let again = registry.create_flavor_if_absent(&shape, "ubuntu").await.unwrap();
        assert_eq!(again.id, created.id);
        assert_eq!(cluster.flavors().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_base_is_reported() {
        let fp = BaseVmFingerprint::from_instance_id("base");
        let cluster = Arc::new(MockCluster::new("local").with_image(base_image(&fp)));
        let registry = BaseVmRegistry::new(cluster, false);

        assert!(registry.find_duplicate_base(&fp).await.unwrap().is_some());
        let other = BaseVmFingerprint::from_instance_id("other");
        assert!(registry.find_duplicate_base(&other).await.unwrap().is_none());
    }
}
