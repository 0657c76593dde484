//! Pure matching of base images and flavors against a cluster's catalogs.

use cloudlet_common::{BaseVmFingerprint, FlavorRecord, HandoffError, ImageRecord, ResourceShape};

/// First base-disk image carrying `fingerprint`. Images of any other type are ignored,
/// even when they share the fingerprint.
pub fn find_base_image<'a>(
    images: &'a [ImageRecord],
    fingerprint: &BaseVmFingerprint,
    location: &str,
) -> Result<&'a ImageRecord, HandoffError> {
    images
        .iter()
        .filter(|image| image.properties.is_base_disk())
        .find(|image| image.properties.base_fingerprint.as_ref() == Some(fingerprint))
        .ok_or_else(|| {
            HandoffError::Resolution(format!(
                "Cannot find matching Base VM with ({}) at ({})",
                fingerprint, location
            ))
        })
}

/// Exact shape a flavor must have. `disk_gb` participates only when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlavorQuery {
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_gb: Option<u64>,
}

impl FlavorQuery {
    pub fn from_shape(shape: &ResourceShape, match_disk: bool) -> Self {
        Self {
            vcpus: shape.vcpus,
            memory_mb: shape.memory_mb,
            disk_gb: if match_disk { shape.disk_gb } else { None },
        }
    }

    pub fn matches(&self, flavor: &FlavorRecord) -> bool {
        flavor.vcpus == self.vcpus
            && flavor.ram_mb == self.memory_mb
            && self.disk_gb.map_or(true, |disk| flavor.disk_gb == disk)
    }
}

/// Exact-match only; there is no nearest-fit fallback.
pub fn find_matching_flavor<'a>(
    flavors: &'a [FlavorRecord],
    query: &FlavorQuery,
    location: &str,
) -> Result<&'a FlavorRecord, HandoffError> {
    flavors.iter().find(|flavor| query.matches(flavor)).ok_or_else(|| {
        HandoffError::Resolution(format!(
            "Cannot find matching flavor with cpu={}, memory={} at {}",
            query.vcpus, query.memory_mb, location
        ))
    })
}
