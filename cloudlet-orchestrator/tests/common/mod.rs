// Common test fixtures: mock clusters seeded with a base VM and a recording transfer driver.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use cloudlet_common::records::METADATA_KEY_OVERLAY_URL;
use cloudlet_common::{
    BaseVmFingerprint, CloudletType, FlavorRecord, ImageProperties, ImageRecord, ResourceShape, ServerRecord,
    VmState,
};
use cloudlet_orchestrator::coordinator::HandoffCoordinator;
use cloudlet_orchestrator::instance_lock::InstanceLocks;
use cloudlet_orchestrator::registry::BaseVmRegistry;
use cloudlet_orchestrator::termination::SourceTerminator;
use cloudlet_orchestrator::transfer::{BaseArtifacts, TransferDriver, TransferTarget};
use cloudlet_providers::mock::{MockCluster, MockConnector};

pub const SOURCE_ID: &str = "vm-1";
pub const DEST_AUTHORITY: &str = "10.0.0.5:8774";
pub const DEST_URL: &str = "http://10.0.0.5:8774/v2";
pub const DEST_TOKEN: &str = "tok123";
pub const OVERLAY_URL: &str = "http://store.local/overlays/vm-1";

/// Records every call. With `stream_payload` set, stream transfers actually connect to
/// the target and send the payload.
#[derive(Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<String>>,
    fail_with: Option<String>,
    stream_payload: Option<Vec<u8>>,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(message.to_string()),
            ..Default::default()
        })
    }

    pub fn streaming(payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            stream_payload: Some(payload.to_vec()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        match &self.fail_with {
            Some(message) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TransferDriver for RecordingDriver {
    async fn transfer(&self, instance: &ServerRecord, target: &TransferTarget) -> Result<()> {
        self.record(format!("transfer:{}:{}", instance.id, target.url()))?;
        if let (Some(payload), TransferTarget::Stream { host, port }) = (&self.stream_payload, target) {
            let mut stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.write_all(payload).await?;
            stream.shutdown().await?;
        }
        Ok(())
    }

    async fn capture_base(&self, instance: &ServerRecord, artifacts: &BaseArtifacts) -> Result<()> {
        self.record(format!("capture_base:{}:{}", instance.id, artifacts.disk_image_id))
    }

    async fn capture_overlay(&self, instance: &ServerRecord, overlay_image_id: &str) -> Result<()> {
        self.record(format!("capture_overlay:{}:{}", instance.id, overlay_image_id))
    }
}

pub fn base_fingerprint() -> BaseVmFingerprint {
    BaseVmFingerprint::from_instance_id("vm-base-origin")
}

/// Base-disk image carrying the captured 2 vCPU / 4096 MB shape.
pub fn base_image(id: &str, fingerprint: &BaseVmFingerprint) -> ImageRecord {
    let mut properties = ImageProperties::cloudlet(CloudletType::BaseDisk).with_fingerprint(fingerprint.clone());
    properties.resource = Some(ResourceShape::new(2, 4096));
    ImageRecord {
        id: id.to_string(),
        name: "ubuntu-disk".to_string(),
        min_disk_gb: 20,
        properties,
    }
}

pub fn plain_image(id: &str) -> ImageRecord {
    ImageRecord {
        id: id.to_string(),
        name: id.to_string(),
        min_disk_gb: 0,
        properties: ImageProperties::default(),
    }
}

pub fn flavor(id: &str, vcpus: u32, ram_mb: u64, disk_gb: u64) -> FlavorRecord {
    FlavorRecord {
        id: id.to_string(),
        name: id.to_string(),
        vcpus,
        ram_mb,
        disk_gb,
        links: vec![],
    }
}

pub fn active_server(id: &str, image_id: &str) -> ServerRecord {
    let mut server = ServerRecord::new(id, "vm");
    server.vm_state = Some(VmState::Active);
    server.image_id = Some(image_id.to_string());
    server.shape = Some(ResourceShape::new(2, 4096).with_disk(20));
    server
}

/// Synthesized VM resumed from the base image, i.e. a handoff candidate.
pub fn overlay_server(id: &str) -> ServerRecord {
    let mut server = active_server(id, "img-base");
    server
        .metadata
        .insert(METADATA_KEY_OVERLAY_URL.to_string(), OVERLAY_URL.to_string());
    server
}

pub fn source_cluster() -> MockCluster {
    MockCluster::new("local")
        .with_image(base_image("img-base", &base_fingerprint()))
        .with_server(overlay_server(SOURCE_ID))
}

/// Destination with a compatible base image, a 2/4096 flavor and a ready listener.
pub fn destination_cluster() -> MockCluster {
    MockCluster::new(DEST_AUTHORITY)
        .with_image(base_image("img-dest-base", &base_fingerprint()))
        .with_flavor(flavor("flv-small", 1, 2048, 20))
        .with_flavor(flavor("flv-medium", 2, 4096, 40))
        .with_handoff_endpoint("10.0.0.5", 40122)
}

pub fn connector_for(destination: Arc<MockCluster>) -> Arc<MockConnector> {
    Arc::new(
        MockConnector::new()
            .accepting_token(DEST_TOKEN)
            .register(DEST_AUTHORITY, destination),
    )
}

pub fn coordinator(
    local: Arc<MockCluster>,
    connector: Arc<MockConnector>,
    driver: Arc<RecordingDriver>,
) -> HandoffCoordinator {
    let registry = BaseVmRegistry::new(local.clone(), false);
    let terminator = SourceTerminator::new(local.clone(), InstanceLocks::new());
    HandoffCoordinator::new(local, registry, connector, driver, terminator)
}

pub fn fast_poll() -> Duration {
    Duration::from_millis(5)
}
