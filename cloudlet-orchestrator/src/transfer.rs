use anyhow::Result;
use async_trait::async_trait;
use cloudlet_common::{BaseVmFingerprint, ServerRecord};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Where the external provisioning driver sends a VM's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    /// Live stream to a listening destination (`tcp://host:port`).
    Stream { host: String, port: u16 },
    /// Local package (disk, memory, disk-hash, memory-hash + manifest) stored as `image_id`.
    LocalPackage { image_id: String, name: String },
}

impl TransferTarget {
    pub fn url(&self) -> String {
        match self {
            TransferTarget::Stream { host, port } => format!("tcp://{}:{}", host, port),
            TransferTarget::LocalPackage { name, .. } => format!("file:///{}", name),
        }
    }
}

/// Image ids the driver fills during a base-VM capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseArtifacts {
    pub fingerprint: BaseVmFingerprint,
    pub disk_image_id: String,
    pub memory_image_id: String,
    pub disk_hash_image_id: String,
    pub memory_hash_image_id: String,
}

/// Seam to the external provisioning/codec library. It owns snapshotting, hashing and
/// streaming; this crate only decides when and where.
#[async_trait]
pub trait TransferDriver: Send + Sync {
    async fn transfer(&self, instance: &ServerRecord, target: &TransferTarget) -> Result<()>;

    async fn capture_base(&self, instance: &ServerRecord, artifacts: &BaseArtifacts) -> Result<()>;

    async fn capture_overlay(&self, instance: &ServerRecord, overlay_image_id: &str) -> Result<()>;
}

/// Runs the provisioning library's CLI as a child process.
pub struct CommandTransferDriver {
    program: String,
    timeout: Option<Duration>,
}

impl CommandTransferDriver {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        tracing::info!("[transfer] {} {}", self.program, args.join(" "));
        let child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn '{}': {}", self.program, e))?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", self.program, limit))??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "{} {} failed ({}): {}",
                self.program,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                stderr.trim()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferDriver for CommandTransferDriver {
    async fn transfer(&self, instance: &ServerRecord, target: &TransferTarget) -> Result<()> {
        let mut args = vec![
            "handoff".to_string(),
            "--instance".to_string(),
            instance.id.clone(),
            "--target".to_string(),
            target.url(),
        ];
        if let TransferTarget::LocalPackage { image_id, .. } = target {
            args.push("--image".to_string());
            args.push(image_id.clone());
        }
        self.run(args).await
    }

    async fn capture_base(&self, instance: &ServerRecord, artifacts: &BaseArtifacts) -> Result<()> {
        self.run(vec![
            "base".to_string(),
            "--instance".to_string(),
            instance.id.clone(),
            "--fingerprint".to_string(),
            artifacts.fingerprint.to_string(),
            "--disk-image".to_string(),
            artifacts.disk_image_id.clone(),
            "--memory-image".to_string(),
            artifacts.memory_image_id.clone(),
            "--disk-hash-image".to_string(),
            artifacts.disk_hash_image_id.clone(),
            "--memory-hash-image".to_string(),
            artifacts.memory_hash_image_id.clone(),
        ])
        .await
    }

    async fn capture_overlay(&self, instance: &ServerRecord, overlay_image_id: &str) -> Result<()> {
        self.run(vec![
            "overlay".to_string(),
            "--instance".to_string(),
            instance.id.clone(),
            "--image".to_string(),
            overlay_image_id.to_string(),
        ])
        .await
    }
}
