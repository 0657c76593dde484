use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use cloudlet_common::records::{METADATA_KEY_HANDOFF_INFO, METADATA_KEY_OVERLAY_URL};
use cloudlet_common::{
    CloudletType, CreateServerRequest, DestinationUrl, FlavorRecord, HandoffDescriptor, HandoffError,
    HandoffRequest, HandoffTarget, ImageProperties, ServerRecord, TaskState, ValidatedHandoff, VmState,
};
use cloudlet_providers::{ComputeCluster, DestinationConnector};

use crate::error::ClassifyError;
use crate::matcher::{self, FlavorQuery};
use crate::port_forward::{ForwardSupervisor, RelayStatus};
use crate::registry::{self, BaseLineage, BaseVmRegistry};
use crate::state_machine::{HandoffState, TransitionJournal};
use crate::termination::SourceTerminator;
use crate::transfer::{TransferDriver, TransferTarget};

const JOURNAL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandoffOutcome {
    /// Artifact id for `file`, the destination url echoed back otherwise.
    pub handoff: String,
}

/// Drives one handoff end to end:
/// validate, resolve destination, provision placeholder, transfer, terminate source.
///
/// The source is claimed (`task_state = migrating`) as soon as it is loaded, so a
/// second handoff of the same instance is refused with a conflict. Any failure before
/// `FINALIZING` releases the claim. Nothing else is rolled back: errors raised before
/// `PROVISIONING` leave the destination untouched, later ones leave whatever was
/// already created in place.
pub struct HandoffCoordinator {
    cluster: Arc<dyn ComputeCluster>,
    registry: BaseVmRegistry,
    connector: Arc<dyn DestinationConnector>,
    driver: Arc<dyn TransferDriver>,
    terminator: SourceTerminator,
    relays: Option<Arc<ForwardSupervisor>>,
    flavor_auto_create: bool,
    journals: Mutex<VecDeque<TransitionJournal>>,
}

impl HandoffCoordinator {
    pub fn new(
        cluster: Arc<dyn ComputeCluster>,
        registry: BaseVmRegistry,
        connector: Arc<dyn DestinationConnector>,
        driver: Arc<dyn TransferDriver>,
        terminator: SourceTerminator,
    ) -> Self {
        Self {
            cluster,
            registry,
            connector,
            driver,
            terminator,
            relays: None,
            flavor_auto_create: false,
            journals: Mutex::new(VecDeque::new()),
        }
    }

    /// Relays advertised by this supervisor are awaited before the source is torn down.
    pub fn with_relays(mut self, relays: Arc<ForwardSupervisor>) -> Self {
        self.relays = Some(relays);
        self
    }

    pub fn with_flavor_auto_create(mut self, enabled: bool) -> Self {
        self.flavor_auto_create = enabled;
        self
    }

    pub async fn perform_handoff(&self, request: &HandoffRequest) -> Result<HandoffOutcome, HandoffError> {
        let mut journal = TransitionJournal::new(request.source_instance_id.trim());
        let result = self.drive(request, &mut journal).await;
        if let Err(err) = &result {
            journal.fail(&err.to_string());
            tracing::error!(
                handoff_id = %journal.handoff_id,
                instance_id = %journal.instance_id,
                code = err.code(),
                side_effect_free = err.is_side_effect_free(),
                "[handoff] failed: {}",
                err
            );
        }
        self.remember(journal);
        result
    }

    /// Most recent journals, newest first.
    pub fn recent_handoffs(&self) -> Vec<TransitionJournal> {
        let journals = self.journals.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        journals.iter().rev().cloned().collect()
    }

    async fn drive(
        &self,
        request: &HandoffRequest,
        journal: &mut TransitionJournal,
    ) -> Result<HandoffOutcome, HandoffError> {
        // No I/O before this returns.
        let validated = request.validate()?;
        let source = self.load_source(&validated.source_instance_id).await?;

        let handoff = match self.hand_over(&validated, &source, journal).await {
            Ok(handoff) => handoff,
            Err(err) => {
                self.release_claim(&source.id).await;
                return Err(err);
            }
        };

        self.finalize(&source, journal).await?;
        Ok(HandoffOutcome { handoff })
    }

    /// Everything between claiming the source and tearing it down.
    async fn hand_over(
        &self,
        validated: &ValidatedHandoff,
        source: &ServerRecord,
        journal: &mut TransitionJournal,
    ) -> Result<String, HandoffError> {
        let handoff = match &validated.target {
            HandoffTarget::Remote { endpoint, token } => {
                self.handoff_remote(source, endpoint, token, validated.destination_vm_name.as_deref(), journal)
                    .await?;
                validated.destination.as_str().to_string()
            }
            HandoffTarget::LocalExport { residue_name } => self.export_local(source, residue_name, journal).await?,
            HandoffTarget::Stream { host, port } => {
                journal.advance(HandoffState::AwaitingTransfer, "stream target already resolved");
                let target = TransferTarget::Stream {
                    host: host.clone(),
                    port: *port,
                };
                self.transfer(source, &target).await?;
                self.await_owned_relay(host, *port).await?;
                validated.destination.as_str().to_string()
            }
        };
        Ok(handoff)
    }

    async fn load_source(&self, instance_id: &str) -> Result<ServerRecord, HandoffError> {
        let source = self
            .cluster
            .get_instance(instance_id)
            .await
            .classify(HandoffError::Resolution)?
            .ok_or_else(|| HandoffError::NotFound(format!("Instance {} could not be found", instance_id)))?;

        if source.vm_state != Some(VmState::Active) {
            return Err(HandoffError::Conflict(format!(
                "Instance {} is not active (vm_state={})",
                instance_id,
                source.vm_state.map(|s| s.as_str()).unwrap_or("unknown")
            )));
        }
        if let Some(task) = source.task_state {
            return Err(HandoffError::Conflict(format!(
                "Instance {} is busy (task_state={})",
                instance_id,
                task.as_str()
            )));
        }

        let claimed = self
            .cluster
            .set_task_state(instance_id, Some(TaskState::Migrating), &[None])
            .await
            .classify(HandoffError::Resolution)?;
        if !claimed {
            return Err(HandoffError::Conflict(format!(
                "Instance {} was claimed by another operation",
                instance_id
            )));
        }
        tracing::debug!(instance_id = %instance_id, "[handoff] source claimed");
        Ok(source)
    }

    async fn release_claim(&self, instance_id: &str) {
        match self
            .cluster
            .set_task_state(instance_id, None, &[Some(TaskState::Migrating)])
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(instance_id = %instance_id, "[handoff] claim was already changed"),
            Err(err) => tracing::warn!(instance_id = %instance_id, error = %err, "[handoff] cannot release claim"),
        }
    }

    async fn handoff_remote(
        &self,
        source: &ServerRecord,
        endpoint: &DestinationUrl,
        token: &str,
        vm_name: Option<&str>,
        journal: &mut TransitionJournal,
    ) -> Result<(), HandoffError> {
        let location = endpoint.authority();
        journal.advance(
            HandoffState::ResolvingDestination,
            &format!("connecting to {}", location),
        );
        let remote = self
            .connector
            .connect(endpoint, token)
            .await
            .classify(HandoffError::Resolution)?;

        let lineage = self.registry.lineage_of(source).await?;
        let images = remote.list_images().await.classify(HandoffError::Resolution)?;
        let base = matcher::find_base_image(&images, &lineage.fingerprint, location)?.clone();
        let flavor = self.resolve_flavor(remote.as_ref(), &lineage, location).await?;
        tracing::info!(
            instance_id = %source.id,
            fingerprint = %lineage.fingerprint,
            "[handoff] {} matched base image {} and flavor {}",
            location,
            base.id,
            flavor.id
        );

        let name = vm_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-handoff", source.name));
        journal.advance(
            HandoffState::Provisioning,
            &format!("creating placeholder {} at {}", name, location),
        );
        let mut metadata = BTreeMap::new();
        metadata.insert(METADATA_KEY_HANDOFF_INFO.to_string(), name.clone());
        if let Some(overlay_url) = source.overlay_url() {
            metadata.insert(METADATA_KEY_OVERLAY_URL.to_string(), overlay_url.to_string());
        }
        let placeholder = CreateServerRequest {
            name,
            image_ref: base.id.clone(),
            flavor_ref: flavor.reference(),
            metadata,
            key_name: None,
        };
        let created = remote
            .create_instance(&placeholder)
            .await
            .classify(HandoffError::Transfer)?;

        journal.advance(
            HandoffState::AwaitingTransfer,
            &format!("placeholder {} created", created.server.id),
        );
        let descriptor = HandoffDescriptor::from_reply(created.handoff.as_ref()).map_err(|err| {
            tracing::warn!(
                instance_id = %source.id,
                placeholder_id = %created.server.id,
                "[handoff] placeholder at {} is left behind",
                location
            );
            err
        })?;
        let target = TransferTarget::Stream {
            host: descriptor.server_ip.clone(),
            port: descriptor.server_port,
        };
        self.transfer(source, &target).await?;
        self.await_owned_relay(&descriptor.server_ip, descriptor.server_port).await
    }

    async fn resolve_flavor(
        &self,
        remote: &dyn ComputeCluster,
        lineage: &BaseLineage,
        location: &str,
    ) -> Result<FlavorRecord, HandoffError> {
        let query = FlavorQuery::from_shape(&lineage.shape, self.registry.match_disk());
        let flavors = remote.list_flavors().await.classify(HandoffError::Resolution)?;
        match matcher::find_matching_flavor(&flavors, &query, location) {
            Ok(flavor) => Ok(flavor.clone()),
            Err(_) if self.flavor_auto_create => {
                let base_name = lineage
                    .base_image_name
                    .strip_suffix("-disk")
                    .unwrap_or(&lineage.base_image_name);
                registry::create_flavor_if_absent(remote, &query, base_name).await
            }
            Err(err) => Err(err),
        }
    }

    /// `file` scheme: the residue becomes a tagged overlay image on the local cluster.
    async fn export_local(
        &self,
        source: &ServerRecord,
        residue_name: &str,
        journal: &mut TransitionJournal,
    ) -> Result<String, HandoffError> {
        journal.advance(
            HandoffState::Provisioning,
            &format!("registering residue image {}", residue_name),
        );
        let mut properties = ImageProperties::cloudlet(CloudletType::Overlay);
        properties.base_fingerprint = self.registry.lineage_of(source).await.ok().map(|l| l.fingerprint);
        let image = self
            .cluster
            .create_image(residue_name, &properties)
            .await
            .classify(HandoffError::Transfer)?;

        journal.advance(
            HandoffState::AwaitingTransfer,
            &format!("residue image {} registered", image.id),
        );
        let target = TransferTarget::LocalPackage {
            image_id: image.id.clone(),
            name: residue_name.to_string(),
        };
        self.transfer(source, &target).await?;
        Ok(image.id)
    }

    async fn transfer(&self, source: &ServerRecord, target: &TransferTarget) -> Result<(), HandoffError> {
        tracing::info!(instance_id = %source.id, "[handoff] transferring to {}", target.url());
        self.driver
            .transfer(source, target)
            .await
            .classify(HandoffError::Transfer)
    }

    /// Blocks on the relay behind `ip:port` only when this process started it.
    async fn await_owned_relay(&self, ip: &str, port: u16) -> Result<(), HandoffError> {
        let Some(mut handle) = self.relays.as_ref().and_then(|r| r.lookup(ip, port)) else {
            return Ok(());
        };
        match handle.wait().await {
            RelayStatus::Finished(outcome) => {
                tracing::debug!(
                    relay_id = handle.id,
                    inbound = outcome.inbound_bytes,
                    "[handoff] local relay {}:{} drained",
                    ip,
                    port
                );
                Ok(())
            }
            other => Err(HandoffError::Transfer(format!(
                "relay {}:{} did not complete: {:?}",
                ip, port, other
            ))),
        }
    }

    async fn finalize(&self, source: &ServerRecord, journal: &mut TransitionJournal) -> Result<(), HandoffError> {
        journal.advance(HandoffState::Finalizing, "transfer reported complete");
        // Blocks other operations on the source while it is being deleted.
        match self
            .cluster
            .set_task_state(&source.id, Some(TaskState::ImageSnapshot), &[Some(TaskState::Migrating)])
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(instance_id = %source.id, "[handoff] task state was not updated"),
            Err(err) => tracing::warn!(instance_id = %source.id, error = %err, "[handoff] cannot mark source"),
        }
        self.terminator.terminate(&source.id).await?;
        journal.advance(HandoffState::Done, "source terminated");
        Ok(())
    }

    fn remember(&self, journal: TransitionJournal) {
        let mut journals = self.journals.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if journals.len() == JOURNAL_CAPACITY {
            journals.pop_front();
        }
        journals.push_back(journal);
    }
}
