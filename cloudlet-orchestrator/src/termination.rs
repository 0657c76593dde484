use std::sync::Arc;

use cloudlet_common::{HandoffError, VmState};
use cloudlet_providers::ComputeCluster;

use crate::instance_lock::InstanceLocks;

/// Deletes source instances once their state has been handed off or captured.
///
/// Deletion runs under the instance's named lock. A missing instance counts as deleted;
/// any other failure puts the instance into ERROR and surfaces as `Termination`.
#[derive(Clone)]
pub struct SourceTerminator {
    cluster: Arc<dyn ComputeCluster>,
    locks: InstanceLocks,
}

impl SourceTerminator {
    pub fn new(cluster: Arc<dyn ComputeCluster>, locks: InstanceLocks) -> Self {
        Self { cluster, locks }
    }

    pub fn locks(&self) -> &InstanceLocks {
        &self.locks
    }

    pub async fn terminate(&self, instance_id: &str) -> Result<(), HandoffError> {
        let _guard = self.locks.acquire(instance_id).await;

        match self.cluster.delete_instance(instance_id).await {
            Ok(true) => {
                tracing::info!(instance_id = %instance_id, "[terminator] source instance deleted");
                Ok(())
            }
            Ok(false) => {
                tracing::warn!(instance_id = %instance_id, "[terminator] instance already gone, treating as deleted");
                Ok(())
            }
            Err(err) => {
                if let Some(HandoffError::NotFound(_)) = err.downcast_ref::<HandoffError>() {
                    tracing::warn!(instance_id = %instance_id, "[terminator] instance already gone, treating as deleted");
                    return Ok(());
                }
                tracing::error!(instance_id = %instance_id, error = %err, "[terminator] delete failed, setting ERROR state");
                if let Err(reset_err) = self.cluster.set_vm_state(instance_id, VmState::Error).await {
                    tracing::error!(
                        instance_id = %instance_id,
                        error = %reset_err,
                        "[terminator] could not set ERROR state"
                    );
                }
                Err(HandoffError::Termination(format!("{}: {:#}", instance_id, err)))
            }
        }
    }
}
