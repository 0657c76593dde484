use anyhow::{anyhow, Result};
use std::sync::Arc;

use cloudlet_providers::{ComputeCluster, DestinationConnector};

use crate::config::HandoffConfig;

/// The local cluster plus the connector used to reach handoff destinations.
#[derive(Clone)]
pub struct ClusterHandles {
    pub local: Arc<dyn ComputeCluster>,
    pub connector: Arc<dyn DestinationConnector>,
}

pub struct ClusterManager;

impl ClusterManager {
    /// Builds the handles for `config.cluster_provider`. Only adapters compiled in are available.
    pub async fn connect(config: &HandoffConfig) -> Result<ClusterHandles> {
        match config.cluster_provider.as_str() {
            #[cfg(feature = "provider-openstack")]
            "openstack" => {
                use cloudlet_providers::openstack::{self, OpenStackConnector, RemoteSessionClient};

                let creds = config
                    .credentials
                    .as_ref()
                    .ok_or_else(|| anyhow!("OS_AUTH_URL, OS_USERNAME, OS_PASSWORD and OS_TENANT_NAME are required"))?;
                let session =
                    openstack::authenticate(&creds.auth_url, &creds.username, &creds.password, &creds.tenant_name)
                        .await?;
                let client = RemoteSessionClient::from_session(&session)?;
                tracing::info!(
                    "[cluster] connected to {} as {}/{}",
                    client.endpoint(),
                    creds.tenant_name,
                    creds.username
                );
                Ok(ClusterHandles {
                    local: Arc::new(client),
                    connector: Arc::new(OpenStackConnector),
                })
            }
            #[cfg(feature = "provider-mock")]
            "mock" => {
                use cloudlet_providers::mock::{MockCluster, MockConnector};

                tracing::warn!("[cluster] using in-memory mock cluster");
                let local = MockCluster::new("local").with_compute_node("compute-0", Some("127.0.0.1"));
                Ok(ClusterHandles {
                    local: Arc::new(local),
                    connector: Arc::new(MockConnector::new()),
                })
            }
            other => Err(anyhow!("Unsupported CLUSTER_PROVIDER '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let config = HandoffConfig::from_lookup(|k| (k == "CLUSTER_PROVIDER").then(|| "vmware".to_string()));
        let err = ClusterManager::connect(&config).await.err().unwrap();
        assert!(err.to_string().contains("vmware"));
    }

    #[cfg(feature = "provider-openstack")]
    #[tokio::test]
    async fn openstack_needs_credentials() {
        let config = HandoffConfig::default();
        assert!(ClusterManager::connect(&config).await.is_err());
    }
}
