use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use cloudlet_common::records::{METADATA_KEY_HANDOFF_INFO, METADATA_KEY_OVERLAY_URL};
use cloudlet_common::{CreateServerRequest, DestinationUrl, HandoffError, ServerRecord};
use cloudlet_providers::ComputeCluster;

use crate::error::ClassifyError;
use crate::port_forward::{ForwardHandle, ForwardSupervisor};

/// Reply section sent back when no relay could be set up.
pub const PORT_FORWARD_ERROR: &str = "cannot setup port forwarding";

#[derive(Debug, Clone)]
pub struct ReceiveReply {
    pub server: ServerRecord,
    pub handoff: Option<Value>,
    pub synthesis: Option<Value>,
    pub relay: Option<ForwardHandle>,
}

impl ReceiveReply {
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("server".to_string(), self.server.to_value());
        if let Some(handoff) = &self.handoff {
            body.insert("handoff".to_string(), handoff.clone());
        }
        if let Some(synthesis) = &self.synthesis {
            body.insert("synthesis".to_string(), synthesis.clone());
        }
        Value::Object(body)
    }
}

/// Destination side of a handoff: creates the placeholder and opens a relay from a
/// gateway port to wherever the scheduler put it.
#[derive(Clone)]
pub struct HandoffReceiver {
    cluster: Arc<dyn ComputeCluster>,
    relays: Arc<ForwardSupervisor>,
    recv_port: u16,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl HandoffReceiver {
    pub fn new(
        cluster: Arc<dyn ComputeCluster>,
        relays: Arc<ForwardSupervisor>,
        recv_port: u16,
        poll_attempts: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            cluster,
            relays,
            recv_port,
            poll_attempts,
            poll_interval,
        }
    }

    pub async fn create_server(&self, request: &CreateServerRequest) -> Result<ReceiveReply, HandoffError> {
        let created = self
            .cluster
            .create_instance(request)
            .await
            .classify(HandoffError::Transfer)?;
        let mut reply = ReceiveReply {
            server: created.server,
            handoff: created.handoff,
            synthesis: created.synthesis,
            relay: None,
        };

        let receiving = request.metadata.contains_key(METADATA_KEY_HANDOFF_INFO);
        let synthesizing = request.metadata.contains_key(METADATA_KEY_OVERLAY_URL);

        if receiving {
            match self.open_relay(&reply.server).await {
                Ok((server_ip, handle)) => {
                    reply.handoff = Some(json!({
                        "server_ip": server_ip,
                        "server_port": handle.port,
                    }));
                    reply.relay = Some(handle);
                }
                Err(reason) => {
                    tracing::warn!(server_id = %reply.server.id, "[receiver] {}", reason);
                    reply.handoff = Some(json!({ "error": PORT_FORWARD_ERROR }));
                }
            }
        } else if synthesizing {
            reply.synthesis = Some(json!({ "return": "success" }));
        }
        Ok(reply)
    }

    /// Polls until the scheduler assigns a host, bounded by `poll_attempts`.
    pub async fn wait_for_host(&self, server_id: &str) -> Option<String> {
        for attempt in 0..self.poll_attempts {
            match self.cluster.get_instance(server_id).await {
                Ok(Some(server)) => {
                    if let Some(host) = server.host {
                        return Some(host);
                    }
                }
                Ok(None) => return None,
                Err(err) => {
                    tracing::warn!(server_id = %server_id, error = %err, "[receiver] lookup failed while waiting for scheduling");
                }
            }
            tracing::debug!(
                "[receiver] waiting for VM scheduling {}/{}...",
                attempt + 1,
                self.poll_attempts
            );
            tokio::time::sleep(self.poll_interval).await;
        }
        None
    }

    async fn open_relay(&self, server: &ServerRecord) -> Result<(String, ForwardHandle), String> {
        let hostname = self
            .wait_for_host(&server.id)
            .await
            .ok_or_else(|| format!("{} was not scheduled after {} polls", server.id, self.poll_attempts))?;

        let nodes = self
            .cluster
            .list_compute_nodes()
            .await
            .map_err(|e| format!("cannot list compute nodes: {:#}", e))?;
        let host_ip = nodes
            .into_iter()
            .find(|node| node.hypervisor_hostname == hostname)
            .and_then(|node| node.host_ip)
            .ok_or_else(|| format!("no address known for compute node {}", hostname))?;

        let server_ip = server
            .self_link()
            .and_then(advertised_host)
            .ok_or_else(|| format!("{} has no usable self link", server.id))?;

        let handle = self
            .relays
            .spawn(&host_ip, self.recv_port)
            .await
            .map_err(|e| format!("cannot bind relay: {}", e))?;
        self.relays.advertise(&server_ip, &handle);
        tracing::info!(
            server_id = %server.id,
            "[receiver] handoff stream for {} goes {}:{} -> {}:{}",
            hostname,
            server_ip,
            handle.port,
            host_ip,
            self.recv_port
        );
        Ok((server_ip, handle))
    }
}

/// Host part of a link like `http://10.0.0.5:8774/v2/servers/x`.
fn advertised_host(link: &str) -> Option<String> {
    let url = DestinationUrl::parse(link).ok()?;
    let authority = url.authority();
    let host = match authority.strip_prefix('[') {
        Some(rest) => rest.split(']').next()?,
        None => authority.split(':').next()?,
    };
    (!host.is_empty()).then(|| host.to_string())
}
