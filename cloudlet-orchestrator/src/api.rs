// Thin HTTP controller over the handoff services.
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use cloudlet_common::actions::ServerAction;
use cloudlet_common::{CreateServerRequest, HandoffError, HandoffRequest};
use cloudlet_providers::ComputeCluster;

use crate::capture::CaptureService;
use crate::cluster_manager::ClusterHandles;
use crate::config::HandoffConfig;
use crate::coordinator::HandoffCoordinator;
use crate::error::ClassifyError;
use crate::instance_lock::InstanceLocks;
use crate::port_forward::ForwardSupervisor;
use crate::receiver::HandoffReceiver;
use crate::registry::BaseVmRegistry;
use crate::termination::SourceTerminator;
use crate::transfer::TransferDriver;

pub struct AppState {
    pub cluster: Arc<dyn ComputeCluster>,
    pub registry: BaseVmRegistry,
    pub coordinator: HandoffCoordinator,
    pub capture: CaptureService,
    pub receiver: HandoffReceiver,
}

impl AppState {
    pub fn new(
        cluster: Arc<dyn ComputeCluster>,
        registry: BaseVmRegistry,
        coordinator: HandoffCoordinator,
        capture: CaptureService,
        receiver: HandoffReceiver,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            registry,
            coordinator,
            capture,
            receiver,
        })
    }

    /// Wires every service around one local cluster, one lock table and one relay supervisor.
    pub fn assemble(
        config: &HandoffConfig,
        handles: ClusterHandles,
        driver: Arc<dyn TransferDriver>,
        relays: Arc<ForwardSupervisor>,
    ) -> Arc<Self> {
        let local = handles.local;
        let terminator = SourceTerminator::new(local.clone(), InstanceLocks::new());
        let registry = BaseVmRegistry::new(local.clone(), config.flavor_match_disk);
        let coordinator = HandoffCoordinator::new(
            local.clone(),
            registry.clone(),
            handles.connector,
            driver.clone(),
            terminator.clone(),
        )
        .with_relays(relays.clone())
        .with_flavor_auto_create(config.flavor_auto_create);
        let capture = CaptureService::new(local.clone(), registry.clone(), terminator, driver);
        let receiver = HandoffReceiver::new(
            local.clone(),
            relays,
            config.recv_port,
            config.schedule_poll_attempts,
            config.schedule_poll_interval,
        );
        Self::new(local, registry, coordinator, capture, receiver)
    }
}

/// `HandoffError` rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub HandoffError);

impl From<HandoffError> for ApiError {
    fn from(err: HandoffError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/servers", post(create_server))
        .route("/servers/{id}/action", post(server_action))
        .route("/servers/{id}/cloudlet-type", get(cloudlet_type))
        .route("/admin/handoffs", get(recent_handoffs))
        .with_state(state)
}

async fn root() -> &'static str {
    "cloudlet handoff orchestrator"
}

async fn server_action(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let action: ServerAction = serde_json::from_value(body)
        .map_err(|e| HandoffError::Validation(format!("Unsupported server action: {}", e)))?;
    tracing::info!(instance_id = %id, "[api] {}", action.as_str());

    let reply = match action {
        ServerAction::Handoff {
            handoff_url,
            dest_token,
            dest_vmname,
        } => {
            let request = HandoffRequest {
                source_instance_id: id,
                destination_url: handoff_url,
                destination_auth_token: dest_token,
                destination_vm_name: dest_vmname,
            };
            let outcome = state.coordinator.perform_handoff(&request).await?;
            json!(outcome)
        }
        ServerAction::CreateBase { name } => {
            let images = state.capture.create_base_vm(&id, &name).await?;
            json!(images)
        }
        ServerAction::FinishOverlay { overlay_name } => {
            let image = state.capture.create_overlay(&id, &overlay_name).await?;
            json!({ "overlay-id": image.id })
        }
    };
    Ok((StatusCode::ACCEPTED, Json(reply)))
}

async fn create_server(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request = CreateServerRequest::from_body(&body)?;
    let reply = state.receiver.create_server(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(reply.to_body())))
}

async fn cloudlet_type(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let instance = state
        .cluster
        .get_instance(&id)
        .await
        .classify(HandoffError::Resolution)?
        .ok_or_else(|| HandoffError::NotFound(format!("Instance {} could not be found", id)))?;
    let class = state.registry.classify(&instance).await;
    Ok(Json(json!({
        "cloudlet_type": class.as_str(),
        "handoff_eligible": BaseVmRegistry::is_handoff_eligible(class),
    })))
}

async fn recent_handoffs(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.coordinator.recent_handoffs()))
}
