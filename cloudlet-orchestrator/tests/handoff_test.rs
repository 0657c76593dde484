// Handoff coordinator against in-memory clusters.

mod common;

use std::sync::Arc;

use cloudlet_common::records::{METADATA_KEY_HANDOFF_INFO, METADATA_KEY_OVERLAY_URL};
use cloudlet_common::{CloudletType, HandoffError, HandoffRequest, ResourceShape, TaskState};
use cloudlet_orchestrator::state_machine::HandoffState;
use cloudlet_providers::mock::{MockCluster, MockConnector};
use common::*;

fn remote_request() -> HandoffRequest {
    HandoffRequest {
        source_instance_id: SOURCE_ID.to_string(),
        destination_url: Some(DEST_URL.to_string()),
        destination_auth_token: Some(DEST_TOKEN.to_string()),
        destination_vm_name: None,
    }
}

fn request_to(url: Option<&str>) -> HandoffRequest {
    HandoffRequest {
        source_instance_id: SOURCE_ID.to_string(),
        destination_url: url.map(str::to_string),
        destination_auth_token: None,
        destination_vm_name: None,
    }
}

#[tokio::test]
async fn remote_handoff_echoes_destination_url() {
    let local = Arc::new(source_cluster());
    let destination = Arc::new(destination_cluster());
    let driver = RecordingDriver::new();
    let coordinator = coordinator(local.clone(), connector_for(destination.clone()), driver.clone());

    let outcome = coordinator.perform_handoff(&remote_request()).await.unwrap();
    assert_eq!(outcome.handoff, DEST_URL);

    // Placeholder is created from the matched base image and flavor.
    assert_eq!(destination.calls(), vec!["create_instance:vm-handoff".to_string()]);
    let placeholder = destination
        .servers()
        .into_iter()
        .find(|s| s.name == "vm-handoff")
        .unwrap();
    assert_eq!(placeholder.image_id.as_deref(), Some("img-dest-base"));
    assert_eq!(placeholder.flavor_id.as_deref(), Some("flv-medium"));
    assert_eq!(
        placeholder.metadata.get(METADATA_KEY_HANDOFF_INFO).map(String::as_str),
        Some("vm-handoff")
    );

    assert_eq!(
        driver.calls(),
        vec![format!("transfer:{}:tcp://10.0.0.5:40122", SOURCE_ID)]
    );
    assert_eq!(
        local.calls(),
        vec![
            format!("set_task_state:{}:migrating", SOURCE_ID),
            format!("set_task_state:{}:image_snapshot", SOURCE_ID),
            format!("delete_instance:{}", SOURCE_ID),
        ]
    );
    assert!(local.server(SOURCE_ID).is_none());

    let journal = &coordinator.recent_handoffs()[0];
    assert_eq!(
        journal.path(),
        vec![
            HandoffState::Validating,
            HandoffState::ResolvingDestination,
            HandoffState::Provisioning,
            HandoffState::AwaitingTransfer,
            HandoffState::Finalizing,
            HandoffState::Done,
        ]
    );
}

#[tokio::test]
async fn chained_handoff_forwards_overlay_url() {
    let local = Arc::new(source_cluster());
    let destination = Arc::new(destination_cluster());
    let coordinator = coordinator(local, connector_for(destination.clone()), RecordingDriver::new());

    let mut request = remote_request();
    request.destination_vm_name = Some("moved-vm".to_string());
    coordinator.perform_handoff(&request).await.unwrap();

    let placeholder = destination
        .servers()
        .into_iter()
        .find(|s| s.name == "moved-vm")
        .unwrap();
    assert_eq!(placeholder.handoff_info(), Some("moved-vm"));
    assert_eq!(
        placeholder.metadata.get(METADATA_KEY_OVERLAY_URL).map(String::as_str),
        Some(OVERLAY_URL)
    );
}

#[tokio::test]
async fn missing_base_at_destination_leaves_source_untouched() {
    let local = Arc::new(source_cluster());
    let destination = Arc::new(
        MockCluster::new(DEST_AUTHORITY)
            .with_image(plain_image("img-other"))
            .with_flavor(flavor("flv-medium", 2, 4096, 40))
            .with_handoff_endpoint("10.0.0.5", 40122),
    );
    let driver = RecordingDriver::new();
    let coordinator = coordinator(local.clone(), connector_for(destination.clone()), driver.clone());

    let err = coordinator.perform_handoff(&remote_request()).await.unwrap_err();
    assert!(matches!(err, HandoffError::Resolution(_)));
    assert!(err.to_string().starts_with("Cannot find matching Base VM"));
    assert!(err.to_string().contains(DEST_AUTHORITY));
    assert!(err.is_side_effect_free());

    // Claimed, then released.
    assert_eq!(
        local.calls(),
        vec![
            format!("set_task_state:{}:migrating", SOURCE_ID),
            format!("set_task_state:{}:none", SOURCE_ID),
        ]
    );
    assert!(destination.calls().is_empty());
    assert!(driver.calls().is_empty());
    let source = local.server(SOURCE_ID).unwrap();
    assert_eq!(source.task_state, None);

    let journal = &coordinator.recent_handoffs()[0];
    assert_eq!(journal.current, HandoffState::Failed);
    assert_eq!(
        journal.path(),
        vec![
            HandoffState::Validating,
            HandoffState::ResolvingDestination,
            HandoffState::Failed,
        ]
    );
}

#[tokio::test]
async fn file_scheme_exports_residue_image() {
    let local = Arc::new(source_cluster());
    let driver = RecordingDriver::new();
    let coordinator = coordinator(local.clone(), Arc::new(MockConnector::new()), driver.clone());

    let outcome = coordinator
        .perform_handoff(&request_to(Some("file:///my-residue")))
        .await
        .unwrap();

    let residue = local
        .images()
        .into_iter()
        .find(|i| i.name == "my-residue")
        .unwrap();
    assert_eq!(outcome.handoff, residue.id);
    assert_eq!(residue.properties.cloudlet_type, Some(CloudletType::Overlay));
    assert_eq!(residue.properties.base_fingerprint, Some(base_fingerprint()));

    assert_eq!(
        driver.calls(),
        vec![format!("transfer:{}:file:///my-residue", SOURCE_ID)]
    );
    // Snapshot mark precedes deletion.
    assert_eq!(
        local.calls(),
        vec![
            format!("set_task_state:{}:migrating", SOURCE_ID),
            "create_image:my-residue".to_string(),
            format!("set_task_state:{}:image_snapshot", SOURCE_ID),
            format!("delete_instance:{}", SOURCE_ID),
        ]
    );
}

#[tokio::test]
async fn missing_url_is_rejected_without_any_call() {
    let local = Arc::new(source_cluster());
    let destination = Arc::new(destination_cluster());
    let connector = connector_for(destination.clone());
    let driver = RecordingDriver::new();
    let coordinator = coordinator(local.clone(), connector.clone(), driver.clone());

    for url in [None, Some(""), Some("ftp://host/path"), Some("http:///v2")] {
        let err = coordinator.perform_handoff(&request_to(url)).await.unwrap_err();
        assert!(matches!(err, HandoffError::Validation(_)), "{:?}", url);
        assert_eq!(err.status_code(), 400);
    }
    // Remote scheme without a token.
    let err = coordinator
        .perform_handoff(&request_to(Some(DEST_URL)))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    assert!(connector.attempts().is_empty());
    assert!(local.calls().is_empty());
    assert!(destination.calls().is_empty());
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn rejected_token_is_an_authentication_error() {
    let local = Arc::new(source_cluster());
    let destination = Arc::new(destination_cluster());
    let connector = connector_for(destination.clone());
    let coordinator = coordinator(local.clone(), connector.clone(), RecordingDriver::new());

    let mut request = remote_request();
    request.destination_auth_token = Some("wrong".to_string());
    let err = coordinator.perform_handoff(&request).await.unwrap_err();

    assert!(matches!(err, HandoffError::Authentication(_)));
    assert_eq!(err.status_code(), 401);
    assert_eq!(connector.attempts(), vec![DEST_AUTHORITY.to_string()]);
    assert!(destination.calls().is_empty());
    assert!(local.server(SOURCE_ID).is_some());
}

#[tokio::test]
async fn missing_descriptor_aborts_before_teardown() {
    let local = Arc::new(source_cluster());
    let destination = Arc::new(
        MockCluster::new(DEST_AUTHORITY)
            .with_image(base_image("img-dest-base", &base_fingerprint()))
            .with_flavor(flavor("flv-medium", 2, 4096, 40)),
    );
    let driver = RecordingDriver::new();
    let coordinator = coordinator(local.clone(), connector_for(destination.clone()), driver.clone());

    let err = coordinator.perform_handoff(&remote_request()).await.unwrap_err();
    assert_eq!(
        err,
        HandoffError::Transfer("Cannot get handoff URL from the destination message".into())
    );
    assert!(!err.is_side_effect_free());

    // The placeholder stays behind at the destination; the source is untouched.
    assert_eq!(destination.servers().len(), 1);
    assert!(driver.calls().is_empty());
    let source = local.server(SOURCE_ID).unwrap();
    assert_eq!(source.task_state, None);
}

#[tokio::test]
async fn destination_relay_error_is_a_transfer_error() {
    let local = Arc::new(source_cluster());
    let destination = Arc::new(
        MockCluster::new(DEST_AUTHORITY)
            .with_image(base_image("img-dest-base", &base_fingerprint()))
            .with_flavor(flavor("flv-medium", 2, 4096, 40))
            .with_handoff_reply(serde_json::json!({ "error": "cannot setup port forwarding" })),
    );
    let coordinator = coordinator(local.clone(), connector_for(destination), RecordingDriver::new());

    let err = coordinator.perform_handoff(&remote_request()).await.unwrap_err();
    assert!(matches!(err, HandoffError::Transfer(_)));
    assert!(err.to_string().contains("cannot setup port forwarding"));
    assert!(local.server(SOURCE_ID).is_some());
}

#[tokio::test]
async fn flavor_is_created_only_when_enabled() {
    let no_flavor = || {
        Arc::new(
            MockCluster::new(DEST_AUTHORITY)
                .with_image(base_image("img-dest-base", &base_fingerprint()))
                .with_flavor(flavor("flv-small", 1, 2048, 20))
                .with_handoff_endpoint("10.0.0.5", 40122),
        )
    };

    let destination = no_flavor();
    let strict = coordinator(
        Arc::new(source_cluster()),
        connector_for(destination.clone()),
        RecordingDriver::new(),
    );
    let err = strict.perform_handoff(&remote_request()).await.unwrap_err();
    assert!(err.to_string().starts_with("Cannot find matching flavor with cpu=2, memory=4096"));
    assert_eq!(destination.flavors().len(), 1);

    let destination = no_flavor();
    let relaxed = coordinator(
        Arc::new(source_cluster()),
        connector_for(destination.clone()),
        RecordingDriver::new(),
    )
    .with_flavor_auto_create(true);
    relaxed.perform_handoff(&remote_request()).await.unwrap();

    let created = destination
        .flavors()
        .into_iter()
        .find(|f| f.name == "cloudlet-flavor-ubuntu")
        .unwrap();
    assert_eq!((created.vcpus, created.ram_mb), (2, 4096));
    let placeholder = &destination.servers()[0];
    assert_eq!(placeholder.flavor_id.as_deref(), Some(created.id.as_str()));
}

#[tokio::test]
async fn busy_or_missing_source_is_refused() {
    let mut busy = overlay_server(SOURCE_ID);
    busy.task_state = Some(TaskState::Migrating);
    let local = Arc::new(
        MockCluster::new("local")
            .with_image(base_image("img-base", &base_fingerprint()))
            .with_server(busy),
    );
    let destination = Arc::new(destination_cluster());
    let coordinator = coordinator(local.clone(), connector_for(destination.clone()), RecordingDriver::new());

    let err = coordinator.perform_handoff(&remote_request()).await.unwrap_err();
    assert!(matches!(err, HandoffError::Conflict(_)));
    assert_eq!(err.status_code(), 409);

    let mut request = remote_request();
    request.source_instance_id = "vm-missing".to_string();
    let err = coordinator.perform_handoff(&request).await.unwrap_err();
    assert!(matches!(err, HandoffError::NotFound(_)));
    assert_eq!(err.status_code(), 404);

    assert!(destination.calls().is_empty());
}

#[tokio::test]
async fn failed_delete_puts_source_in_error() {
    let local = Arc::new(source_cluster().fail_deletes_with("hypervisor unreachable"));
    let destination = Arc::new(destination_cluster());
    let coordinator = coordinator(local.clone(), connector_for(destination), RecordingDriver::new());

    let err = coordinator.perform_handoff(&remote_request()).await.unwrap_err();
    assert!(matches!(err, HandoffError::Termination(_)));
    assert!(local
        .calls()
        .contains(&format!("set_vm_state:{}:error", SOURCE_ID)));
    assert_eq!(
        coordinator.recent_handoffs()[0].current,
        HandoffState::Failed
    );
}

#[tokio::test]
async fn tcp_target_streams_directly() {
    let local = Arc::new(source_cluster());
    let driver = RecordingDriver::new();
    let coordinator = coordinator(local.clone(), Arc::new(MockConnector::new()), driver.clone());

    let outcome = coordinator
        .perform_handoff(&request_to(Some("tcp://192.168.1.20:8022")))
        .await
        .unwrap();
    assert_eq!(outcome.handoff, "tcp://192.168.1.20:8022");
    assert_eq!(
        driver.calls(),
        vec![format!("transfer:{}:tcp://192.168.1.20:8022", SOURCE_ID)]
    );
    assert!(local.server(SOURCE_ID).is_none());
    assert_eq!(
        coordinator.recent_handoffs()[0].path(),
        vec![
            HandoffState::Validating,
            HandoffState::AwaitingTransfer,
            HandoffState::Finalizing,
            HandoffState::Done,
        ]
    );
}

#[tokio::test]
async fn driver_failure_keeps_source_alive() {
    let local = Arc::new(source_cluster());
    let destination = Arc::new(destination_cluster());
    let coordinator = coordinator(
        local.clone(),
        connector_for(destination.clone()),
        RecordingDriver::failing("stream reset by peer"),
    );

    let err = coordinator.perform_handoff(&remote_request()).await.unwrap_err();
    assert_eq!(err, HandoffError::Transfer("stream reset by peer".into()));
    assert_eq!(local.server(SOURCE_ID).unwrap().task_state, None);
    assert_eq!(destination.servers().len(), 1);
}

#[tokio::test]
async fn claimed_source_refuses_a_second_handoff() {
    let local = Arc::new(source_cluster().reject_task_state());
    let destination = Arc::new(destination_cluster());
    let connector = connector_for(destination.clone());
    let driver = RecordingDriver::new();
    let coordinator = coordinator(local.clone(), connector.clone(), driver.clone());

    let err = coordinator.perform_handoff(&remote_request()).await.unwrap_err();
    assert!(matches!(err, HandoffError::Conflict(_)));
    assert_eq!(err.status_code(), 409);

    assert!(connector.attempts().is_empty());
    assert!(destination.calls().is_empty());
    assert!(driver.calls().is_empty());
    assert!(local.server(SOURCE_ID).is_some());
    assert_eq!(
        coordinator.recent_handoffs()[0].path(),
        vec![HandoffState::Validating, HandoffState::Failed]
    );
}

#[tokio::test]
async fn released_claim_allows_a_retry() {
    let local = Arc::new(source_cluster());
    let coordinator = coordinator(
        local.clone(),
        Arc::new(MockConnector::new()),
        RecordingDriver::failing("stream reset by peer"),
    );
    let request = request_to(Some("tcp://192.168.1.20:8022"));
    coordinator.perform_handoff(&request).await.unwrap_err();

    let retry = common::coordinator(local.clone(), Arc::new(MockConnector::new()), RecordingDriver::new());
    retry.perform_handoff(&request).await.unwrap();
    assert!(local.server(SOURCE_ID).is_none());
}

#[tokio::test]
async fn larger_running_flavor_is_matched_at_destination() {
    let mut source = overlay_server(SOURCE_ID);
    source.shape = Some(ResourceShape::new(4, 8192).with_disk(20));
    let local = Arc::new(
        MockCluster::new("local")
            .with_image(base_image("img-base", &base_fingerprint()))
            .with_server(source),
    );
    let destination = Arc::new(destination_cluster().with_flavor(flavor("flv-large", 4, 8192, 80)));
    let coordinator = coordinator(local, connector_for(destination.clone()), RecordingDriver::new());

    coordinator.perform_handoff(&remote_request()).await.unwrap();
    let placeholder = &destination.servers()[0];
    assert_eq!(placeholder.flavor_id.as_deref(), Some("flv-large"));
}
