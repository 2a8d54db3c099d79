mod common;

use common::{MockServer, refused_address};
use plant_link::{
    backend_client::HttpBackendClient,
    device_client::HttpDeviceTransport,
    services::provisioning::{
        ProvisioningConfig, ProvisioningError, ProvisioningOutcome, ProvisioningSession,
        ProvisioningStatus,
    },
    session::PersistedSession,
    storage::{JsonStore, SavedNetworks},
};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

type HttpSession = ProvisioningSession<
    HttpDeviceTransport,
    HttpBackendClient<PersistedSession>,
    PersistedSession,
>;

fn session(dir: &TempDir, device: &str, backend: &str, token: Option<&str>) -> HttpSession {
    let store = JsonStore::new(dir.path()).expect("failed to create store");
    let tokens = PersistedSession::new(store.clone());
    if let Some(token) = token {
        tokens.store_token(token).expect("failed to store token");
    }

    let config = ProvisioningConfig {
        device_address: device.to_string(),
        device_id: "plant-sensor-001".to_string(),
        request_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(200),
        poll_attempts: 5,
    };

    ProvisioningSession::new(
        config,
        HttpDeviceTransport::new(Duration::from_secs(2)).expect("failed to create transport"),
        HttpBackendClient::new(backend, Duration::from_secs(2), tokens.clone())
            .expect("failed to create backend client"),
        tokens,
        Arc::new(SavedNetworks::new(store)),
    )
}

/// A device that reports having joined the network at its own address
async fn joining_device() -> MockServer {
    MockServer::with_responder(|request| {
        if request.target == "/connection_status" {
            let host = request.header("host").unwrap_or_default();
            (200, format!(r#"{{"connected":true,"ip":"{host}"}}"#))
        } else {
            (200, "OK".to_string())
        }
    })
    .await
}

#[tokio::test]
async fn device_is_provisioned_and_receives_token_twice() {
    let dir = TempDir::new().expect("failed to create temp directory");
    let device = joining_device().await;
    let backend = MockServer::with_responder(|_| (503, String::new())).await;
    let session = session(&dir, &device.address, &backend.url(), Some("bearer-123"));

    assert!(session.begin().await);
    assert_eq!(session.status(), ProvisioningStatus::Connecting);

    let outcome = session
        .submit_credentials("HomeNet", "secret")
        .await
        .expect("failed to provision device");

    assert_eq!(
        outcome,
        ProvisioningOutcome::Confirmed {
            ip: device.address.clone(),
            token_delivered: true,
        }
    );

    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, ProvisioningStatus::Success);
    assert!(snapshot.confirmed);
    assert_eq!(snapshot.ssid.as_deref(), Some("HomeNet"));

    let requests = device.requests();
    let wifi = requests.iter().filter(|r| r.target.starts_with("/set_wifi")).count();
    let token = requests.iter().filter(|r| r.target.starts_with("/set_token")).count();
    assert_eq!(wifi, 4);
    assert_eq!(token, 8);
}

#[tokio::test]
async fn silent_device_ends_unconfirmed() {
    let dir = TempDir::new().expect("failed to create temp directory");
    let device = refused_address().await;
    let backend = refused_address().await;
    let session = session(&dir, &device, &format!("http://{backend}"), Some("bearer-123"));

    assert!(!session.begin().await);
    assert_eq!(session.status(), ProvisioningStatus::Idle);

    let outcome = session
        .submit_credentials("HomeNet", "secret")
        .await
        .expect("failed to run provisioning");

    assert_eq!(outcome, ProvisioningOutcome::Unconfirmed);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, ProvisioningStatus::Success);
    assert!(!snapshot.confirmed);
}

#[tokio::test]
async fn missing_login_stops_before_contacting_device() {
    let dir = TempDir::new().expect("failed to create temp directory");
    let device = joining_device().await;
    let session = session(&dir, &device.address, &device.url(), None);

    let result = session.submit_credentials("HomeNet", "secret").await;

    assert_eq!(result, Err(ProvisioningError::AuthTokenUnavailable));
    assert_eq!(session.status(), ProvisioningStatus::Error);
    assert!(device.requests().is_empty());

    assert!(session.retry());
    assert_eq!(session.status(), ProvisioningStatus::Idle);
}

#[tokio::test]
async fn submitted_network_is_remembered() {
    let dir = TempDir::new().expect("failed to create temp directory");
    let device = joining_device().await;
    let session = session(&dir, &device.address, &device.url(), Some("bearer-123"));

    session
        .submit_credentials("Garden", "secret")
        .await
        .expect("failed to provision device");

    let store = JsonStore::new(dir.path()).expect("failed to open store");
    let networks = SavedNetworks::new(store)
        .list()
        .expect("failed to list networks");
    assert_eq!(networks, vec!["Garden"]);
}
