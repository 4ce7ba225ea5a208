//! Configuration file to delivered message, through the controller
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{future, sync::Arc};

use courier::{Controller, CourierConfig};
use courier_common::{Message, Signal};
use courier_dispatch::{HealthState, SendFailure};
use support::CannedEndpoint;

fn write_config(dir: &tempfile::TempDir, primary: &str, backup: &str) -> std::path::PathBuf {
    let path = dir.path().join("courier.config.ron");
    let content = format!(
        r#"(
    dispatch: (
        providers: [
            (
                name: "primary",
                transport: HttpApi(endpoint: "{primary}", api_key: "key-1"),
                rate_limits: (per_minute: 100),
                timeout_secs: 5,
            ),
            (
                name: "backup",
                transport: HttpApi(endpoint: "{backup}"),
                priority_tier: 2,
                timeout_secs: 5,
            ),
        ],
    ),
    metrics: (tick_interval_secs: 1),
)"#
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn test_fallback_through_configured_providers() {
    let primary = CannedEndpoint::start(500, r#"{"error":"internal"}"#).await;
    let backup = CannedEndpoint::start(202, r#"{"id":"backup-42"}"#).await;

    let dir = tempfile::tempdir().unwrap();
    let config = CourierConfig::load(&write_config(&dir, &primary.endpoint(), &backup.endpoint()))
        .unwrap();

    let controller = Controller::new(&config).unwrap();
    let service = Arc::clone(controller.service());
    let shutdown = controller.shutdown_handle();
    let mut signals = controller.subscribe();
    let running = tokio::spawn(controller.run_until(future::pending()));

    let message = Message::new(
        "noreply@example.com",
        ["user@example.org"],
        "Welcome",
        "Hello there",
    );
    let result = service.send(&message).await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.provider.as_deref(), Some("backup"));
    assert_eq!(result.transport_message_id.as_deref(), Some("backup-42"));
    assert_eq!(result.attempts.len(), 2);
    assert_eq!(primary.hits(), 1);
    assert_eq!(backup.hits(), 1);

    let status = service.provider_status();
    let primary_status = status
        .providers
        .iter()
        .find(|p| p.name == "primary")
        .unwrap();
    assert_eq!(primary_status.health_score, 80);
    assert_eq!(primary_status.state, HealthState::Healthy);

    let metrics = service.metrics_text().unwrap();
    assert!(metrics.contains("courier_messages_sent_total"));

    shutdown.send(Signal::Shutdown).unwrap();
    running.await.unwrap().unwrap();

    assert_eq!(signals.recv().await.unwrap(), Signal::Shutdown);
    assert_eq!(signals.recv().await.unwrap(), Signal::Finalised);
}

#[tokio::test]
async fn test_every_provider_rejecting() {
    let primary = CannedEndpoint::start(503, "{}").await;
    let backup = CannedEndpoint::start(401, "{}").await;

    let dir = tempfile::tempdir().unwrap();
    let config = CourierConfig::load(&write_config(&dir, &primary.endpoint(), &backup.endpoint()))
        .unwrap();
    let controller = Controller::new(&config).unwrap();

    let message = Message::new("a@example.com", ["b@example.org"], "s", "t");
    let result = controller.service().send(&message).await;

    assert!(!result.success);
    assert_eq!(result.failure, Some(SendFailure::AllProvidersRejected));
    assert_eq!(result.attempts.len(), 2);
}

#[tokio::test]
async fn test_invalid_configuration_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("courier.config.ron");
    std::fs::write(
        &path,
        r#"(dispatch: (providers: [(name: "x", transport: HttpApi(endpoint: ""))]))"#,
    )
    .unwrap();

    assert!(CourierConfig::load(&path).is_err());

    let config = CourierConfig::parse(
        r#"(dispatch: (providers: [(name: "x", transport: HttpApi(endpoint: ""))]))"#,
    )
    .unwrap();
    assert!(Controller::new(&config).is_err());
}
