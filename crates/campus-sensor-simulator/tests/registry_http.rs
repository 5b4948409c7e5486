use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use campus_sensor_simulator::registry::{DeviceStatus, Protocol};
use campus_sensor_simulator::{DeviceRegistry, HttpRegistry, RegistryError};
use serde_json::json;
use std::time::Duration;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn registry(base: &str) -> HttpRegistry {
    HttpRegistry::new(format!("{}/api/devices", base), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn fetches_bare_array() {
    let base = serve(Router::new().route(
        "/api/devices",
        get(|| async {
            Json(json!([
                { "deviceId": "DeviceA", "type": "temperature", "protocol": "MQTT", "status": "active" },
                { "device_id": "gw-1", "type": "energy", "protocol": "HTTP", "status": "inactive" },
            ]))
        }),
    ))
    .await;

    let devices = registry(&base).fetch_devices().await.unwrap();

    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].device_id, "DeviceA");
    assert_eq!(devices[0].protocol, Protocol::Mqtt);
    assert!(devices[0].is_simulated());
    assert_eq!(devices[1].device_id, "gw-1");
    assert_eq!(devices[1].status, DeviceStatus::Inactive);
    assert!(!devices[1].is_simulated());
}

#[tokio::test]
async fn fetches_devices_envelope() {
    let base = serve(Router::new().route(
        "/api/devices",
        get(|| async {
            Json(json!({
                "devices": [{
                    "deviceId": "lab-01",
                    "type": "multi-sensor",
                    "protocol": "MQTT",
                    "metadata": { "sensors": ["Temperature", "humidity"] },
                }],
                "total": 1,
            }))
        }),
    ))
    .await;

    let devices = registry(&base).fetch_devices().await.unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].status, DeviceStatus::Active);
    assert_eq!(devices[0].sensor_kinds, vec!["temperature", "humidity"]);
}

#[tokio::test]
async fn server_error_is_reported() {
    let base = serve(Router::new().route(
        "/api/devices",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "database down") }),
    ))
    .await;

    match registry(&base).fetch_devices().await {
        Err(RegistryError::ServerError { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "database down");
        }
        other => panic!("expected server error, got {:?}", other),
    }
}

#[tokio::test]
async fn unexpected_body_is_malformed() {
    let base = serve(Router::new().route("/api/devices", get(|| async { Json(json!(42)) }))).await;

    assert!(matches!(
        registry(&base).fetch_devices().await,
        Err(RegistryError::Malformed(_))
    ));
}

#[tokio::test]
async fn unreachable_registry_is_http_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = registry(&format!("http://{}", addr)).fetch_devices().await;
    assert!(matches!(result, Err(RegistryError::HttpError(_))));
}
