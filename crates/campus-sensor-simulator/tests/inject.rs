use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use campus_sensor_simulator::config::InjectConfig;
use campus_sensor_simulator::inject::{InjectError, InjectStats, TelemetryInjector, TelemetryRecord};
use campus_sensor_simulator::SensorKind;
use chrono::{TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Telemetry endpoint that rejects the first `fail_first` posts.
struct Sink {
    fail_first: usize,
    hits: AtomicUsize,
    received: Mutex<Vec<Value>>,
}

async fn record(State(sink): State<Arc<Sink>>, Json(body): Json<Value>) -> StatusCode {
    let hit = sink.hits.fetch_add(1, Ordering::SeqCst);
    if hit < sink.fail_first {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    sink.received.lock().unwrap().push(body);
    StatusCode::CREATED
}

async fn serve(fail_first: usize) -> (String, Arc<Sink>) {
    let sink = Arc::new(Sink {
        fail_first,
        hits: AtomicUsize::new(0),
        received: Mutex::new(Vec::new()),
    });
    let router = Router::new()
        .route("/api/telemetry", post(record))
        .with_state(Arc::clone(&sink));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{}/api/telemetry", addr), sink)
}

fn injector(url: String, max_retries: u32) -> TelemetryInjector {
    let config = InjectConfig {
        telemetry_url: url,
        timeout_secs: 2,
        max_retries,
        retry_delay_ms: 1,
        pacing_ms: 0,
        follow_interval_secs: 30,
    };
    TelemetryInjector::new(config, Arc::new(InjectStats::new())).unwrap()
}

fn sample_record() -> TelemetryRecord {
    let mut rng = StdRng::seed_from_u64(9);
    let at = Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap();
    TelemetryRecord::generate("lab-01", SensorKind::Temperature, at, &mut rng)
}

#[tokio::test]
async fn post_retries_until_accepted() {
    let (url, sink) = serve(2).await;
    let injector = injector(url, 3);

    injector.post(&sample_record()).await.unwrap();

    let stats = injector.stats();
    assert_eq!(stats.retries.load(Ordering::Relaxed), 2);
    assert_eq!(stats.records_posted.load(Ordering::Relaxed), 1);
    assert_eq!(stats.errors.load(Ordering::Relaxed), 0);

    let received = sink.received.lock().unwrap();
    assert_eq!(received[0]["deviceId"], "lab-01");
    assert_eq!(received[0]["metric"], "temperature");
    assert_eq!(received[0]["unit"], "celsius");
}

#[tokio::test]
async fn post_gives_up_after_max_retries() {
    let (url, sink) = serve(usize::MAX).await;
    let injector = injector(url, 1);

    match injector.post(&sample_record()).await {
        Err(InjectError::ServerError { status, .. }) => assert_eq!(status, 503),
        other => panic!("expected server error, got {:?}", other),
    }

    assert_eq!(sink.hits.load(Ordering::SeqCst), 2);
    assert_eq!(injector.stats().errors.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn backfill_spaces_readings_up_to_end() {
    let (url, sink) = serve(0).await;
    let injector = injector(url, 0);
    let end = Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap();
    let mut rng = StdRng::seed_from_u64(4);

    let posted = injector
        .backfill(
            "aula-201",
            SensorKind::Light,
            4,
            Duration::from_secs(300),
            end,
            &mut rng,
        )
        .await
        .unwrap();

    assert_eq!(posted, 4);
    let received = sink.received.lock().unwrap();
    let timestamps: Vec<&str> = received
        .iter()
        .map(|r| r["timestamp"].as_str().unwrap())
        .collect();
    assert_eq!(
        timestamps,
        vec![
            "2024-05-06T11:45:00Z",
            "2024-05-06T11:50:00Z",
            "2024-05-06T11:55:00Z",
            "2024-05-06T12:00:00Z",
        ]
    );
    assert!(received.iter().all(|r| r["metric"] == "illumination"));
}

#[tokio::test]
async fn backfill_counts_only_accepted_posts() {
    let (url, _sink) = serve(1).await;
    let injector = injector(url, 0);
    let mut rng = StdRng::seed_from_u64(4);

    let posted = injector
        .backfill(
            "lab-01",
            SensorKind::Humidity,
            3,
            Duration::from_secs(60),
            Utc::now(),
            &mut rng,
        )
        .await
        .unwrap();

    assert_eq!(posted, 2);
    assert_eq!(injector.stats().errors.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn backfill_past_date_range_is_rejected_without_posting() {
    let (url, sink) = serve(0).await;
    let injector = injector(url, 0);
    let mut rng = StdRng::seed_from_u64(4);

    let result = injector
        .backfill(
            "lab-01",
            SensorKind::Temperature,
            2,
            Duration::from_secs(10_000_000_000_000),
            Utc::now(),
            &mut rng,
        )
        .await;

    assert!(matches!(result, Err(InjectError::ScheduleOutOfRange { .. })));
    assert_eq!(sink.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn follow_posts_current_readings_until_cancelled() {
    let (url, sink) = serve(0).await;
    let injector = injector(url, 0);
    let cancel = CancellationToken::new();

    let started = Utc::now();
    let task = tokio::spawn({
        let injector = injector.clone();
        let cancel = cancel.clone();
        async move {
            let mut rng = StdRng::seed_from_u64(8);
            injector
                .follow(
                    "aula-201",
                    SensorKind::Occupancy,
                    Duration::from_millis(20),
                    &mut rng,
                    cancel,
                )
                .await
        }
    });

    for _ in 0..200 {
        if sink.received.lock().unwrap().len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    let posted = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("follow did not stop")
        .unwrap();

    let received = sink.received.lock().unwrap();
    assert!(posted >= 3);
    assert_eq!(posted as usize, received.len());

    let floor = started.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    for body in received.iter() {
        assert_eq!(body["deviceId"], "aula-201");
        assert_eq!(body["metric"], "occupancy");
        assert_eq!(body["unit"], "persons");
        assert!(body["timestamp"].as_str().unwrap() >= floor.as_str());
    }
}
