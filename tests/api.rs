//! End-to-end behaviour over real UDP loopback traffic

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::f32::consts::PI;
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

use livesound::{
    audio::spectrum::frequency_bin,
    config::{NetworkConfig, ServerConfig, StreamConfig, TranscoderConfig},
    sources::SourceRegistry,
    stream::StreamBridge,
    ui::WebServer,
};

fn stream_config() -> StreamConfig {
    StreamConfig {
        read_timeout_ms: 20,
        ..Default::default()
    }
}

fn setup() -> (Router, Arc<SourceRegistry>) {
    let network = NetworkConfig {
        listen_address: IpAddr::from([127, 0, 0, 1]),
        recv_buffer_size: Some(1 << 20),
    };
    let registry =
        Arc::new(SourceRegistry::new(stream_config(), network, BTreeMap::new()).unwrap());
    registry.start().unwrap();

    let bridge = StreamBridge::new(TranscoderConfig::default(), stream_config());
    let router = WebServer::new(ServerConfig::default(), registry.clone(), bridge).router();
    (router, registry)
}

async fn request(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn list(router: &Router) -> Value {
    let (status, body) = request(router, Request::get("/sources").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    body
}

/// One second of a sine as s16le mono
fn sine_pcm(frequency: f32, amplitude: f32, sample_rate: u32) -> Vec<u8> {
    (0..sample_rate)
        .map(|n| {
            let t = n as f32 / sample_rate as f32;
            ((2.0 * PI * frequency * t).sin() * amplitude * i16::MAX as f32) as i16
        })
        .flat_map(|s| s.to_le_bytes())
        .collect()
}

fn send_pcm(port: u16, pcm: &[u8], chunk_bytes: usize) {
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for chunk in pcm.chunks(chunk_bytes) {
        sender.send_to(chunk, ("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sine_source_reports_level_and_spectrum() {
    let (router, registry) = setup();

    let (status, body) = request(
        &router,
        Request::post("/sources")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"name": "test_mic", "port": 0}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "added", "name": "test_mic"}));

    let sources = list(&router).await;
    assert_eq!(sources.as_array().unwrap().len(), 1);
    assert_eq!(sources[0]["active"], false);
    assert_eq!(sources[0]["rms_db"], -100.0);

    let port = registry.status("test_mic").unwrap().port;
    let mut spectrogram = registry.subscribe_spectrogram(Some("test_mic")).unwrap();

    let config = stream_config();
    let pcm = sine_pcm(440.0, 0.5, config.sample_rate);
    let chunk_bytes = config.chunk_size * 2;
    tokio::task::spawn_blocking(move || send_pcm(port, &pcm, chunk_bytes))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = registry.status("test_mic").unwrap();
        if status.rms_db > -20.0 {
            assert!(status.active);
            break;
        }
        assert!(Instant::now() < deadline, "level never rose: {}", status.rms_db);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let expected = frequency_bin(440.0, config.fft_window, config.sample_rate);
    let frame = tokio::time::timeout(Duration::from_secs(5), spectrogram.recv())
        .await
        .expect("no spectrum frame")
        .expect("subscription closed");
    assert_eq!(frame.data.len(), config.fft_window / 2);
    let peak = frame.peak_bin().unwrap();
    assert!(peak.abs_diff(expected) <= 1, "peak at bin {peak}, expected {expected}");

    let listed = list(&router).await;
    assert_eq!(listed[0]["spectrogram_subscribers"], 1);
    assert!(listed[0]["packets_received"].as_u64().unwrap() > 0);

    let (status, body) = request(
        &router,
        Request::delete("/sources/test_mic").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "removed", "name": "test_mic"}));
    assert_eq!(list(&router).await, json!([]));

    // Remaining queued frames drain, then the queue reports closure
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while spectrogram.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());

    registry.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_name_keeps_original_port() {
    let (_router, registry) = setup();

    let first = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let second = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

    registry.add_source("mic1", first).unwrap();
    let err = registry.add_source("mic1", second).unwrap_err();
    assert!(err.to_string().contains("already exists"));
    assert_eq!(registry.status("mic1").unwrap().port, first);

    registry.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removal_unblocks_waiting_subscriber() {
    let (_router, registry) = setup();
    registry.add_source("quiet", 0).unwrap();

    let mut spectrogram = registry.subscribe_spectrogram(Some("quiet")).unwrap();
    let waiter = tokio::spawn(async move { spectrogram.recv().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let remover = registry.clone();
    tokio::task::spawn_blocking(move || remover.remove_source("quiet"))
        .await
        .unwrap()
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("subscriber still waiting")
        .unwrap();
    assert!(result.is_none());

    registry.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_source_does_not_affect_neighbour() {
    let (_router, registry) = setup();
    registry.add_source("silent", 0).unwrap();
    registry.add_source("loud", 0).unwrap();

    let port = registry.status("loud").unwrap().port;
    let pcm = sine_pcm(1000.0, 0.8, 48_000);
    tokio::task::spawn_blocking(move || send_pcm(port, &pcm[..16_384], 8192))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !registry.status("loud").unwrap().active {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let silent = registry.status("silent").unwrap();
    assert!(!silent.active);
    assert_eq!(silent.rms_db, -100.0);
    assert_eq!(silent.packets_received, 0);

    registry.stop();
}
