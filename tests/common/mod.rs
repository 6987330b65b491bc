//! Common fixtures: an in-process HTTP server that serves model artifacts

#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::routing::get;
use local_llm_manager::ModelDescriptor;
use std::time::Duration;

pub const PAYLOAD_LEN: usize = 256 * 1024;

/// Slow route: this many chunks of `SLOW_CHUNK` bytes, one every `SLOW_DELAY`
pub const SLOW_CHUNKS: usize = 400;
pub const SLOW_CHUNK: usize = 1024;
pub const SLOW_DELAY: Duration = Duration::from_millis(25);

/// Deterministic artifact content
pub fn payload() -> Vec<u8> {
    (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
}

/// Start the artifact server on an ephemeral port and return its base URL
///
/// Routes:
/// - `/model.gguf` full body with content-length
/// - `/redirect` one 302 hop to `/model.gguf`
/// - `/redirect-twice` two hops
/// - `/empty` zero-byte body
/// - `/chunked` body without content-length
/// - `/missing` 404
/// - `/slow` chunked body that takes several seconds
pub async fn spawn_server() -> String {
    let app = Router::new()
        .route("/model.gguf", get(|| async { payload() }))
        .route(
            "/redirect",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/model.gguf")]) }),
        )
        .route(
            "/redirect-twice",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/redirect")]) }),
        )
        .route("/empty", get(|| async { Vec::<u8>::new() }))
        .route(
            "/chunked",
            get(|| async {
                let chunks: Vec<Result<Vec<u8>, std::io::Error>> = payload()
                    .chunks(16 * 1024)
                    .map(|c| Ok(c.to_vec()))
                    .collect();
                Body::from_stream(futures::stream::iter(chunks))
            }),
        )
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .route(
            "/slow",
            get(|| async {
                let stream = futures::stream::unfold(0usize, |i| async move {
                    if i >= SLOW_CHUNKS {
                        return None;
                    }
                    tokio::time::sleep(SLOW_DELAY).await;
                    Some((Ok::<_, std::io::Error>(vec![7u8; SLOW_CHUNK]), i + 1))
                });
                Body::from_stream(stream)
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to read local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Test server failed");
    });

    format!("http://{addr}")
}

/// Catalog entry pointing at a route on the test server
pub fn descriptor(base: &str, route: &str, name: &str, size_bytes: u64) -> ModelDescriptor {
    ModelDescriptor {
        name: name.to_string(),
        display_name: name.to_string(),
        download_url: format!("{base}{route}"),
        size_bytes,
        context_length: 2048,
        description: String::new(),
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
