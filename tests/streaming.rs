use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{body::Body, extract::Request, routing::post, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tower::ServiceExt;
use vms_proxy::{shim_router, ShimConfig};

#[tokio::test]
async fn test_request_and_response_bodies_stream_through() {
    // Create a counter to track chunks received
    let chunks_received = Arc::new(AtomicUsize::new(0));
    let chunks_received_clone = chunks_received.clone();

    // Create an echo server that will help us test streaming
    let echo = Router::new().route(
        "/vms/stream",
        post(move |body: Body| {
            let chunks_received = chunks_received_clone.clone();
            async move {
                // Echo back the body, counting chunks as they arrive
                let stream = body.into_data_stream().inspect(move |_chunk| {
                    chunks_received.fetch_add(1, Ordering::SeqCst);
                });
                Body::from_stream(stream)
            }
        }),
    );

    // Bind echo server to a random port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Spawn echo server
    tokio::spawn(async move {
        axum::serve(listener, echo).await.unwrap();
    });

    // Create the shim in front of it
    let config = ShimConfig {
        upstream: format!("http://{addr}"),
        ..ShimConfig::default()
    };
    let app = shim_router(&config).unwrap();

    // Create a body that sends chunks with delays
    let body = Body::from_stream(async_stream::stream! {
        // Send first chunk immediately
        yield Ok::<_, std::io::Error>(Bytes::from(vec![b'a'; 1024]));

        // Wait a bit before sending second chunk
        sleep(Duration::from_millis(100)).await;
        yield Ok::<_, std::io::Error>(Bytes::from(vec![b'b'; 1024]));

        // Wait again before sending final chunk
        sleep(Duration::from_millis(100)).await;
        yield Ok::<_, std::io::Error>(Bytes::from(vec![b'c'; 1024]));
    });

    let req = Request::builder()
        .method("POST")
        .uri("/vms/stream")
        .body(body)
        .unwrap();

    // Reset counter before starting
    chunks_received.store(0, Ordering::SeqCst);

    let start_time = std::time::Instant::now();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), 200);

    // Verify that chunks are received over time
    let mut total_bytes = 0;
    let mut chunks_count = 0;
    let mut body = res.into_body().into_data_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.unwrap();
        total_bytes += chunk.len();
        chunks_count += 1;

        // If we're streaming properly, we should receive chunks over time
        // not all at once at the end
        if chunks_count < 3 {
            assert!(
                start_time.elapsed() >= Duration::from_millis(100 * (chunks_count - 1)),
                "Chunks received too quickly, suggesting buffering"
            );
        }
    }

    // Verify we received all the data
    assert_eq!(total_bytes, 3 * 1024);
    assert_eq!(chunks_count, 3, "Should receive exactly 3 chunks");

    // Verify the echo server received chunks over time too
    assert_eq!(
        chunks_received.load(Ordering::SeqCst),
        3,
        "Echo server should receive exactly 3 chunks"
    );
}

#[tokio::test]
async fn test_streamed_response_delivered_incrementally() {
    // Create a test server that trickles its response
    let app = Router::new().route(
        "/vms/events",
        axum::routing::get(|| async {
            Body::from_stream(async_stream::stream! {
                yield Ok::<_, std::io::Error>(Bytes::from_static(b"first\n"));
                sleep(Duration::from_millis(100)).await;
                yield Ok::<_, std::io::Error>(Bytes::from_static(b"second\n"));
            })
        }),
    );

    let test_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let test_addr = test_listener.local_addr().unwrap();
    let test_server = tokio::spawn(async move {
        axum::serve(test_listener, app).await.unwrap();
    });

    // Create the shim in front of it
    let config = ShimConfig {
        upstream: format!("http://{test_addr}"),
        ..ShimConfig::default()
    };
    let app = shim_router(&config).unwrap();

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let proxy_server = tokio::spawn(async move {
        axum::serve(proxy_listener, app).await.unwrap();
    });

    // Read the body as a stream and time the first chunk
    let client = reqwest::Client::new();
    let start_time = std::time::Instant::now();
    let response = client
        .get(format!("http://{proxy_addr}/vms/events"))
        .send()
        .await
        .unwrap();

    let mut stream = response.bytes_stream();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(&first[..], b"first\n");
    assert!(
        start_time.elapsed() < Duration::from_millis(100),
        "First chunk should arrive before the upstream finishes"
    );

    let mut rest = Vec::new();
    while let Some(chunk) = stream.next().await {
        rest.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(&rest[..], b"second\n");

    // Clean up
    proxy_server.abort();
    test_server.abort();
}
