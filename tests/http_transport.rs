//! HttpTransport against a local mock server
//!
//! Covers header negotiation (Range, If-Range), metadata extraction from
//! 200/206 responses, and how failure statuses are classified.

use futures::StreamExt;
use resumable_dl::config::TransportConfig;
use resumable_dl::{ErrorKind, FetchRequest, FetchResponse, HttpTransport, TransferError, Transport};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BODY: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn transport() -> HttpTransport {
    HttpTransport::new(&TransportConfig {
        connect_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_millis(500),
        user_agent: "resumable-dl-tests".into(),
    })
    .unwrap()
}

fn request(server: &MockServer, offset: u64, validator: Option<&str>) -> FetchRequest {
    FetchRequest {
        url: format!("{}/file.bin", server.uri()),
        offset,
        validator: validator.map(str::to_string),
    }
}

async fn read_body(response: FetchResponse) -> Vec<u8> {
    let mut body = response.body;
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

#[tokio::test]
async fn full_response_reports_length_and_strong_etag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .insert_header("Accept-Ranges", "bytes")
                .set_body_bytes(BODY),
        )
        .mount(&server)
        .await;

    let response = transport().fetch(&request(&server, 0, None)).await.unwrap();
    assert_eq!(response.meta.status, 200);
    assert!(!response.meta.is_partial());
    assert_eq!(response.meta.total_bytes, Some(BODY.len() as u64));
    assert_eq!(response.meta.validator.as_deref(), Some("\"v1\""));
    assert!(response.meta.supports_range);
    assert_eq!(response.meta.start_offset, 0);
    assert_eq!(read_body(response).await, BODY);

    // A fresh request sends no range headers
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(!received[0].headers.contains_key("range"));
    assert!(!received[0].headers.contains_key("if-range"));
}

#[tokio::test]
async fn resume_sends_range_and_if_range() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .and(header("Range", "bytes=10-"))
        .and(header("If-Range", "\"v1\""))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("ETag", "\"v1\"")
                .insert_header("Content-Range", "bytes 10-35/36")
                .set_body_bytes(&BODY[10..]),
        )
        .mount(&server)
        .await;

    let response = transport()
        .fetch(&request(&server, 10, Some("\"v1\"")))
        .await
        .unwrap();
    assert!(response.meta.is_partial());
    assert_eq!(response.meta.start_offset, 10);
    assert_eq!(response.meta.total_bytes, Some(36));
    assert_eq!(response.meta.validator.as_deref(), Some("\"v1\""));
    assert_eq!(read_body(response).await, &BODY[10..]);
}

#[tokio::test]
async fn weak_etag_falls_back_to_last_modified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "W/\"weak\"")
                .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                .set_body_bytes(BODY),
        )
        .mount(&server)
        .await;

    let response = transport().fetch(&request(&server, 0, None)).await.unwrap();
    assert_eq!(
        response.meta.validator.as_deref(),
        Some("Wed, 21 Oct 2015 07:28:00 GMT")
    );
}

#[tokio::test]
async fn partial_response_without_content_range_is_a_stream_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(&BODY[10..]))
        .mount(&server)
        .await;

    let err = transport()
        .fetch(&request(&server, 10, None))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Stream(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Transient);
}

#[tokio::test]
async fn precondition_failed_is_a_stale_validator() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;

    let err = transport()
        .fetch(&request(&server, 10, Some("\"v1\"")))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::PreconditionFailed));
    assert_eq!(err.kind(), ErrorKind::ValidatorStale);
}

#[tokio::test]
async fn range_not_satisfiable_depends_on_offset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(416))
        .mount(&server)
        .await;

    let err = transport()
        .fetch(&request(&server, 50, Some("\"v1\"")))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::RangeNotSatisfiable { offset: 50 }));
    assert_eq!(err.kind(), ErrorKind::ValidatorStale);
}

#[tokio::test]
async fn server_errors_are_transient_and_client_errors_permanent() {
    let server = MockServer::start().await;
    Mock::given(path("/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(path("/slow-down"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let transport = transport();
    let fetch = |name: &str| FetchRequest {
        url: format!("{}/{name}", server.uri()),
        offset: 0,
        validator: None,
    };

    let busy = transport.fetch(&fetch("busy")).await.unwrap_err();
    assert!(matches!(busy, TransferError::HttpStatus { status: 503 }));
    assert_eq!(busy.kind(), ErrorKind::Transient);

    let slow = transport.fetch(&fetch("slow-down")).await.unwrap_err();
    assert_eq!(slow.kind(), ErrorKind::Transient);

    let missing = transport.fetch(&fetch("missing")).await.unwrap_err();
    assert!(matches!(missing, TransferError::HttpStatus { status: 404 }));
    assert_eq!(missing.kind(), ErrorKind::Permanent);
}

#[tokio::test]
async fn slow_headers_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(BODY)
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let err = transport()
        .fetch(&request(&server, 0, None))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Timeout(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Transient);
}

#[tokio::test]
async fn unreachable_host_is_a_transient_connect_error() {
    // Bind then drop a listener so the port is closed
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let request = FetchRequest {
        url: format!("http://127.0.0.1:{port}/file.bin"),
        offset: 0,
        validator: None,
    };

    let err = transport().fetch(&request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient, "{err:?}");
}

#[tokio::test]
async fn unsupported_scheme_is_rejected_before_any_request() {
    let request = FetchRequest {
        url: "ftp://example.com/file.bin".into(),
        offset: 0,
        validator: None,
    };
    let err = transport().fetch(&request).await.unwrap_err();
    assert!(matches!(err, TransferError::InvalidUrl(_)));
    assert_eq!(err.kind(), ErrorKind::Permanent);
}
