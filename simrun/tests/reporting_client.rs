//! Retry behavior of the reporting transport against a local HTTP stub.

mod support;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use simrun::error::{SimrunError, find_simrun_error};
use simrun::io::http::{NULL_BODY, ReportingClient, RetryPolicy, parse_headers};
use support::StubServer;

fn client(max_retries: u32, delay_ms: u64) -> ReportingClient {
    ReportingClient::new(
        &BTreeMap::new(),
        RetryPolicy::new(max_retries, Duration::from_millis(delay_ms)),
    )
    .expect("client")
}

#[test]
fn always_503_exhausts_exactly_max_retries() {
    let server = StubServer::start(|_| (503, "busy".to_string()));
    let url = format!("{}/benchmarks/P/D/T", server.base_url());

    let started = Instant::now();
    let err = client(3, 50).get_verdict(&url).expect_err("exhausted");
    let elapsed = started.elapsed();

    assert_eq!(server.requests().len(), 3);
    assert!(elapsed >= Duration::from_millis(100), "two delays expected, got {elapsed:?}");
    match find_simrun_error(&err) {
        Some(SimrunError::RetryExhausted { url: failed, attempts }) => {
            assert_eq!(failed, &url);
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
}

#[test]
fn empty_success_body_is_null_marker_after_one_attempt() {
    let server = StubServer::start(|_| (200, String::new()));
    let reply = client(5, 1_000)
        .get_verdict(&format!("{}/benchmarks/P/D/T", server.base_url()))
        .expect("reply");
    assert_eq!(reply, NULL_BODY);
    assert_eq!(server.requests().len(), 1);
}

#[test]
fn recovers_after_transient_failures() {
    let server = StubServer::start({
        let calls = std::sync::atomic::AtomicUsize::new(0);
        move |_| {
            if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
                (500, "oops".to_string())
            } else {
                (200, r#"{"meetsRequirement":true}"#.to_string())
            }
        }
    });
    let reply = client(5, 10)
        .get_verdict(&format!("{}/v", server.base_url()))
        .expect("reply");
    assert_eq!(reply, r#"{"meetsRequirement":true}"#);
    assert_eq!(server.requests().len(), 3);
}

#[test]
fn redirect_class_status_is_not_success() {
    let server = StubServer::start(|_| (304, String::new()));
    let err = client(2, 10)
        .get_verdict(&format!("{}/v", server.base_url()))
        .expect_err("304 is a failure");
    assert_eq!(find_simrun_error(&err).map(SimrunError::kind), Some("RetryExhausted"));
    assert_eq!(server.requests().len(), 2);
}

#[test]
fn unreachable_host_exhausts_retries() {
    let err = client(2, 10)
        .get_verdict("http://127.0.0.1:9/unreachable")
        .expect_err("connection refused");
    assert_eq!(find_simrun_error(&err).map(SimrunError::kind), Some("RetryExhausted"));
}

#[test]
fn headers_and_json_body_are_sent() {
    let server = StubServer::start(|_| (200, "ok".to_string()));
    let headers = parse_headers("Authorization:Bearer secret,X-Team:perf").expect("headers");
    let client = ReportingClient::new(&headers, RetryPolicy::default()).expect("client");

    let reply = client
        .post_event(&format!("{}/running-test/end", server.base_url()), r#"{"a":1}"#)
        .expect("reply");
    assert_eq!(reply, "ok");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.url, "/running-test/end");
    assert_eq!(request.body, r#"{"a":1}"#);
    assert_eq!(request.header("Authorization"), Some("Bearer secret"));
    assert_eq!(request.header("X-Team"), Some("perf"));
    assert!(
        request
            .header("Content-Type")
            .is_some_and(|v| v.starts_with("application/json"))
    );
}

#[test]
fn truncated_success_body_is_retried_not_null() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let server = thread::spawn(move || {
        let mut served = 0;
        for stream in listener.incoming().take(2) {
            let mut stream = stream.expect("connection");
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nshort",
            );
            served += 1;
        }
        served
    });

    let err = client(2, 10)
        .get_verdict(&format!("http://127.0.0.1:{port}/benchmarks/P/D/T"))
        .expect_err("no data was obtained");

    assert_eq!(find_simrun_error(&err).map(SimrunError::kind), Some("RetryExhausted"));
    assert_eq!(server.join().expect("server"), 2);
}
