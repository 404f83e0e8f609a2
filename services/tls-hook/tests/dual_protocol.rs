
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harness::{raw_exchange, tls_client_connect, wait_until, HookHandle, RawResponse, MARKER};
use tls_hook::hook::DEFAULT_BODY_TEMPLATE;
use tls_hook::{HookConfig, RedirectConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const PLAIN_REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

fn hook_with(redirect: RedirectConfig) -> HookConfig {
    HookConfig {
        peek_timeout: Duration::from_millis(200),
        redirect,
    }
}

/// Read from a TLS stream until `needle` shows up or the stream ends.
async fn read_until_contains<S>(stream: &mut S, needle: &str) -> String
where
    S: AsyncReadExt + Unpin,
{
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                received.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&received).contains(needle) {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&received).into_owned()
}

async fn tls_get(hook: &HookHandle) -> String {
    let mut tls = tls_client_connect(hook.addr, &hook.cert_der)
        .await
        .expect("TLS handshake should succeed");
    tls.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    tls.flush().await.unwrap();
    timeout(Duration::from_secs(5), read_until_contains(&mut tls, MARKER))
        .await
        .expect("TLS response timed out")
}

#[tokio::test]
async fn plaintext_get_is_redirected_to_https() {
    let hook = HookHandle::spawn(HookConfig::default()).await.unwrap();

    let data = raw_exchange(hook.addr, PLAIN_REQUEST).await.unwrap();
    let response = RawResponse::parse(&data).expect("well-formed HTTP response");

    let url = format!("https://{}/", hook.addr);
    assert_eq!(response.status_line, "HTTP/1.1 302 Found");
    assert_eq!(response.header("Location"), Some(url.as_str()));
    assert!(response.header("Date").unwrap().ends_with(" GMT"));
    assert_eq!(
        response.body,
        DEFAULT_BODY_TEMPLATE.replace("%s", &url).into_bytes()
    );
    assert_eq!(
        response.header("Content-Length"),
        Some(response.body.len().to_string().as_str())
    );
    assert_eq!(hook.stats.handshakes_completed.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn tls_client_is_served_untouched() {
    let hook = HookHandle::spawn(HookConfig::default()).await.unwrap();

    let response = tls_get(&hook).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains(MARKER));
    assert!(!response.contains("Location:"));
    assert_eq!(hook.stats.classified_tls.load(Ordering::Relaxed), 1);
    assert_eq!(hook.stats.handshakes_completed.load(Ordering::Relaxed), 1);
    assert_eq!(hook.stats.redirects_sent.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn stalled_handshake_byte_gets_redirect() {
    let hook = HookHandle::spawn(hook_with(RedirectConfig::default()))
        .await
        .unwrap();

    let mut stream = TcpStream::connect(hook.addr).await.unwrap();
    stream.write_all(&[0x16]).await.unwrap();

    let mut data = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut data))
        .await
        .expect("connection must not hang")
        .unwrap();

    let response = RawResponse::parse(&data).expect("well-formed HTTP response");
    assert_eq!(response.status_line, "HTTP/1.1 302 Found");
    assert_eq!(hook.stats.classify_undecided.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn extra_headers_and_template_reach_the_client() {
    let hook = HookHandle::spawn(hook_with(RedirectConfig {
        redirect_path: "/p".to_string(),
        body_template: "go to %s".to_string(),
        extra_headers: vec![("X-Test".to_string(), "1".to_string())],
        ..Default::default()
    }))
    .await
    .unwrap();

    let data = raw_exchange(hook.addr, PLAIN_REQUEST).await.unwrap();
    let response = RawResponse::parse(&data).expect("well-formed HTTP response");

    assert_eq!(
        String::from_utf8(response.body.clone()).unwrap(),
        format!("go to https://{}/p", hook.addr)
    );
    assert_eq!(response.header("X-Test"), Some("1"));
    let names: Vec<&str> = response.headers.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["Location", "Date", "X-Test", "Content-Length"]);
}

#[tokio::test]
async fn malformed_tls_is_not_redirected() {
    let hook = HookHandle::spawn(HookConfig::default()).await.unwrap();

    let mut stream = TcpStream::connect(hook.addr).await.unwrap();
    // Valid record header, garbage handshake body
    stream
        .write_all(&[0x16, 0x03, 0x01, 0x00, 0x05, 0xff, 0xff, 0xff, 0xff, 0xff])
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    let mut data = Vec::new();
    let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut data))
        .await
        .expect("connection must close");

    assert!(!data.starts_with(b"HTTP/"));
    assert_eq!(hook.stats.redirects_sent.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn silent_client_does_not_block_tls_clients() {
    let hook = HookHandle::spawn(HookConfig {
        peek_timeout: Duration::from_secs(3),
        redirect: RedirectConfig::default(),
    })
    .await
    .unwrap();

    // Connects and says nothing; its task waits out the peek window
    let _silent = TcpStream::connect(hook.addr).await.unwrap();

    let started = Instant::now();
    let response = tls_get(&hook).await;
    assert!(response.contains(MARKER));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn both_protocols_share_one_port() {
    let hook = HookHandle::spawn(hook_with(RedirectConfig {
        status_code: 301,
        ..Default::default()
    }))
    .await
    .unwrap();

    let (plain, tls) = tokio::join!(raw_exchange(hook.addr, PLAIN_REQUEST), tls_get(&hook));

    let plain = RawResponse::parse(&plain.unwrap()).expect("well-formed HTTP response");
    assert_eq!(plain.status_line, "HTTP/1.1 301 Moved Permanently");
    assert!(tls.contains(MARKER));
}

#[tokio::test]
async fn slow_peek_is_not_cut_short_by_handshake_timeout() {
    let hook = HookHandle::spawn_with(
        HookConfig {
            peek_timeout: Duration::from_millis(1500),
            redirect: RedirectConfig::default(),
        },
        Duration::from_millis(500),
    )
    .await
    .unwrap();

    let mut stream = TcpStream::connect(hook.addr).await.unwrap();
    stream.write_all(&[0x16]).await.unwrap();

    let mut data = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut data))
        .await
        .expect("connection must not hang")
        .unwrap();

    let response = RawResponse::parse(&data).expect("well-formed HTTP response");
    assert_eq!(response.status_line, "HTTP/1.1 302 Found");
    assert_eq!(hook.stats.redirects_sent.load(Ordering::Relaxed), 1);
    assert_eq!(hook.stats.handshakes_failed.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn stuck_redirect_is_a_failed_redirect_not_a_failed_handshake() {
    // Far more than the loopback socket buffers hold
    let huge = format!("HTTP/1.1 302 Found\r\nLocation: %s\r\n\r\n{}", "x".repeat(32 << 20));
    let hook = HookHandle::spawn_with(
        hook_with(RedirectConfig {
            raw_response: Some(huge),
            ..Default::default()
        }),
        Duration::from_millis(300),
    )
    .await
    .unwrap();

    // Sends a request and never reads the answer
    let mut stream = TcpStream::connect(hook.addr).await.unwrap();
    stream.write_all(PLAIN_REQUEST).await.unwrap();

    let stats = Arc::clone(&hook.stats);
    assert!(wait_until(|| stats.redirects_failed.load(Ordering::Relaxed) == 1).await);
    assert_eq!(stats.redirects_sent.load(Ordering::Relaxed), 0);
    assert_eq!(stats.handshakes_failed.load(Ordering::Relaxed), 0);
    drop(stream);
}
