//! FastCGI pooling behaviour seen from outside the server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod common;

use common::{closed_port, get, server_toml, start_fastcgi_app, start_server, MockReply, RawClient};

fn docroot() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.php"), "<?php").unwrap();
    dir
}

fn fastcgi_toml(root: &std::path::Path, target: &str, per_target: usize) -> String {
    format!(
        "[fastcgi]\nmax_connections_per_target = {}\n\n{}",
        per_target,
        server_toml(
            root,
            &format!("[[servers.fastcgi]]\npattern = '\\.php$'\ntargets = ['{}']\n", target)
        )
    )
}

#[tokio::test]
async fn concurrent_requests_respect_connection_cap() {
    let root = docroot();
    let app = start_fastcgi_app(|_| MockReply {
        stdout: b"Content-Type: text/plain\r\n\r\nok".to_vec(),
        delay: Duration::from_millis(100),
        ..MockReply::default()
    })
    .await;
    let server = start_server(&fastcgi_toml(root.path(), &app.addr.to_string(), 2)).await;

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let addr = server.addr;
        tasks.push(tokio::spawn(async move { get(addr, "/app.php").await }));
    }
    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "ok");
    }

    assert_eq!(app.stats.requests.load(Ordering::SeqCst), 6);
    assert!(app.stats.max_live.load(Ordering::SeqCst) <= 2);
    assert!(app.stats.connections.load(Ordering::SeqCst) <= 2);

    server.stop().await;
}

#[tokio::test]
async fn waiting_callers_are_served_in_arrival_order() {
    let root = docroot();
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let app = start_fastcgi_app(move |request| {
        seen.lock().unwrap().push(request.params["QUERY_STRING"].clone());
        MockReply {
            stdout: b"\r\n".to_vec(),
            delay: Duration::from_millis(150),
            ..MockReply::default()
        }
    })
    .await;
    let server = start_server(&fastcgi_toml(root.path(), &app.addr.to_string(), 1)).await;

    let mut tasks = Vec::new();
    for i in 0..4 {
        let addr = server.addr;
        tasks.push(tokio::spawn(async move {
            get(addr, &format!("/app.php?n={}", i)).await
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().status, 200);
    }

    assert_eq!(*order.lock().unwrap(), vec!["n=0", "n=1", "n=2", "n=3"]);
    assert_eq!(app.stats.connections.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn refused_upstream_is_bad_gateway() {
    let root = docroot();
    let target = format!("127.0.0.1:{}", closed_port().await);
    let server = start_server(&fastcgi_toml(root.path(), &target, 1)).await;

    let mut client = RawClient::connect(server.addr).await;
    client
        .send(b"GET /app.php HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await;
    let response = client.response().await;
    assert_eq!(response.status, 502);
    assert!(response.text().contains("Failed connecting to FastCGI server"));

    // The pool slot was released and the client connection is still usable.
    client
        .send(b"GET /app.php HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await;
    assert_eq!(client.response().await.status, 502);

    server.stop().await;
}

#[tokio::test]
async fn closed_idle_connection_is_replaced() {
    let root = docroot();
    let app = start_fastcgi_app(|_| MockReply {
        stdout: b"Content-Type: text/plain\r\n\r\nfresh".to_vec(),
        close_after: true,
        ..MockReply::default()
    })
    .await;
    let server = start_server(&fastcgi_toml(root.path(), &app.addr.to_string(), 1)).await;

    let mut client = RawClient::connect(server.addr).await;
    for _ in 0..2 {
        client
            .send(b"GET /app.php HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await;
        let response = client.response().await;
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "fresh");
        // Let the upstream close reach the idle worker.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(app.stats.connections.load(Ordering::SeqCst), 2);

    server.stop().await;
}

#[tokio::test]
async fn stalled_upstream_closes_client_connection() {
    let root = docroot();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let app = start_fastcgi_app(move |_| {
        let delay = if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            Duration::from_secs(3)
        } else {
            Duration::ZERO
        };
        MockReply {
            stdout: b"Content-Type: text/plain\r\n\r\nlate".to_vec(),
            delay,
            ..MockReply::default()
        }
    })
    .await;
    let toml = format!(
        "[fastcgi]\nmax_connections_per_target = 1\n\n{}",
        server_toml(
            root.path(),
            &format!(
                "[[servers.fastcgi]]\npattern = '\\.php$'\ntargets = ['{}']\ntimeout_secs = 1\n",
                app.addr
            )
        )
    );
    let server = start_server(&toml).await;

    let mut client = RawClient::connect(server.addr).await;
    client
        .send(b"GET /app.php HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await;
    let response = client.response().await;
    assert_eq!(response.status, 502);
    assert_eq!(response.header("connection"), Some("close"));
    assert!(client.is_closed().await);

    // The stalled worker was dropped rather than returned to the pool.
    let response = get(server.addr, "/app.php").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "late");
    assert_eq!(app.stats.connections.load(Ordering::SeqCst), 2);

    server.stop().await;
}
