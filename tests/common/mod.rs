//! Shared utilities for integration tests: a mock FastCGI application,
//! a server launcher on ephemeral ports and a raw HTTP/1.1 client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use httpd_fcgi::config::parse_config;
use httpd_fcgi::fastcgi::protocol::{self, RecordType};
use httpd_fcgi::HttpServer;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// One request as the mock application received it.
#[derive(Debug, Clone)]
pub struct FcgiRequest {
    pub params: HashMap<String, String>,
    pub stdin: Vec<u8>,
}

/// What the mock application sends back.
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Pause before replying.
    pub delay: Duration,
    /// Drop the upstream connection after replying.
    pub close_after: bool,
}

impl MockReply {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: data.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct AppStats {
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub connections: AtomicUsize,
    pub requests: AtomicUsize,
}

pub struct MockApp {
    pub addr: SocketAddr,
    pub stats: Arc<AppStats>,
}

/// Start a FastCGI responder that answers every request with `respond`.
pub async fn start_fastcgi_app<F>(respond: F) -> MockApp
where
    F: Fn(FcgiRequest) -> MockReply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(AppStats::default());
    let respond = Arc::new(respond);

    let app_stats = stats.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            app_stats.connections.fetch_add(1, Ordering::SeqCst);
            let live = app_stats.live.fetch_add(1, Ordering::SeqCst) + 1;
            app_stats.max_live.fetch_max(live, Ordering::SeqCst);
            let respond = respond.clone();
            let stats = app_stats.clone();
            tokio::spawn(async move {
                serve_app_connection(stream, respond.as_ref(), &stats).await;
                stats.live.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    MockApp { addr, stats }
}

async fn serve_app_connection<F>(mut stream: TcpStream, respond: &F, stats: &AppStats)
where
    F: Fn(FcgiRequest) -> MockReply,
{
    let mut buf = BytesMut::new();
    loop {
        let mut params = Vec::new();
        let mut stdin = Vec::new();
        let request_id = loop {
            if let Some(record) = protocol::decode(&mut buf) {
                match RecordType::from_u8(record.header.record_type) {
                    Some(RecordType::Params) => params.extend_from_slice(&record.content),
                    Some(RecordType::Stdin) if record.content.is_empty() => break Some(record.header.request_id),
                    Some(RecordType::Stdin) => stdin.extend_from_slice(&record.content),
                    _ => {}
                }
                continue;
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => break None,
                Ok(_) => {}
            }
        };
        let Some(request_id) = request_id else {
            return;
        };
        stats.requests.fetch_add(1, Ordering::SeqCst);

        let params = protocol::decode_name_values(&params)
            .unwrap()
            .into_iter()
            .map(|(k, v)| {
                (
                    String::from_utf8_lossy(&k).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            })
            .collect();
        let reply = respond(FcgiRequest { params, stdin });
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }

        let mut out = BytesMut::new();
        protocol::encode_stream(&mut out, RecordType::Stdout, request_id, &reply.stdout, true);
        if !reply.stderr.is_empty() {
            protocol::encode_stream(&mut out, RecordType::Stderr, request_id, &reply.stderr, true);
        }
        protocol::encode_stream(
            &mut out,
            RecordType::EndRequest,
            request_id,
            &protocol::end_request_body(0, protocol::FCGI_REQUEST_COMPLETE),
            false,
        );
        if stream.write_all(&out).await.is_err() {
            return;
        }
        if reply.close_after {
            let _ = stream.shutdown().await;
            return;
        }
    }
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A running server on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(10), self.task).await;
    }
}

/// Start a server from TOML. The first server block's port is served on an
/// ephemeral socket.
pub async fn start_server(toml: &str) -> TestServer {
    let config = parse_config(toml).unwrap();
    let port = config.servers[0].port;
    let server = HttpServer::new(&config).unwrap();
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let listener = server.listener(socket, port);

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run(vec![listener], async move {
        let _ = stopped.await;
    }));
    TestServer {
        addr,
        stop: Some(stop),
        task,
    }
}

/// Minimal server block rooted at `root`, with extra TOML appended.
pub fn server_toml(root: &Path, extra: &str) -> String {
    format!(
        "[[servers]]\nport = 4000\nroot = '{}'\nkeep_alive_timeout_secs = 5\n{}\n",
        root.display(),
        extra
    )
}

/// A parsed response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A keep-alive capable client speaking raw HTTP/1.x.
pub struct RawClient {
    reader: BufReader<TcpStream>,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            reader: BufReader::new(stream),
        }
    }

    pub async fn send(&mut self, raw: &[u8]) {
        self.reader.get_mut().write_all(raw).await.unwrap();
    }

    pub async fn response(&mut self) -> RawResponse {
        tokio::time::timeout(CLIENT_TIMEOUT, self.read_response(false))
            .await
            .unwrap()
    }

    /// Response to a HEAD request: headers only.
    pub async fn head_response(&mut self) -> RawResponse {
        tokio::time::timeout(CLIENT_TIMEOUT, self.read_response(true))
            .await
            .unwrap()
    }

    /// True when the server closes the connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(
            tokio::time::timeout(CLIENT_TIMEOUT, self.reader.read(&mut byte)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    /// Read one raw line, CRLF included.
    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(CLIENT_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line
    }

    pub fn stream_mut(&mut self) -> &mut BufReader<TcpStream> {
        &mut self.reader
    }

    async fn read_response(&mut self, head: bool) -> RawResponse {
        loop {
            let status_line = self.line().await;
            let status: u16 = status_line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| panic!("bad status line {:?}", status_line));

            let mut headers = Vec::new();
            loop {
                let line = self.line().await;
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                let (name, value) = line.split_once(':').unwrap();
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            if status == 100 {
                continue;
            }

            let mut response = RawResponse {
                status,
                headers,
                body: Vec::new(),
            };
            if head || status == 204 || status == 304 {
                return response;
            }
            let chunked = response
                .header("transfer-encoding")
                .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
            if chunked {
                response.body = self.read_chunked().await;
            } else if let Some(len) = response.header("content-length") {
                let mut body = vec![0u8; len.parse().unwrap()];
                self.reader.read_exact(&mut body).await.unwrap();
                response.body = body;
            } else {
                self.reader.read_to_end(&mut response.body).await.unwrap();
            }
            return response;
        }
    }

    async fn read_chunked(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let size_line = self.line().await;
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
            if size == 0 {
                assert_eq!(self.line().await, "\r\n");
                return body;
            }
            let mut chunk = vec![0u8; size + 2];
            self.reader.read_exact(&mut chunk).await.unwrap();
            assert_eq!(&chunk[size..], b"\r\n");
            body.extend_from_slice(&chunk[..size]);
        }
    }
}

/// `GET path` on a fresh connection with `Connection: close`.
pub async fn get(addr: SocketAddr, path: &str) -> RawResponse {
    let mut client = RawClient::connect(addr).await;
    client
        .send(format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path).as_bytes())
        .await;
    client.response().await
}
