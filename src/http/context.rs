//! Per-connection request loop.
//!
//! # Responsibilities
//! - Drive parse → route → handle → write for each request on a connection
//! - Own the response state and the body writer chain
//! - Turn handler errors into error pages while headers are unsent
//! - Skip unread request bodies so keep-alive connections stay in sync
//! - Emit one access-log line per request
//!
//! # Design Decisions
//! - Requests on one connection are strictly sequential
//! - Errors after the headers went out end the connection
//! - Idle keep-alive waits give way to shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;

use crate::config::{HttpdConfig, LimitsConfig, ValidationError};
use crate::content::{template, MimeTypes};
use crate::fastcgi::{DispatcherRegistry, FastCgiError};
use crate::handlers::{self, BodySource, Outcome};
use crate::http::error::{RequestError, ServerError};
use crate::http::request::{read_request, CgiEnv, ParseOptions, Request, Version};
use crate::http::response::{RequestInfo, ResponseState, SERVER_SOFTWARE};
use crate::http::status;
use crate::http::writer::WriterChain;
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{ConnectionId, ConnectionState};
use crate::observability::metrics;
use crate::routing::matcher::MatchContext;
use crate::routing::{Router, VirtualHost};

/// Read timeout used when a port has no configured default.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything connections share.
#[derive(Debug)]
pub struct ServerContext {
    pub router: Router,
    pub dispatchers: DispatcherRegistry,
    pub mime: MimeTypes,
    pub limits: LimitsConfig,
    pub connect_timeout: Duration,
}

impl ServerContext {
    pub fn from_config(config: &HttpdConfig) -> Result<Self, ValidationError> {
        let connect_timeout = Duration::from_secs(config.fastcgi.connect_timeout_secs);
        Ok(Self {
            router: Router::from_config(config)?,
            dispatchers: DispatcherRegistry::new(config.fastcgi.max_connections_per_target, connect_timeout),
            mime: MimeTypes::new(config.expires.clone()),
            limits: config.limits.clone(),
            connect_timeout,
        })
    }
}

/// A parsed request and the virtual host serving it.
#[derive(Debug)]
pub struct Exchange {
    pub request: Request,
    pub vhost: Arc<VirtualHost>,
}

/// One client connection.
pub struct Connection<S> {
    id: ConnectionId,
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: SocketAddr,
    local: SocketAddr,
    /// Configured port the connection was accepted on.
    port: u16,
    ctx: Arc<ServerContext>,
    base_env: CgiEnv,
    state: ConnectionState,

    // Per request; reset by `clean`.
    response: ResponseState,
    info: RequestInfo,
    chain: Option<WriterChain>,
    bytes_sent: Option<u64>,
    keep_alive: bool,
    force_close: bool,
    body_remaining: u64,
    expects_continue: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        local: SocketAddr,
        port: u16,
        ctx: Arc<ServerContext>,
        id: ConnectionId,
    ) -> Self {
        let (read, writer) = tokio::io::split(stream);
        let mut base_env = CgiEnv::new();
        base_env.set("GATEWAY_INTERFACE", "CGI/1.1");
        base_env.set("SERVER_SOFTWARE", SERVER_SOFTWARE);
        base_env.set("SERVER_ADDR", local.ip().to_string());
        base_env.set("SERVER_PORT", local.port().to_string());
        base_env.set("REMOTE_ADDR", peer.ip().to_string());
        base_env.set("REMOTE_PORT", peer.port().to_string());
        base_env.set("httpd.connection", id.to_string());
        Self {
            id,
            reader: BufReader::new(read),
            writer,
            peer,
            local,
            port,
            ctx,
            base_env,
            state: ConnectionState::AwaitingRequest,
            response: ResponseState::new(),
            info: RequestInfo::default(),
            chain: None,
            bytes_sent: None,
            keep_alive: false,
            force_close: false,
            body_remaining: 0,
            expects_continue: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn response(&self) -> &ResponseState {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseState {
        &mut self.response
    }

    fn set_state(&mut self, state: ConnectionState) {
        tracing::trace!(connection_id = %self.id, from = ?self.state, to = ?state, "Connection state");
        self.state = state;
    }

    /// Reset per-request state and drop the previous writer chain.
    fn clean(&mut self) {
        self.response.clean();
        self.info = RequestInfo::default();
        self.chain = None;
        self.bytes_sent = None;
        self.keep_alive = false;
        self.force_close = false;
        self.body_remaining = 0;
        self.expects_continue = false;
    }

    /// Serve requests until the connection closes or shutdown is signalled.
    pub async fn serve(mut self, mut shutdown: ShutdownSignal) {
        loop {
            self.clean();
            self.set_state(ConnectionState::AwaitingRequest);
            let timeout = self.ctx.router.read_timeout(self.port).unwrap_or(DEFAULT_READ_TIMEOUT);

            let ready = tokio::select! {
                _ = shutdown.recv() => false,
                filled = tokio::time::timeout(timeout, self.reader.fill_buf()) => {
                    matches!(filled, Ok(Ok(buf)) if !buf.is_empty())
                }
            };
            if !ready {
                break;
            }

            match self.serve_request(timeout).await {
                Ok(true) if !shutdown.is_shutdown() => {}
                Ok(_) => break,
                Err(e) if e.is_disconnect() => {
                    tracing::debug!(connection_id = %self.id, error = %e, "Connection dropped");
                    break;
                }
                Err(e) => {
                    tracing::warn!(connection_id = %self.id, peer = %self.peer, error = %e, "Closing connection after error");
                    break;
                }
            }
        }
        self.set_state(ConnectionState::Closed);
        let _ = self.writer.shutdown().await;
    }

    /// Handle one request. `Ok(true)` keeps the connection open.
    async fn serve_request(&mut self, timeout: Duration) -> Result<bool, ServerError> {
        let started = Instant::now();
        self.set_state(ConnectionState::Parsing);
        let opts = ParseOptions {
            timeout,
            max_line_bytes: self.ctx.limits.max_line_bytes,
            max_headers: self.ctx.limits.max_headers,
        };
        let request = match read_request(&mut self.reader, &opts, &self.base_env).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(false),
            Err(RequestError::Http {
                error,
                recoverable,
                request_line,
            }) => {
                self.info.keep_alive = recoverable;
                self.keep_alive = recoverable;
                self.set_state(ConnectionState::Writing);
                let result = self.reply_error(error.status, &error.message).await;
                self.log_access("-", request_line.as_deref().unwrap_or("-"), started);
                result?;
                return Ok(self.keep_alive);
            }
            Err(e) => return Err(e.into()),
        };

        self.set_state(ConnectionState::Routing);
        let Some(vhost) = self.ctx.router.lookup(self.port, request.hostname.as_deref()) else {
            self.info = RequestInfo::from_request(&request, &[]);
            self.keep_alive = self.info.keep_alive;
            let result = self.reply_error(404, status::description(404)).await;
            self.log_access("-", &request.request_line, started);
            result?;
            return Ok(self.keep_alive);
        };
        self.info = RequestInfo::from_request(&request, &vhost.gzip_types);
        self.keep_alive = self.info.keep_alive;
        self.body_remaining = request.content_length.unwrap_or(0);
        self.expects_continue = request.version >= Version::HTTP_11
            && request.headers.has_token("expect", "100-continue");

        let chain = vhost.resolve_handlers(
            &MatchContext {
                host: request.hostname.as_deref(),
                path: &request.path,
            },
            request.port,
        );
        let exchange = Exchange { request, vhost };

        self.set_state(ConnectionState::Handling);
        let mut outcome = Outcome::NoMatch;
        let mut failure = None;
        for step in &chain {
            match handlers::handle(step.handler, self, &exchange, &step.options).await {
                Ok(Outcome::NoMatch) => continue,
                Ok(done) => {
                    outcome = done;
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Writing);
        let result = match failure {
            Some(e) => match self.recover(e).await {
                Ok(()) => self.complete(Outcome::Complete, timeout).await,
                Err(e) => Err(e),
            },
            None => self.complete(outcome, timeout).await,
        };
        self.log_access(&exchange.vhost.display_name(), &exchange.request.request_line, started);
        result?;
        Ok(self.keep_alive && !self.force_close)
    }

    async fn reply_error(&mut self, status: u16, message: &str) -> Result<(), ServerError> {
        self.send_error(status, Some(message)).await?;
        self.finish().await
    }

    async fn complete(&mut self, outcome: Outcome, timeout: Duration) -> Result<(), ServerError> {
        match outcome {
            Outcome::NoMatch => self.send_error(404, None).await?,
            Outcome::Complete => {}
            Outcome::Stream(body) => self.stream_body(body).await?,
        }
        self.finish().await?;
        self.discard_body(timeout).await;
        Ok(())
    }

    async fn stream_body(&mut self, body: BodySource) -> Result<(), ServerError> {
        match body {
            BodySource::Bytes(bytes) => self.write(&bytes).await,
            BodySource::File(mut file) => {
                while let Some(chunk) = file.next_chunk().await? {
                    self.write(&chunk).await?;
                }
                Ok(())
            }
        }
    }

    /// Convert a handler failure into a response while that is still possible.
    async fn recover(&mut self, err: ServerError) -> Result<(), ServerError> {
        if let ServerError::Upstream(e) = &err {
            metrics::record_fastcgi_error(e.kind());
            if !matches!(e, FastCgiError::Connect(_)) {
                // The request body may be half relayed.
                self.force_close = true;
                self.info.keep_alive = false;
            }
        }
        if self.response.headers_sent() {
            return Err(err);
        }
        match err {
            ServerError::Http(e) => self.send_error(e.status, Some(&e.message)).await,
            ServerError::Upstream(FastCgiError::Connect(e)) => {
                tracing::warn!(connection_id = %self.id, error = %e, "FastCGI connect failed");
                self.send_error(502, Some("Failed connecting to FastCGI server")).await
            }
            ServerError::Upstream(FastCgiError::Protocol(message)) => {
                tracing::warn!(connection_id = %self.id, error = %message, "FastCGI protocol error");
                self.send_error(502, Some("Invalid response from FastCGI server")).await
            }
            ServerError::Upstream(e @ (FastCgiError::Timeout | FastCgiError::Io(_) | FastCgiError::PoolClosed)) => {
                tracing::warn!(connection_id = %self.id, error = %e, "FastCGI exchange failed");
                self.send_error(502, Some("FastCGI server did not complete the response")).await
            }
            other => Err(other),
        }
    }

    /// Finalise and send the headers, building the body writer chain.
    pub async fn send_headers(&mut self) -> Result<(), ServerError> {
        let framing = self.response.prepare(&self.info)?;
        self.keep_alive = framing.keep_alive;
        let head = self.response.encode_head();
        self.writer.write_all(&head).await?;
        self.chain = framing
            .body_allowed
            .then(|| WriterChain::new(framing.chunked, framing.gzip));
        self.bytes_sent = Some(0);
        Ok(())
    }

    /// Write body bytes, sending the headers first if needed.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ServerError> {
        if !self.response.headers_sent() {
            self.send_headers().await?;
        }
        if let Some(chain) = self.chain.as_mut() {
            chain.write_all(data)?;
            let out = chain.take_output();
            self.bytes_sent = Some(chain.bytes_out());
            if !out.is_empty() {
                self.writer.write_all(&out).await?;
            }
        }
        Ok(())
    }

    /// Send headers if still pending, close the writer chain and flush.
    pub async fn finish(&mut self) -> Result<(), ServerError> {
        if !self.response.headers_sent() {
            self.send_headers().await?;
        }
        if let Some(mut chain) = self.chain.take() {
            chain.close()?;
            let out = chain.take_output();
            self.bytes_sent = Some(chain.bytes_out());
            self.writer.write_all(&out).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_error(&mut self, status: u16, message: Option<&str>) -> Result<(), ServerError> {
        self.send_error_with(status, message, &[]).await
    }

    /// Replace the response with an error page.
    pub async fn send_error_with(
        &mut self,
        status: u16,
        message: Option<&str>,
        extra_headers: &[(&str, &str)],
    ) -> Result<(), ServerError> {
        self.response.clear_headers()?;
        self.response.set_status(status, None)?;
        for (name, value) in extra_headers {
            self.response.set_header(name, *value)?;
        }
        if status::is_bodiless(status) {
            return Ok(());
        }
        let explain = message.unwrap_or_else(|| status::description(status));
        let page = template::error_page(status, status::reason(status), explain);
        self.response.set_header("Content-Type", "text/html")?;
        self.response.set_header("Content-Length", page.len().to_string())?;
        self.write(page.as_bytes()).await
    }

    pub async fn redirect(&mut self, location: &str, status: u16) -> Result<(), ServerError> {
        self.response.set_status(status, None)?;
        self.response.set_header("Location", location)?;
        let page = template::redirect_page(location);
        self.response.set_header("Content-Type", "text/html")?;
        self.response.set_header("Content-Length", page.len().to_string())?;
        self.write(page.as_bytes()).await
    }

    /// Answer `Expect: 100-continue` before reading the body.
    pub async fn continue_if_expected(&mut self) -> Result<(), ServerError> {
        if self.expects_continue && !self.response.headers_sent() {
            self.writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            self.writer.flush().await?;
            self.expects_continue = false;
        }
        Ok(())
    }

    /// Client stream positioned at the request body.
    pub fn body_reader(&mut self) -> &mut BufReader<ReadHalf<S>> {
        &mut self.reader
    }

    /// Record that a handler read `n` body bytes.
    pub fn mark_body_consumed(&mut self, n: u64) {
        self.body_remaining = self.body_remaining.saturating_sub(n);
    }

    /// Skip what is left of the request body, or give up on keep-alive.
    async fn discard_body(&mut self, timeout: Duration) {
        if self.body_remaining == 0 || !self.keep_alive || self.force_close {
            return;
        }
        if self.expects_continue || self.body_remaining > self.ctx.limits.max_discard_body_bytes {
            self.keep_alive = false;
            return;
        }
        let want = self.body_remaining;
        let mut body = (&mut self.reader).take(want);
        match tokio::time::timeout(timeout, tokio::io::copy(&mut body, &mut tokio::io::sink())).await {
            Ok(Ok(n)) if n == want => self.body_remaining = 0,
            _ => self.keep_alive = false,
        }
    }

    /// Switch to a raw byte relay with `upstream`; the connection closes afterwards.
    pub async fn tunnel(&mut self, upstream: TcpStream) -> Result<(), ServerError> {
        self.response
            .set_status(200, Some("Connection Established".to_string()))?;
        self.response.mark_sent();
        self.writer
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        self.writer.flush().await?;
        self.bytes_sent = Some(0);
        self.force_close = true;
        self.body_remaining = 0;

        let (mut up_read, mut up_write) = upstream.into_split();
        let reader = &mut self.reader;
        let writer = &mut self.writer;
        let upload = async {
            let copied = tokio::io::copy(reader, &mut up_write).await;
            let _ = up_write.shutdown().await;
            copied
        };
        let download = async {
            let copied = tokio::io::copy(&mut up_read, writer).await;
            let _ = writer.shutdown().await;
            copied
        };
        let (up, down) = tokio::join!(upload, download);
        tracing::debug!(
            connection_id = %self.id,
            uploaded = up.as_ref().ok(),
            downloaded = down.as_ref().ok(),
            "Tunnel closed"
        );
        self.bytes_sent = Some(down.unwrap_or(0));
        Ok(())
    }

    fn log_access(&self, vhost: &str, request_line: &str, started: Instant) {
        let status = self.response.status();
        let bytes = self
            .bytes_sent
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        tracing::info!(
            target: "httpd_fcgi::access",
            "{} -> {} \"{}\" {} {}",
            self.peer,
            vhost,
            request_line,
            status,
            bytes
        );
        metrics::record_request(status, started.elapsed());
    }
}
